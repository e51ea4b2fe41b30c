//! Peripheral setup for the logger board.

use esp_hal::Blocking;
use esp_hal::gpio::{AnyPin, Pin};
use esp_hal::i2c::master::{BusTimeout, Config as I2cConfig, ConfigError, I2c};
use esp_hal::peripherals::I2C0;
use esp_hal::time::Rate;
use log::{info, warn};
use thiserror_no_std::Error;

use irlog_core::config::{I2cBusConfig, I2cPins};
use irlog_core::sensors::I2cController;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("pins do not match the board wiring")]
    PinMismatch,
    #[error("bus timeout out of range")]
    TimeoutOutOfRange,
    #[error("controller not configured")]
    NotConfigured,
    #[error("controller already installed")]
    AlreadyInstalled,
    #[error("I2C configuration rejected: {0:?}")]
    Config(ConfigError),
}

/// The I2C0 peripheral with the two pins wired to the sensor.
///
/// Hands out one blocking bus. The pins are fixed at construction, so
/// `configure` only checks that the requested numbers match them.
pub struct EspI2cController {
    parts: Option<(I2C0<'static>, AnyPin<'static>, AnyPin<'static>)>,
    config: Option<I2cConfig>,
}

impl EspI2cController {
    pub fn new(
        i2c0: I2C0<'static>,
        sda: impl Into<AnyPin<'static>>,
        scl: impl Into<AnyPin<'static>>,
    ) -> Self {
        Self {
            parts: Some((i2c0, sda.into(), scl.into())),
            config: None,
        }
    }
}

/// Timeout in SCL periods for `timeout_ms` at `frequency_hz`.
fn timeout_cycles(config: &I2cBusConfig) -> Option<u32> {
    let cycles = u64::from(config.timeout_ms) * u64::from(config.frequency_hz) / 1000;
    u32::try_from(cycles).ok().filter(|&c| c > 0)
}

impl I2cController for EspI2cController {
    type Bus = I2c<'static, Blocking>;
    type Error = ControllerError;

    fn configure(&mut self, pins: I2cPins, config: &I2cBusConfig) -> Result<(), Self::Error> {
        let (_, sda, scl) = self.parts.as_ref().ok_or(ControllerError::AlreadyInstalled)?;
        if sda.number() != pins.sda || scl.number() != pins.scl {
            return Err(ControllerError::PinMismatch);
        }

        // The peripheral always drives SDA/SCL open-drain with the internal
        // pull-ups on.
        if !config.pullups {
            warn!("I2C: internal pull-ups cannot be disabled, external ones are redundant");
        }

        let cycles = timeout_cycles(config).ok_or(ControllerError::TimeoutOutOfRange)?;
        self.config = Some(
            I2cConfig::default()
                .with_frequency(Rate::from_hz(config.frequency_hz))
                .with_timeout(BusTimeout::BusCycles(cycles)),
        );
        Ok(())
    }

    fn install(&mut self) -> Result<Self::Bus, Self::Error> {
        let config = self.config.ok_or(ControllerError::NotConfigured)?;
        let (i2c0, sda, scl) = self.parts.take().ok_or(ControllerError::AlreadyInstalled)?;

        let bus = I2c::new(i2c0, config)
            .map_err(ControllerError::Config)?
            .with_sda(sda)
            .with_scl(scl);
        info!("I2C0 installed as sole master");
        Ok(bus)
    }
}
