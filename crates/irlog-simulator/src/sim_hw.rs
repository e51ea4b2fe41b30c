//! Simulated two-wire controller with an MLX90614 on the bus.

use embedded_hal::i2c::{ErrorKind, ErrorType, I2c, NoAcknowledgeSource, Operation};
use log::debug;

use irlog_core::config::{I2cBusConfig, I2cPins};
use irlog_core::crc::crc8;
use irlog_core::sensors::{ADDRESS, I2cController, OBJECT_TEMPERATURE_REGISTER};

/// Every n-th read comes back with a flipped PEC bit.
const CORRUPT_EVERY: u32 = 7;

/// Every n-th read is not acknowledged.
const NACK_EVERY: u32 = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerError {
    NotConfigured,
    AlreadyInstalled,
}

/// Clock stretch of a healthy sensor, well inside any sane timeout.
const RESPONSE_MS: u32 = 2;

/// A controller that hands out a single [`SimulatedMlx90614`] bus.
#[derive(Debug)]
pub struct SimulatedController {
    config: Option<I2cBusConfig>,
    installed: bool,
    response_ms: u32,
}

impl Default for SimulatedController {
    fn default() -> Self {
        Self {
            config: None,
            installed: false,
            response_ms: RESPONSE_MS,
        }
    }
}

impl SimulatedController {
    /// Make the sensor hold the clock low for `ms` on every transfer.
    #[cfg(test)]
    pub fn with_response_ms(mut self, ms: u32) -> Self {
        self.response_ms = ms;
        self
    }
}

impl I2cController for SimulatedController {
    type Bus = SimulatedMlx90614;
    type Error = ControllerError;

    fn configure(&mut self, pins: I2cPins, config: &I2cBusConfig) -> Result<(), Self::Error> {
        debug!(
            "sim: I2C on SCL={} SDA={} at {} Hz, timeout {} ms",
            pins.scl, pins.sda, config.frequency_hz, config.timeout_ms
        );
        self.config = Some(*config);
        Ok(())
    }

    fn install(&mut self) -> Result<Self::Bus, Self::Error> {
        let config = self.config.ok_or(ControllerError::NotConfigured)?;
        if self.installed {
            return Err(ControllerError::AlreadyInstalled);
        }
        self.installed = true;
        Ok(SimulatedMlx90614 {
            reads: 0,
            response_ms: self.response_ms,
            timeout_ms: config.timeout_ms,
        })
    }
}

/// Sensor answering "read word" requests on register 0x07 with a slowly
/// varying object temperature.
///
/// A transfer whose clock stretch exceeds the controller timeout is abandoned
/// with [`ErrorKind::Other`], as the hardware controller reports it.
#[derive(Debug)]
pub struct SimulatedMlx90614 {
    reads: u32,
    response_ms: u32,
    timeout_ms: u32,
}

impl SimulatedMlx90614 {
    /// Object temperature for the current read, in Celsius.
    fn object_celsius(&self) -> f64 {
        let t = f64::from(self.reads);
        24.0 + 4.0 * (t / 15.0).sin() + 0.3 * (t / 3.0).cos()
    }

    fn frame(&self) -> [u8; 3] {
        let kelvin = self.object_celsius() + 273.15;
        let raw = (kelvin / 0.02).round() as u16;
        let [lsb, msb] = raw.to_le_bytes();

        let mut pec = crc8(&[
            ADDRESS << 1,
            OBJECT_TEMPERATURE_REGISTER,
            (ADDRESS << 1) | 1,
            lsb,
            msb,
        ]);
        if self.reads % CORRUPT_EVERY == 0 {
            pec ^= 0x01;
        }

        [lsb, msb, pec]
    }
}

impl ErrorType for SimulatedMlx90614 {
    type Error = ErrorKind;
}

impl I2c for SimulatedMlx90614 {
    fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        if address != ADDRESS {
            return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address));
        }

        if self.response_ms > self.timeout_ms {
            debug!(
                "sim: transfer timed out after {} ms (sensor needs {} ms)",
                self.timeout_ms, self.response_ms
            );
            return Err(ErrorKind::Other);
        }

        self.reads += 1;
        if self.reads % NACK_EVERY == 0 {
            return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Data));
        }

        let mut register = None;
        for op in operations.iter_mut() {
            match op {
                Operation::Write(bytes) => register = bytes.first().copied(),
                Operation::Read(buf) => {
                    if register != Some(OBJECT_TEMPERATURE_REGISTER) {
                        return Err(ErrorKind::Other);
                    }
                    let frame = self.frame();
                    let len = buf.len().min(frame.len());
                    buf[..len].copy_from_slice(&frame[..len]);
                }
            }
        }

        Ok(())
    }
}
