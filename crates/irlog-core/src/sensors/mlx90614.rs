use core::fmt::Write;

use embedded_hal::i2c::{Error as _, I2c};
use log::{debug, error, info};

use super::{I2cController, InitError, ReadError};
use crate::config::{I2cBusConfig, I2cPins};
use crate::crc::crc8;

/// 7-bit bus address of the sensor
pub const ADDRESS: u8 = 0x5A;

/// RAM register holding the object temperature (Tobj1)
pub const OBJECT_TEMPERATURE_REGISTER: u8 = 0x07;

/// Qualified clock for the SMBus interface
pub const DEFAULT_FREQUENCY_HZ: u32 = 100_000;

/// SMBus clock limits supported by the sensor
pub const MIN_FREQUENCY_HZ: u32 = 10_000;
pub const MAX_FREQUENCY_HZ: u32 = 100_000;

/// Bound on one read transaction
pub const TRANSACTION_TIMEOUT_MS: u32 = 1000;

const WRITE_ADDRESS: u8 = ADDRESS << 1;
const READ_ADDRESS: u8 = (ADDRESS << 1) | 1;

const KELVIN_PER_LSB: f32 = 0.02;
const KELVIN_OFFSET: f32 = 273.15;
const FAHRENHEIT_MULTIPLIER: f32 = 1.8;
const FAHRENHEIT_OFFSET: f32 = 32.0;

/// Longest record is `celsius=-273.15` / `celsius=1037.55`.
pub const RECORD_CAPACITY: usize = 24;

/// A validated object temperature reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureSample {
    celsius: f32,
    fahrenheit: f32,
}

impl TemperatureSample {
    /// Convert a raw 0.02 K/LSB reading.
    pub(crate) fn from_raw(raw: u16) -> Self {
        let kelvin = f32::from(raw) * KELVIN_PER_LSB;
        let celsius = kelvin - KELVIN_OFFSET;

        Self {
            celsius,
            fahrenheit: FAHRENHEIT_MULTIPLIER * celsius + FAHRENHEIT_OFFSET,
        }
    }

    pub fn celsius(&self) -> f32 {
        self.celsius
    }

    pub fn fahrenheit(&self) -> f32 {
        self.fahrenheit
    }

    /// Render the `celsius=<value>` line appended to the log file.
    pub fn to_record(&self) -> heapless::String<RECORD_CAPACITY> {
        let mut record = heapless::String::new();
        // Cannot overflow: every representable reading fits in RECORD_CAPACITY.
        let _ = write!(record, "celsius={:.2}", self.celsius);
        record
    }
}

/// The bytes covered by the PEC of an SMBus "read word" transaction.
struct TransactionFrame([u8; 5]);

impl TransactionFrame {
    fn new(lsb: u8, msb: u8) -> Self {
        Self([
            WRITE_ADDRESS,
            OBJECT_TEMPERATURE_REGISTER,
            READ_ADDRESS,
            lsb,
            msb,
        ])
    }

    fn pec(&self) -> u8 {
        crc8(&self.0)
    }
}

/// MLX90614 infrared thermometer on an SMBus/I2C bus.
///
/// Holding a value of this type means the bus is configured; every read is
/// independent of the previous ones.
pub struct Mlx90614<I> {
    i2c: I,
}

impl<I: I2c> Mlx90614<I> {
    /// Wrap a bus that is already configured for the sensor.
    pub fn new(i2c: I) -> Self {
        Self { i2c }
    }

    /// Configure `controller` as sole bus master and claim it for the sensor.
    pub fn init<C>(controller: &mut C, pins: I2cPins, clock_hz: u32) -> Result<Self, InitError>
    where
        C: I2cController<Bus = I>,
    {
        if !(MIN_FREQUENCY_HZ..=MAX_FREQUENCY_HZ).contains(&clock_hz) {
            error!("MLX90614: clock {} Hz outside supported range", clock_hz);
            return Err(InitError::ConfigInvalid);
        }
        if !pins.is_valid() {
            error!("MLX90614: invalid bus pins {:?}", pins);
            return Err(InitError::ConfigInvalid);
        }

        let config = I2cBusConfig::default()
            .with_frequency(clock_hz)
            .with_timeout_ms(TRANSACTION_TIMEOUT_MS);

        controller.configure(pins, &config).map_err(|e| {
            error!("MLX90614: bus configuration rejected: {:?}", e);
            InitError::ConfigInvalid
        })?;

        let i2c = controller.install().map_err(|e| {
            error!("MLX90614: failed to claim bus controller: {:?}", e);
            InitError::DriverInstallFailed
        })?;

        info!(
            "MLX90614: bus ready (SCL={}, SDA={}, {} Hz)",
            pins.scl, pins.sda, clock_hz
        );

        Ok(Self::new(i2c))
    }

    /// Read the object temperature in one PEC-checked transaction.
    pub fn read_temperature(&mut self) -> Result<TemperatureSample, ReadError> {
        // lsb, msb, pec
        let mut data = [0u8; 3];

        self.i2c
            .write_read(ADDRESS, &[OBJECT_TEMPERATURE_REGISTER], &mut data)
            .map_err(|e| {
                error!("MLX90614: read transaction failed: {:?}", e);
                ReadError::BusError(e.kind())
            })?;

        let [lsb, msb, received] = data;
        let computed = TransactionFrame::new(lsb, msb).pec();

        if computed != received {
            error!(
                "MLX90614: PEC mismatch (computed {:#04x}, received {:#04x})",
                computed, received
            );
            return Err(ReadError::IntegrityCheckFailed { computed, received });
        }

        let sample = TemperatureSample::from_raw(u16::from_le_bytes([lsb, msb]));
        debug!("MLX90614: {:.2} C / {:.2} F", sample.celsius, sample.fahrenheit);

        Ok(sample)
    }

    /// Give the bus back.
    pub fn release(self) -> I {
        self.i2c
    }
}
