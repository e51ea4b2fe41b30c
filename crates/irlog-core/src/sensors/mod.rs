mod mlx90614;

use embedded_hal::i2c::{ErrorKind, I2c};
use thiserror_no_std::Error;

use crate::config::{I2cBusConfig, I2cPins};

pub use mlx90614::*;

/// Errors raised while bringing up the two-wire bus.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    #[error("bus parameters rejected by the controller")]
    ConfigInvalid,
    #[error("bus controller could not be claimed")]
    DriverInstallFailed,
}

/// Errors raised by a single temperature read.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    /// The transaction did not complete (NACK, arbitration loss, timeout...).
    #[error("bus transaction failed: {0:?}")]
    BusError(ErrorKind),
    /// The frame arrived but its PEC does not match.
    #[error("PEC mismatch (computed {computed:#04x}, received {received:#04x})")]
    IntegrityCheckFailed { computed: u8, received: u8 },
}

/// A two-wire bus controller that can be set up as the sole bus master.
///
/// Setup is split the way most vendor HALs split it: parameters are checked
/// and applied first, then the controller is claimed and handed out as an
/// [`I2c`] bus. Implementations must apply `timeout_ms` to every transaction
/// issued through the returned bus.
pub trait I2cController {
    type Bus: I2c;
    type Error: core::fmt::Debug;

    /// Apply pins, pull-ups, clock and timeout.
    fn configure(&mut self, pins: I2cPins, config: &I2cBusConfig) -> Result<(), Self::Error>;

    /// Claim the controller. Fails if it is already owned.
    fn install(&mut self) -> Result<Self::Bus, Self::Error>;
}
