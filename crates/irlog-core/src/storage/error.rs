use core::fmt::Debug;

use log::error;
use thiserror_no_std::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountError {
    #[error("mount options out of range")]
    InvalidOptions,
    #[error("SD card bus could not be initialised")]
    BusInitFailed,
    #[error("no mountable FAT volume on the card")]
    MountFailed,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateError {
    #[error("no card is mounted")]
    NotMounted,
    #[error("invalid file path")]
    InvalidPath,
    #[error("card is full")]
    Full,
    #[error("SD card error")]
    Device,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    #[error("no card is mounted")]
    NotMounted,
    #[error("invalid file path")]
    InvalidPath,
    #[error("card is full")]
    Full,
    #[error("SD card error")]
    Device,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    #[error("no card is mounted")]
    NotMounted,
    #[error("invalid file path")]
    InvalidPath,
    #[error("file not found")]
    NotFound,
    #[error("SD card error")]
    Device,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendError {
    #[error("no card is mounted")]
    NotMounted,
    #[error("invalid file path")]
    InvalidPath,
    #[error("file not found")]
    NotFound,
    #[error("card is full")]
    Full,
    #[error("SD card error")]
    Device,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteError {
    #[error("no card is mounted")]
    NotMounted,
    #[error("invalid file path")]
    InvalidPath,
    #[error("file not found")]
    NotFound,
    #[error("SD card error")]
    Device,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryError {
    #[error("no card is mounted")]
    NotMounted,
    #[error("unsupported volume layout")]
    Unsupported,
    #[error("SD card error")]
    Device,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatError {
    #[error("card too small for a FAT volume")]
    TooSmall,
    #[error("card too large for a FAT volume")]
    TooLarge,
    #[error("SD card error")]
    Device,
}

/// Outcome of tearing down a session. Never an error: the card is gone from
/// the caller's point of view either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmountStatus {
    Unmounted,
    AlreadyUnmounted,
    /// Volume closed, but the bus could not be released.
    BusReleaseFailed,
}

/// What went wrong inside `embedded-sdmmc`, reduced to what callers act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    NotFound,
    InvalidPath,
    Full,
    Device,
}

impl Fault {
    /// Log the driver error and classify it.
    pub(crate) fn log<E: Debug>(operation: &str, path: &str, e: embedded_sdmmc::Error<E>) -> Self {
        use embedded_sdmmc::Error;

        let fault = match e {
            Error::NotFound => Self::NotFound,
            Error::FilenameError(_) => Self::InvalidPath,
            Error::DiskFull | Error::NotEnoughSpace => Self::Full,
            _ => Self::Device,
        };

        if fault != Self::NotFound {
            error!("SD: {} {} failed: {:?}", operation, path, e);
        }

        fault
    }
}

impl From<Fault> for CreateError {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::InvalidPath => Self::InvalidPath,
            Fault::Full => Self::Full,
            Fault::NotFound | Fault::Device => Self::Device,
        }
    }
}

impl From<Fault> for WriteError {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::InvalidPath => Self::InvalidPath,
            Fault::Full => Self::Full,
            Fault::NotFound | Fault::Device => Self::Device,
        }
    }
}

impl From<Fault> for ReadError {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::NotFound => Self::NotFound,
            Fault::InvalidPath => Self::InvalidPath,
            Fault::Full | Fault::Device => Self::Device,
        }
    }
}

impl From<Fault> for AppendError {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::NotFound => Self::NotFound,
            Fault::InvalidPath => Self::InvalidPath,
            Fault::Full => Self::Full,
            Fault::Device => Self::Device,
        }
    }
}

impl From<Fault> for DeleteError {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::NotFound => Self::NotFound,
            Fault::InvalidPath => Self::InvalidPath,
            Fault::Full | Fault::Device => Self::Device,
        }
    }
}

impl From<CreateError> for AppendError {
    fn from(e: CreateError) -> Self {
        match e {
            CreateError::NotMounted => Self::NotMounted,
            CreateError::InvalidPath => Self::InvalidPath,
            CreateError::Full => Self::Full,
            CreateError::Device => Self::Device,
        }
    }
}
