//! Init-time options for the two buses.
//!
//! These are plain values handed to `mount` and `Mlx90614::init`; nothing
//! here is loaded or persisted at runtime.

/// Highest GPIO number accepted for bus pins.
pub const MAX_GPIO: u8 = 48;

/// Maximum number of files the volume manager can hold open.
pub const MAX_OPEN_FILES: usize = 4;

/// Smallest and largest FAT allocation unit accepted when formatting.
pub const MIN_ALLOCATION_UNIT: u32 = 512;
pub const MAX_ALLOCATION_UNIT: u32 = 64 * 1024;

/// Pins of the four-wire bus the SD card sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiPins {
    pub clk: u8,
    pub mosi: u8,
    pub miso: u8,
    pub cs: u8,
}

impl SpiPins {
    pub const fn new(clk: u8, mosi: u8, miso: u8, cs: u8) -> Self {
        Self {
            clk,
            mosi,
            miso,
            cs,
        }
    }

    /// Every pin is in range and no pin is used twice.
    pub fn is_valid(&self) -> bool {
        let pins = [self.clk, self.mosi, self.miso, self.cs];
        pins.iter().all(|&p| p <= MAX_GPIO)
            && pins
                .iter()
                .enumerate()
                .all(|(i, p)| !pins[i + 1..].contains(p))
    }
}

/// Pins of the two-wire bus the sensor sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct I2cPins {
    pub scl: u8,
    pub sda: u8,
}

impl I2cPins {
    pub const fn new(scl: u8, sda: u8) -> Self {
        Self { scl, sda }
    }

    pub fn is_valid(&self) -> bool {
        self.scl <= MAX_GPIO && self.sda <= MAX_GPIO && self.scl != self.sda
    }
}

/// Options used when mounting the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountOptions {
    /// Write a fresh FAT volume when the card cannot be mounted.
    pub format_if_mount_failed: bool,
    /// Upper bound on simultaneously open files, at most [`MAX_OPEN_FILES`].
    ///
    /// Only range-checked at mount. Every session operation holds at most
    /// one file open, so any valid value behaves the same.
    pub max_open_files: usize,
    /// Cluster size in bytes, only used when formatting.
    pub allocation_unit_size: u32,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            format_if_mount_failed: true,
            max_open_files: MAX_OPEN_FILES,
            allocation_unit_size: 16 * 1024,
        }
    }
}

impl MountOptions {
    pub const fn with_format_if_mount_failed(mut self, format: bool) -> Self {
        self.format_if_mount_failed = format;
        self
    }

    pub const fn with_max_open_files(mut self, max_open_files: usize) -> Self {
        self.max_open_files = max_open_files;
        self
    }

    pub const fn with_allocation_unit_size(mut self, bytes: u32) -> Self {
        self.allocation_unit_size = bytes;
        self
    }

    pub fn is_valid(&self) -> bool {
        (1..=MAX_OPEN_FILES).contains(&self.max_open_files)
            && self.allocation_unit_size.is_power_of_two()
            && (MIN_ALLOCATION_UNIT..=MAX_ALLOCATION_UNIT).contains(&self.allocation_unit_size)
    }
}

/// Two-wire bus controller settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct I2cBusConfig {
    pub frequency_hz: u32,
    /// Bound on a single transaction, including clock stretching.
    pub timeout_ms: u32,
    pub pullups: bool,
}

impl Default for I2cBusConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 100_000,
            timeout_ms: 1000,
            pullups: true,
        }
    }
}

impl I2cBusConfig {
    pub const fn with_frequency(mut self, frequency_hz: u32) -> Self {
        self.frequency_hz = frequency_hz;
        self
    }

    pub const fn with_timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spi_pins() {
        assert!(SpiPins::new(12, 11, 13, 10).is_valid());
        assert!(!SpiPins::new(12, 11, 13, 12).is_valid());
        assert!(!SpiPins::new(12, 11, 13, 60).is_valid());
    }

    #[test]
    fn test_i2c_pins() {
        assert!(I2cPins::new(16, 15).is_valid());
        assert!(!I2cPins::new(15, 15).is_valid());
    }

    #[test]
    fn test_mount_options_validation() {
        assert!(MountOptions::default().is_valid());
        assert!(!MountOptions::default().with_max_open_files(0).is_valid());
        assert!(!MountOptions::default().with_max_open_files(5).is_valid());
        assert!(!MountOptions::default().with_allocation_unit_size(3000).is_valid());
        assert!(!MountOptions::default().with_allocation_unit_size(256).is_valid());
        assert!(MountOptions::default().with_allocation_unit_size(512).is_valid());
    }
}
