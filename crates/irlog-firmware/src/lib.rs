//! ESP32-S3 firmware-specific modules for irlog
//!
//! Binds the hardware-independent drivers in `irlog_core` to the esp-hal
//! I2C and SPI peripherals. Only builds for the board.

#![no_std]

pub mod hardware;
