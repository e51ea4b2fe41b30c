//! Hardware-independent core library for irlog
//!
//! This crate contains the two protocol drivers of the infrared temperature
//! logger: the PEC-checked MLX90614 read transaction and the SD card
//! mount/file lifecycle, plus the CRC-8 used to validate sensor frames.
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both
//! embedded targets and desktop hosts (for the simulator and tests).

#![no_std]

extern crate alloc;

pub mod config;
pub mod crc;
pub mod sensors;
pub mod storage;
