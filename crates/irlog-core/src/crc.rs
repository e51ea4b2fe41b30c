//! CRC-8 used as the SMBus Packet Error Code (PEC).
//!
//! Polynomial `0x07`, MSB first, not reflected, zero initial value and no
//! final XOR (CRC-8/SMBUS).

/// Generator polynomial x^8 + x^2 + x + 1
pub const POLYNOMIAL: u8 = 0x07;

/// Compute the CRC-8 of `bytes`, one bit at a time.
pub fn crc8(bytes: &[u8]) -> u8 {
    let mut crc = 0u8;

    for &byte in bytes {
        crc ^= byte;
        for _ in 0..8 {
            if crc & 0x80 != 0 {
                crc = (crc << 1) ^ POLYNOMIAL;
            } else {
                crc <<= 1;
            }
        }
    }

    crc
}
