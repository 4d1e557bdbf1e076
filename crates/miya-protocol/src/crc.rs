//! CRC16-CCITT as computed by the MIYA HRV controller board
//!
//! Polynomial 0x1021, initial value 0x0000, MSB first, no final XOR
//! (the variant also known as CRC-16/XMODEM). The checksum covers every
//! byte of a standard frame before the two CRC bytes and is transmitted
//! big-endian.

use crate::types::ProtocolError;

const POLYNOMIAL: u16 = 0x1021;

/// Calculate the CRC16 of `data`
#[must_use]
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        let mut current = u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if (crc ^ current) & 0x8000 != 0 {
                (crc << 1) ^ POLYNOMIAL
            } else {
                crc << 1
            };
            current <<= 1;
        }
    }
    crc
}

/// CRC16 of `data` as two big-endian bytes (high byte first)
#[must_use]
pub fn crc16_bytes(data: &[u8]) -> [u8; 2] {
    crc16(data).to_be_bytes()
}

/// Check `data` against an expected CRC value
#[must_use]
pub fn verify(data: &[u8], expected: u16) -> bool {
    crc16(data) == expected
}

/// Check `data` against a big-endian CRC byte pair
///
/// A mismatch is `Ok(false)`; only a pair that is not exactly two bytes
/// long is an error.
pub fn verify_bytes(data: &[u8], crc: &[u8]) -> Result<bool, ProtocolError> {
    let pair: [u8; 2] = crc.try_into().map_err(|_| {
        ProtocolError::Format(format!("CRC must be 2 bytes, got {}", crc.len()))
    })?;
    Ok(verify(data, u16::from_be_bytes(pair)))
}
