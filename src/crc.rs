//! CRC-16 (poly 0xA001, init 0xFFFF, reflected) and little-endian byte
//! helpers used by both the serial and TCP codecs.
//!
//! This is the Modbus CRC-16 variant; `crc::CRC_16_MODBUS` computes the
//! same table from its reflected polynomial 0x8005 (= 0xA001 bit-reversed).

use crc::{Crc, CRC_16_MODBUS};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Computes the CRC-16/MODBUS checksum over `bytes`.
pub fn crc16(bytes: &[u8]) -> u16 {
    CRC16.checksum(bytes)
}

/// Reads a little-endian `u16` at `offset`.
///
/// Panics if `offset + 2 > bytes.len()`; callers must bounds-check first,
/// since every call site already knows the frame's minimum length.
pub fn read_u16_le(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

/// Writes `value` little-endian at `offset`.
pub fn write_u16_le(bytes: &mut [u8], offset: usize, value: u16) {
    let b = value.to_le_bytes();
    bytes[offset] = b[0];
    bytes[offset + 1] = b[1];
}
