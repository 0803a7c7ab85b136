//! Encode/decode for the inverter's half-duplex serial wire format.
//!
//! Every multi-byte integer on the wire is little-endian, including the
//! per-function payload values — this bridge speaks the vendor dongle's own
//! dialect, not big-endian Modbus RTU.

use crate::crc::{crc16, read_u16_le, write_u16_le};
use crate::error::CodecError;

pub const SERIAL_NUM_LEN: usize = 10;
pub const MAX_REGISTERS: usize = 127;

pub const ADDR_REQUEST: u8 = 0x00;
pub const ADDR_RESPONSE: u8 = 0x01;

pub const FUNC_READ_HOLDING: u8 = 0x03;
pub const FUNC_READ_INPUT: u8 = 0x04;
pub const FUNC_WRITE_SINGLE: u8 = 0x06;
pub const FUNC_WRITE_MULTIPLE: u8 = 0x10;
const EXCEPTION_BIT: u8 = 0x80;

fn validate_count(count: usize) -> Result<(), CodecError> {
    if count == 0 || count > MAX_REGISTERS {
        return Err(CodecError::CountOutOfRange(count));
    }
    Ok(())
}

/// Zero-pads or truncates `serial` to the fixed 10-byte ASCII field.
fn serial_field(serial: &[u8]) -> [u8; SERIAL_NUM_LEN] {
    let mut out = [0u8; SERIAL_NUM_LEN];
    let n = serial.len().min(SERIAL_NUM_LEN);
    out[..n].copy_from_slice(&serial[..n]);
    out
}

/// Encodes a read request (function 0x03 or 0x04): 18 bytes, CRC over the
/// first 16.
pub fn encode_read(function: u8, start: u16, count: u16, serial: &[u8]) -> Result<Vec<u8>, CodecError> {
    validate_count(count as usize)?;
    let mut buf = vec![0u8; 18];
    buf[0] = ADDR_REQUEST;
    buf[1] = function;
    buf[2..12].copy_from_slice(&serial_field(serial));
    write_u16_le(&mut buf, 12, start);
    write_u16_le(&mut buf, 14, count);
    let crc = crc16(&buf[..16]);
    write_u16_le(&mut buf, 16, crc);
    Ok(buf)
}

/// Encodes a write request. A single value takes the 18-byte 0x06 path; two
/// or more values take the 0x10 (write multiple) path of length
/// `17 + 2*N + 2`.
pub fn encode_write(start: u16, values: &[u16], serial: &[u8]) -> Result<Vec<u8>, CodecError> {
    validate_count(values.len())?;
    if values.len() == 1 {
        let mut buf = vec![0u8; 18];
        buf[0] = ADDR_REQUEST;
        buf[1] = FUNC_WRITE_SINGLE;
        buf[2..12].copy_from_slice(&serial_field(serial));
        write_u16_le(&mut buf, 12, start);
        write_u16_le(&mut buf, 14, values[0]);
        let crc = crc16(&buf[..16]);
        write_u16_le(&mut buf, 16, crc);
        Ok(buf)
    } else {
        let n = values.len();
        let byte_count = 2 * n;
        let mut buf = vec![0u8; 17 + byte_count + 2];
        buf[0] = ADDR_REQUEST;
        buf[1] = FUNC_WRITE_MULTIPLE;
        buf[2..12].copy_from_slice(&serial_field(serial));
        write_u16_le(&mut buf, 12, start);
        write_u16_le(&mut buf, 14, n as u16);
        buf[16] = byte_count as u8;
        for (i, v) in values.iter().enumerate() {
            write_u16_le(&mut buf, 17 + 2 * i, *v);
        }
        let crc_end = 17 + byte_count;
        let crc = crc16(&buf[..crc_end]);
        write_u16_le(&mut buf, crc_end, crc);
        Ok(buf)
    }
}

/// Encodes a read response: used to build fakes for tests and for the
/// inverter-identity probe's simulated counterpart.
pub fn encode_read_response(function: u8, start: u16, values: &[u16], serial: &[u8]) -> Result<Vec<u8>, CodecError> {
    validate_count(values.len())?;
    let byte_count = 2 * values.len();
    let mut buf = vec![0u8; 15 + byte_count + 2];
    buf[0] = ADDR_RESPONSE;
    buf[1] = function;
    buf[2..12].copy_from_slice(&serial_field(serial));
    write_u16_le(&mut buf, 12, start);
    buf[14] = byte_count as u8;
    for (i, v) in values.iter().enumerate() {
        write_u16_le(&mut buf, 15 + 2 * i, *v);
    }
    let crc_end = 15 + byte_count;
    let crc = crc16(&buf[..crc_end]);
    write_u16_le(&mut buf, crc_end, crc);
    Ok(buf)
}

/// Encodes a write-single echo response (function 0x06): 18 bytes.
pub fn encode_write_single_response(start: u16, value: u16, serial: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut buf = vec![0u8; 18];
    buf[0] = ADDR_RESPONSE;
    buf[1] = FUNC_WRITE_SINGLE;
    buf[2..12].copy_from_slice(&serial_field(serial));
    write_u16_le(&mut buf, 12, start);
    write_u16_le(&mut buf, 14, value);
    let crc = crc16(&buf[..16]);
    write_u16_le(&mut buf, 16, crc);
    Ok(buf)
}

/// Encodes a write-multiple echo response (function 0x10): 18 bytes,
/// echoing start register and count (not the written values).
pub fn encode_write_multiple_response(start: u16, count: u16, serial: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut buf = vec![0u8; 18];
    buf[0] = ADDR_RESPONSE;
    buf[1] = FUNC_WRITE_MULTIPLE;
    buf[2..12].copy_from_slice(&serial_field(serial));
    write_u16_le(&mut buf, 12, start);
    write_u16_le(&mut buf, 14, count);
    let crc = crc16(&buf[..16]);
    write_u16_le(&mut buf, 16, crc);
    Ok(buf)
}

/// Encodes an exception response (high bit set on the function byte): 15
/// bytes.
pub fn encode_exception_response(function: u8, serial: &[u8], exception_code: u8) -> Vec<u8> {
    let mut buf = vec![0u8; 15];
    buf[0] = ADDR_RESPONSE;
    buf[1] = function | EXCEPTION_BIT;
    buf[2..12].copy_from_slice(&serial_field(serial));
    buf[12] = exception_code;
    let crc = crc16(&buf[..13]);
    write_u16_le(&mut buf, 13, crc);
    buf
}

/// A decoded inverter response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    pub function: u8,
    pub is_exception: bool,
    pub serial: [u8; SERIAL_NUM_LEN],
    pub start_register: u16,
    pub register_count: u16,
    pub values: Vec<u16>,
    pub exception_code: Option<u8>,
    /// `false` when the frame's trailing CRC did not match the computed
    /// value. The frame is still fully parsed and returned — validation
    /// downstream (function/start/count match) is the primary correctness
    /// gate, per design note on CRC-fail lenience.
    pub crc_ok: bool,
    pub raw: Vec<u8>,
}

impl ParsedResponse {
    /// The function code with the exception bit masked off.
    pub fn function_base(&self) -> u8 {
        self.function & 0x7F
    }
}

fn is_supported_function(function_base: u8) -> bool {
    matches!(
        function_base,
        FUNC_READ_HOLDING | FUNC_READ_INPUT | FUNC_WRITE_SINGLE | FUNC_WRITE_MULTIPLE
    )
}

/// Decodes exactly one response frame. `bytes` must be precisely the frame's
/// bytes (typically sliced using [`frame_length`]); a length mismatch is an
/// error rather than being silently truncated or ignored.
pub fn decode_response(bytes: &[u8]) -> Result<ParsedResponse, CodecError> {
    if bytes.len() < 15 {
        return Err(CodecError::TooShort { got: bytes.len(), need: 15 });
    }
    let address = bytes[0];
    if address != ADDR_RESPONSE {
        return Err(CodecError::BadAddress(address));
    }
    let raw_function = bytes[1];
    let is_exception = raw_function & EXCEPTION_BIT != 0;
    let function_base = raw_function & 0x7F;
    if !is_supported_function(function_base) {
        return Err(CodecError::BadFunctionCode(function_base));
    }
    let mut serial = [0u8; SERIAL_NUM_LEN];
    serial.copy_from_slice(&bytes[2..12]);

    if is_exception {
        if bytes.len() != 15 {
            return Err(CodecError::DataFrameLengthMismatch(bytes.len()));
        }
        let exception_code = bytes[12];
        let computed = crc16(&bytes[..13]);
        let expected = read_u16_le(bytes, 13);
        return Ok(ParsedResponse {
            function: raw_function,
            is_exception: true,
            serial,
            start_register: 0,
            register_count: 0,
            values: Vec::new(),
            exception_code: Some(exception_code),
            crc_ok: computed == expected,
            raw: bytes.to_vec(),
        });
    }

    let start_register = read_u16_le(bytes, 12);
    match function_base {
        FUNC_READ_HOLDING | FUNC_READ_INPUT => {
            if bytes.len() < 15 {
                return Err(CodecError::TooShort { got: bytes.len(), need: 15 });
            }
            let byte_count = bytes[14] as usize;
            let expected_len = 17 + byte_count;
            if bytes.len() != expected_len {
                return Err(CodecError::DataFrameLengthMismatch(bytes.len()));
            }
            let register_count = (byte_count / 2) as u16;
            let mut values = Vec::with_capacity(register_count as usize);
            for i in 0..register_count as usize {
                values.push(read_u16_le(bytes, 15 + 2 * i));
            }
            let computed = crc16(&bytes[..expected_len - 2]);
            let expected = read_u16_le(bytes, expected_len - 2);
            Ok(ParsedResponse {
                function: raw_function,
                is_exception: false,
                serial,
                start_register,
                register_count,
                values,
                exception_code: None,
                crc_ok: computed == expected,
                raw: bytes.to_vec(),
            })
        }
        FUNC_WRITE_SINGLE => {
            if bytes.len() != 18 {
                return Err(CodecError::DataFrameLengthMismatch(bytes.len()));
            }
            let value = read_u16_le(bytes, 14);
            let computed = crc16(&bytes[..16]);
            let expected = read_u16_le(bytes, 16);
            Ok(ParsedResponse {
                function: raw_function,
                is_exception: false,
                serial,
                start_register,
                register_count: 1,
                values: vec![value],
                exception_code: None,
                crc_ok: computed == expected,
                raw: bytes.to_vec(),
            })
        }
        FUNC_WRITE_MULTIPLE => {
            if bytes.len() != 18 {
                return Err(CodecError::DataFrameLengthMismatch(bytes.len()));
            }
            let register_count = read_u16_le(bytes, 14);
            let computed = crc16(&bytes[..16]);
            let expected = read_u16_le(bytes, 16);
            Ok(ParsedResponse {
                function: raw_function,
                is_exception: false,
                serial,
                start_register,
                register_count,
                values: Vec::new(),
                exception_code: None,
                crc_ok: computed == expected,
                raw: bytes.to_vec(),
            })
        }
        _ => unreachable!("checked by is_supported_function above"),
    }
}

/// Computes the length of the frame starting at `header_prefix[0]`, or 0 if
/// not yet decidable from the bytes available. `available` is the number of
/// bytes currently buffered (equal to `header_prefix.len()` in normal use;
/// kept as an explicit parameter so callers can reason about it without
/// recomputing `.len()` at each call site).
pub fn frame_length(header_prefix: &[u8], available: usize) -> usize {
    if available < 2 || header_prefix.len() < 2 {
        return 0;
    }
    let addr = header_prefix[0];
    if addr == ADDR_REQUEST {
        return 18;
    }
    if addr != ADDR_RESPONSE {
        return 0;
    }
    let raw_function = header_prefix[1];
    let is_exception = raw_function & EXCEPTION_BIT != 0;
    let function_base = raw_function & 0x7F;
    if is_exception {
        return 15;
    }
    match function_base {
        FUNC_READ_HOLDING | FUNC_READ_INPUT => {
            if available < 15 || header_prefix.len() < 15 {
                return 0;
            }
            let byte_count = header_prefix[14] as usize;
            17 + byte_count
        }
        FUNC_WRITE_SINGLE | FUNC_WRITE_MULTIPLE => 18,
        _ => 0,
    }
}

/// One frame located inside a byte span by [`split_frames`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameDescriptor {
    pub offset: usize,
    pub length: usize,
    pub is_request: bool,
    /// Populated for responses only; `None` for requests and for responses
    /// that failed to decode (which still count as "a frame was here" for
    /// forward-progress purposes, but carry nothing to match against).
    pub parsed: Option<ParsedResponse>,
}

/// Walks `bytes` left to right, classifying and extracting frames.
/// Guarantees forward progress: each iteration either consumes a full frame
/// or advances by one byte.
pub fn split_frames(bytes: &[u8]) -> Vec<FrameDescriptor> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let remaining = &bytes[offset..];
        if remaining.len() < 2 {
            break;
        }
        let addr = remaining[0];
        if addr != ADDR_REQUEST && addr != ADDR_RESPONSE {
            offset += 1;
            continue;
        }
        let length = frame_length(remaining, remaining.len());
        if length == 0 {
            offset += 1;
            continue;
        }
        if remaining.len() < length {
            break;
        }
        let frame_bytes = &remaining[..length];
        let is_request = addr == ADDR_REQUEST;
        let parsed = if is_request { None } else { decode_response(frame_bytes).ok() };
        out.push(FrameDescriptor { offset, length, is_request, parsed });
        offset += length;
    }
    out
}

/// Scans `descriptors` for the first response whose function and start
/// register match the originating request. Exception responses match on
/// `function & 0x7F` alone, since they carry no start register on the wire.
pub fn find_matching_response(
    descriptors: &[FrameDescriptor],
    expected_function: u8,
    expected_start: u16,
) -> Option<usize> {
    let expected_base = expected_function & 0x7F;
    descriptors.iter().position(|d| {
        let Some(parsed) = &d.parsed else { return false };
        if parsed.function_base() != expected_base {
            return false;
        }
        parsed.is_exception || parsed.start_register == expected_start
    })
}
