//! Encode/decode for the client (vendor-dongle-emulation) wire format.
//!
//! The "data frame" embedded in a client frame is structurally identical to
//! an inverter serial frame, minus the inverter's own trailing CRC, plus a
//! fresh CRC computed over just that span. The data-frame-length field on
//! the wire counts that span *including* its own 2-byte CRC slot.

use crate::crc::{crc16, read_u16_le, write_u16_le};
use crate::error::CodecError;
use crate::serial_codec::{self, FUNC_READ_HOLDING, FUNC_READ_INPUT, FUNC_WRITE_MULTIPLE, FUNC_WRITE_SINGLE};

const MAGIC: [u8; 2] = [0xA1, 0x1A];
const VERSION_REQUEST: u16 = 2;
const VERSION_RESPONSE: u16 = 5;
const DONGLE_FUNCTION: u8 = 0xC2;
const RESERVED: u8 = 1;
pub(crate) const MIN_REQUEST_LEN: usize = 38;
const SERIAL_LEN: usize = 10;

fn serial_field(serial: &[u8]) -> [u8; SERIAL_LEN] {
    let mut out = [0u8; SERIAL_LEN];
    let n = serial.len().min(SERIAL_LEN);
    out[..n].copy_from_slice(&serial[..n]);
    out
}

/// A decoded client request, plus a convenience pre-built encoding of the
/// equivalent inverter-protocol request (serial-number field zeroed — the
/// serial arbiter fills that in with the currently detected inverter serial
/// when it actually dispatches).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedClientRequest {
    pub dongle_serial: [u8; SERIAL_LEN],
    pub inverter_serial: [u8; SERIAL_LEN],
    pub function: u8,
    pub start_register: u16,
    pub is_write: bool,
    pub register_count: u16,
    pub values: Vec<u16>,
    pub inverter_request_encoding: Vec<u8>,
}

fn validate_count(count: usize) -> Result<(), CodecError> {
    if count == 0 || count > serial_codec::MAX_REGISTERS {
        return Err(CodecError::CountOutOfRange(count));
    }
    Ok(())
}

/// Decodes a client request frame. Validates total length, the magic
/// prefix, the nested dongle function byte, and the CRC over the embedded
/// data frame; a CRC mismatch fails the decode outright (unlike the serial
/// codec's lenient handling).
pub fn decode_request(bytes: &[u8]) -> Result<ParsedClientRequest, CodecError> {
    if bytes.len() < MIN_REQUEST_LEN {
        return Err(CodecError::TooShort { got: bytes.len(), need: MIN_REQUEST_LEN });
    }
    if bytes[0..2] != MAGIC {
        return Err(CodecError::BadMagic([bytes[0], bytes[1]]));
    }
    let version = read_u16_le(bytes, 2);
    if version != VERSION_REQUEST {
        return Err(CodecError::BadVersion { got: version, expected: VERSION_REQUEST });
    }
    if bytes[7] != DONGLE_FUNCTION {
        return Err(CodecError::BadDongleFunction(bytes[7]));
    }
    let dongle_serial = serial_field(&bytes[8..18]);

    let data_frame_length = read_u16_le(bytes, 18) as usize;
    if data_frame_length < 18 {
        return Err(CodecError::TooShort { got: data_frame_length, need: 18 });
    }
    if bytes.len() < 20 + data_frame_length {
        return Err(CodecError::TooShort { got: bytes.len(), need: 20 + data_frame_length });
    }
    let data_frame = &bytes[20..20 + data_frame_length];

    let crc_span = data_frame_length - 2;
    let computed = crc16(&data_frame[..crc_span]);
    let expected = read_u16_le(data_frame, crc_span);
    if computed != expected {
        return Err(CodecError::CrcMismatch { expected, computed });
    }

    // data_frame layout mirrors the inverter frame's: [action|func|serial(10)|start(2)|...]
    let function = data_frame[1];
    let inverter_serial = serial_field(&data_frame[2..12]);
    let start_register = read_u16_le(data_frame, 12);
    let count_or_value = read_u16_le(data_frame, 14);

    let (is_write, register_count, values) = match function {
        FUNC_READ_HOLDING | FUNC_READ_INPUT => (false, count_or_value, Vec::new()),
        FUNC_WRITE_SINGLE => (true, 1u16, vec![count_or_value]),
        FUNC_WRITE_MULTIPLE => {
            let n = count_or_value;
            let byte_count = data_frame[16] as usize;
            let values_start = 17;
            if data_frame.len() < values_start + byte_count {
                return Err(CodecError::DataFrameLengthMismatch(data_frame.len()));
            }
            let mut values = Vec::with_capacity(n as usize);
            for i in 0..(byte_count / 2) {
                values.push(read_u16_le(data_frame, values_start + 2 * i));
            }
            (true, n, values)
        }
        other => return Err(CodecError::BadFunctionCode(other)),
    };

    let effective_count = if is_write && function == FUNC_WRITE_MULTIPLE { values.len() } else { register_count as usize };
    validate_count(effective_count)?;

    let inverter_request_encoding = if is_write {
        serial_codec::encode_write(start_register, &values, &[0u8; SERIAL_LEN])?
    } else {
        serial_codec::encode_read(function, start_register, register_count, &[0u8; SERIAL_LEN])?
    };

    Ok(ParsedClientRequest {
        dongle_serial,
        inverter_serial,
        function,
        start_register,
        is_write,
        register_count,
        values,
        inverter_request_encoding,
    })
}

/// Builds a request frame: used by tests to exercise the encode/decode
/// duality property and by any harness that needs to emulate a client.
pub fn encode_read_request(dongle_serial: &[u8], inverter_serial: &[u8], function: u8, start: u16, count: u16) -> Vec<u8> {
    build_request_frame(dongle_serial, inverter_serial, function, start, count, None)
}

/// Builds a write request frame (single- or multi-value, matching the
/// serial codec's own split on `values.len()`).
pub fn encode_write_request(dongle_serial: &[u8], inverter_serial: &[u8], start: u16, values: &[u16]) -> Vec<u8> {
    let function = if values.len() == 1 { FUNC_WRITE_SINGLE } else { FUNC_WRITE_MULTIPLE };
    let count_or_value = if values.len() == 1 { values[0] } else { values.len() as u16 };
    build_request_frame(dongle_serial, inverter_serial, function, start, count_or_value, Some(values))
}

fn build_request_frame(
    dongle_serial: &[u8],
    inverter_serial: &[u8],
    function: u8,
    start: u16,
    count_or_value: u16,
    multi_values: Option<&[u16]>,
) -> Vec<u8> {
    let data_frame_body_len = match (function, multi_values) {
        (FUNC_WRITE_MULTIPLE, Some(values)) => 17 + 2 * values.len(),
        _ => 16,
    };
    let data_frame_len = data_frame_body_len + 2;
    let total_len = 20 + data_frame_len;
    let mut buf = vec![0u8; total_len];
    buf[0..2].copy_from_slice(&MAGIC);
    write_u16_le(&mut buf, 2, VERSION_REQUEST);
    write_u16_le(&mut buf, 4, (total_len - 6) as u16);
    buf[6] = RESERVED;
    buf[7] = DONGLE_FUNCTION;
    buf[8..18].copy_from_slice(&serial_field(dongle_serial));
    write_u16_le(&mut buf, 18, data_frame_len as u16);

    buf[20] = 0; // action
    buf[21] = function;
    buf[22..32].copy_from_slice(&serial_field(inverter_serial));
    write_u16_le(&mut buf, 32, start);
    write_u16_le(&mut buf, 34, count_or_value);
    if let Some(values) = multi_values.filter(|_| function == FUNC_WRITE_MULTIPLE) {
        buf[36] = (2 * values.len()) as u8;
        for (i, v) in values.iter().enumerate() {
            write_u16_le(&mut buf, 37 + 2 * i, *v);
        }
    }
    let crc_end = 20 + data_frame_body_len;
    let crc = crc16(&buf[20..crc_end]);
    write_u16_le(&mut buf, crc_end, crc);
    buf
}

/// Builds a client response frame: embeds `inverter_raw_bytes` verbatim
/// except its own trailing CRC, and computes a fresh CRC over the embedded
/// span. Output length is `6 + 14 + (N-2) + 2` where `N =
/// inverter_raw_bytes.len()`.
pub fn encode_response(inverter_raw_bytes: &[u8], dongle_serial: &[u8]) -> Result<Vec<u8>, CodecError> {
    let n = inverter_raw_bytes.len();
    if n < 2 {
        return Err(CodecError::TooShort { got: n, need: 2 });
    }
    let embedded = &inverter_raw_bytes[..n - 2];
    let total_len = n + 20;
    let mut buf = vec![0u8; total_len];
    buf[0..2].copy_from_slice(&MAGIC);
    write_u16_le(&mut buf, 2, VERSION_RESPONSE);
    write_u16_le(&mut buf, 4, (total_len - 6) as u16);
    buf[6] = RESERVED;
    buf[7] = DONGLE_FUNCTION;
    buf[8..18].copy_from_slice(&serial_field(dongle_serial));
    write_u16_le(&mut buf, 18, n as u16);
    buf[20..20 + embedded.len()].copy_from_slice(embedded);
    let crc = crc16(embedded);
    write_u16_le(&mut buf, 20 + embedded.len(), crc);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial_codec::{encode_exception_response, encode_read_response, encode_write_single_response};

    const DONGLE: &[u8] = b"DONGLE0001";
    const INV: &[u8] = b"INV0000001";

    #[test]
    fn decode_rejects_short_frame() {
        let err = decode_request(&[0u8; 10]).unwrap_err();
        assert_eq!(err, CodecError::TooShort { got: 10, need: 38 });
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut frame = encode_read_request(DONGLE, INV, FUNC_READ_HOLDING, 0, 10);
        frame[0] = 0x00;
        assert!(matches!(decode_request(&frame), Err(CodecError::BadMagic(_))));
    }

    #[test]
    fn decode_rejects_crc_mismatch() {
        let mut frame = encode_read_request(DONGLE, INV, FUNC_READ_HOLDING, 0, 10);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(decode_request(&frame), Err(CodecError::CrcMismatch { .. })));
    }

    #[test]
    fn decode_duality_read_request() {
        // Property 3: decode(encode(r)) == r for a read.
        let frame = encode_read_request(DONGLE, INV, FUNC_READ_INPUT, 40, 40);
        assert_eq!(frame.len(), 38);
        let parsed = decode_request(&frame).unwrap();
        assert_eq!(parsed.dongle_serial, serial_field(DONGLE));
        assert_eq!(parsed.inverter_serial, serial_field(INV));
        assert_eq!(parsed.function, FUNC_READ_INPUT);
        assert_eq!(parsed.start_register, 40);
        assert!(!parsed.is_write);
        assert_eq!(parsed.register_count, 40);
    }

    #[test]
    fn decode_duality_write_single() {
        let frame = encode_write_request(DONGLE, INV, 21, &[3]);
        let parsed = decode_request(&frame).unwrap();
        assert!(parsed.is_write);
        assert_eq!(parsed.values, vec![3]);
        assert_eq!(parsed.register_count, 1);
    }

    #[test]
    fn decode_duality_write_multiple() {
        let values = [1u16, 2, 3, 4, 5];
        let frame = encode_write_request(DONGLE, INV, 100, &values);
        let parsed = decode_request(&frame).unwrap();
        assert!(parsed.is_write);
        assert_eq!(parsed.values, values);
        assert_eq!(parsed.register_count, 5);
    }

    #[test]
    fn decode_rejects_count_out_of_range() {
        let frame = encode_read_request(DONGLE, INV, FUNC_READ_HOLDING, 0, 0);
        assert!(matches!(decode_request(&frame), Err(CodecError::CountOutOfRange(0))));
    }

    #[test]
    fn encode_response_matches_s1_scenario() {
        // S1: read response with 40 registers (80 data bytes).
        let values: Vec<u16> = (0..40).collect();
        let inverter_resp = encode_read_response(FUNC_READ_INPUT, 0, &values, INV).unwrap();
        assert_eq!(inverter_resp.len(), 97);
        let tcp_resp = encode_response(&inverter_resp, DONGLE).unwrap();
        assert_eq!(tcp_resp.len(), 117);
        assert_eq!(read_u16_le(&tcp_resp, 2), VERSION_RESPONSE);
        // Embedded data frame equals the inverter bytes minus its trailing CRC.
        assert_eq!(&tcp_resp[20..20 + 95], &inverter_resp[..95]);
    }

    #[test]
    fn encode_response_preserves_exception_bytes() {
        // S5: exception pass-through.
        let exc = encode_exception_response(FUNC_WRITE_SINGLE, INV, 0x02);
        let tcp_resp = encode_response(&exc, DONGLE).unwrap();
        assert_eq!(tcp_resp.len(), 6 + 14 + (exc.len() - 2) + 2);
        assert_eq!(&tcp_resp[20..20 + exc.len() - 2], &exc[..exc.len() - 2]);
    }

    #[test]
    fn encode_response_write_single_echo() {
        // S3: write single echo.
        let echo = encode_write_single_response(21, 3, INV).unwrap();
        let tcp_resp = encode_response(&echo, DONGLE).unwrap();
        assert_eq!(tcp_resp.len(), echo.len() + 20);
    }
}
