//! Error types shared by the codecs and the coordinator.

use thiserror::Error;

/// Failures that can occur while encoding or decoding a frame (serial or TCP).
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum CodecError {
    #[error("frame too short: got {got} bytes, need at least {need}")]
    TooShort { got: usize, need: usize },

    #[error("bad magic prefix: {0:02X?}")]
    BadMagic([u8; 2]),

    #[error("unexpected protocol version {got}, expected {expected}")]
    BadVersion { got: u16, expected: u16 },

    #[error("unexpected function byte 0x{0:02X}, expected 0xC2")]
    BadDongleFunction(u8),

    #[error("unexpected address byte 0x{0:02X}")]
    BadAddress(u8),

    #[error("unsupported function code 0x{0:02X}")]
    BadFunctionCode(u8),

    #[error("register count {0} out of range [1,127]")]
    CountOutOfRange(usize),

    #[error("CRC mismatch: expected {expected:04X}, computed {computed:04X}")]
    CrcMismatch { expected: u16, computed: u16 },

    #[error("declared data-frame length {0} does not fit in the supplied bytes")]
    DataFrameLengthMismatch(usize),
}

/// Failures surfaced by the bridge coordinator while servicing one client
/// request. These map to the client-visible outcomes in `spec.md` §7.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("malformed client request: {0}")]
    Decode(#[from] CodecError),

    #[error("bridge is busy servicing another request")]
    Busy,

    #[error("operation guard is held by {0:?}")]
    GuardHeld(crate::guard::ActivityKind),

    #[error("serial dispatch failed (link down or arbiter busy)")]
    DispatchFailed,

    #[error("request timed out waiting for a serial response")]
    Timeout,

    #[error("inverter response did not match the originating request")]
    Mismatch,

    #[error("no cached response available for this read")]
    CacheMiss,
}
