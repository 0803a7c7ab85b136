//! Core library for the inverter bridge: protocol codecs, the serial
//! arbiter, the fallback cache, the operation guard, and the coordinator
//! that wires them together. The TCP front door and the binary entry point
//! sit on top of this core.

pub mod arbiter;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod crc;
pub mod error;
pub mod guard;
pub mod listener;
pub mod serial_codec;
pub mod tcp_codec;
