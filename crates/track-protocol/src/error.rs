//! Error types for frame encoding and decoding

use thiserror::Error;

/// Errors that can occur while decoding line bytes
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Wrong number of bytes for a frame
    #[error("invalid frame length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// A line byte that is neither high nor low
    #[error("invalid line byte: 0x{0:02X}")]
    InvalidByte(u8),

    /// A byte pair that does not form a trit
    #[error("invalid trit pair: ({0}, {1})")]
    InvalidTrit(u8, u8),

    /// Address trits decode outside of the address space
    #[error("invalid address: {0}")]
    InvalidAddress(u8),

    /// Direction/function bits match no known pattern
    #[error("unknown payload pattern {pattern:04b} for speed code {code}")]
    UnknownPattern { pattern: u8, code: u8 },

    /// Frames of one status command disagree
    #[error("inconsistent status frames: {0}")]
    Inconsistent(String),

    /// No frames were supplied
    #[error("no frames to decode")]
    Empty,
}

/// Higher-level protocol errors raised while encoding commands
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Parse error
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// Address outside 1..=79
    #[error("address {0} out of range (1..=79)")]
    InvalidAddress(u8),

    /// Speed step outside 0..=14
    #[error("speed step {0} out of range (0..=14)")]
    InvalidSpeed(u8),

    /// Function number the protocol cannot carry
    #[error("function f{function} not supported by {protocol}")]
    UnsupportedFunction {
        function: u8,
        protocol: &'static str,
    },

    /// Emergency stop code requested on a protocol without one
    #[error("{0} has no emergency stop code")]
    NoEmergencyCode(&'static str),
}
