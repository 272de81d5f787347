//! Error types for the signal generator

use thiserror::Error;

use crate::contacts::ContactPin;

/// Errors raised by the line, the generator and relay boards
#[derive(Debug, Error)]
pub enum SignalError {
    /// The serial line could not be opened
    #[error("port {port} unavailable: {reason}")]
    PortUnavailable { port: String, reason: String },

    /// An awaited contact transition did not happen in time
    #[error("no transition on {pins:?} within {timeout_ms}ms")]
    ProtocolTimeout {
        pins: Vec<ContactPin>,
        timeout_ms: u64,
    },

    /// The track reports a short circuit or has no power
    #[error("short circuit on {0}")]
    ShortCircuit(String),

    /// A newer wait from the same listener replaced this one
    #[error("wait for listener '{0}' was superseded")]
    Superseded(String),

    /// The generator task has ended
    #[error("signal generator for {0} is no longer running")]
    GeneratorClosed(String),

    /// A relay channel could not be switched
    #[error("relay channel {channel}: {reason}")]
    Relay { channel: u8, reason: String },

    /// Frame could not be encoded
    #[error("protocol error: {0}")]
    Protocol(#[from] track_protocol::ProtocolError),

    /// I/O error on an open line
    #[error("I/O error on {port}: {reason}")]
    Io { port: String, reason: String },

    /// Serial port error
    #[error("serial port error: {0}")]
    SerialPort(#[from] serialport::Error),
}

impl SignalError {
    /// Timeouts are the only error a waiting caller is expected to handle routinely
    pub fn is_timeout(&self) -> bool {
        matches!(self, SignalError::ProtocolTimeout { .. })
    }
}
