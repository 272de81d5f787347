//! Serial lines that carry the track signal
//!
//! The generator task owns its line exclusively. Lines are opened through a
//! [`LineOpener`] so the task can reopen after a failure, and so tests can
//! substitute a virtual line.

use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio_serial::{
    DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, SerialStream, StopBits,
};
use tracing::{debug, info};

use crate::contacts::ContactLevels;
use crate::error::SignalError;

/// Baud rate at which one 6-bit word lasts half a trit
pub const SIGNAL_BAUD: u32 = 38_400;

/// A writable line with contact and power-sense inputs
pub trait TrackLine: AsyncWrite + Unpin + Send {
    /// Read the contact inputs in [`ContactPin::ALL`](crate::ContactPin::ALL) order
    fn read_contacts(&mut self) -> Result<ContactLevels, SignalError>;

    /// `true` when the booster reports a short circuit or missing power
    fn power_fault(&mut self) -> Result<bool, SignalError>;
}

/// Opens (and reopens) the line for one port
pub trait LineOpener: Send + Sync {
    fn port_name(&self) -> &str;

    fn open(&self) -> Result<Box<dyn TrackLine>, SignalError>;
}

impl TrackLine for SerialStream {
    fn read_contacts(&mut self) -> Result<ContactLevels, SignalError> {
        Ok([
            self.read_ring_indicator()?,
            self.read_data_set_ready()?,
            self.read_carrier_detect()?,
        ])
    }

    fn power_fault(&mut self) -> Result<bool, SignalError> {
        Ok(self.read_clear_to_send()?)
    }
}

/// Opens a real serial port with the track signal settings
#[derive(Debug, Clone)]
pub struct SerialLineOpener {
    port: String,
    timeout: Duration,
}

impl SerialLineOpener {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            timeout: Duration::from_millis(100),
        }
    }
}

impl LineOpener for SerialLineOpener {
    fn port_name(&self) -> &str {
        &self.port
    }

    fn open(&self) -> Result<Box<dyn TrackLine>, SignalError> {
        debug!("Opening serial port {}...", self.port);
        let unavailable = |e: tokio_serial::Error| SignalError::PortUnavailable {
            port: self.port.clone(),
            reason: e.to_string(),
        };
        let mut stream = tokio_serial::new(&self.port, SIGNAL_BAUD)
            .data_bits(DataBits::Six)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(self.timeout)
            .open_native_async()
            .map_err(unavailable)?;
        // RTS low, DTR high powers the contact inputs
        stream.write_request_to_send(false).map_err(unavailable)?;
        stream.write_data_terminal_ready(true).map_err(unavailable)?;
        info!("{} opened successfully", self.port);
        Ok(Box::new(stream))
    }
}
