//! Relay boards switching turnouts, signals and track power

use crate::error::SignalError;

/// A bank of numbered relay channels
///
/// Implementations are shared between tasks, so switching takes `&self`.
pub trait RelayBoard: Send + Sync {
    /// Open (`true`) or close (`false`) a channel
    fn set_channel(&self, channel: u8, open: bool) -> Result<(), SignalError>;

    fn open_channel(&self, channel: u8) -> Result<(), SignalError> {
        self.set_channel(channel, true)
    }

    fn close_channel(&self, channel: u8) -> Result<(), SignalError> {
        self.set_channel(channel, false)
    }
}
