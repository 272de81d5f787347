//! Virtual relay board

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use tracing::debug;
use track_signal::{RelayBoard, SignalError};

#[derive(Debug, Default)]
struct BoardState {
    channels: BTreeMap<u8, bool>,
    history: Vec<(u8, bool)>,
}

/// Relay board that remembers what it was told
#[derive(Debug)]
pub struct VirtualRelayBoard {
    channel_count: u8,
    state: Mutex<BoardState>,
}

impl Default for VirtualRelayBoard {
    fn default() -> Self {
        Self::new(8)
    }
}

impl VirtualRelayBoard {
    /// Board with channels `1..=channel_count`
    pub fn new(channel_count: u8) -> Self {
        Self {
            channel_count,
            state: Mutex::new(BoardState::default()),
        }
    }

    /// Current state of a channel, `None` if never switched
    pub fn is_open(&self, channel: u8) -> Option<bool> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .channels
            .get(&channel)
            .copied()
    }

    /// Every switching operation in order
    pub fn history(&self) -> Vec<(u8, bool)> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .clone()
    }
}

impl RelayBoard for VirtualRelayBoard {
    fn set_channel(&self, channel: u8, open: bool) -> Result<(), SignalError> {
        if channel == 0 || channel > self.channel_count {
            return Err(SignalError::Relay {
                channel,
                reason: format!("board has channels 1..={}", self.channel_count),
            });
        }
        debug!("Relay {} {}", channel, if open { "open" } else { "closed" });
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.channels.insert(channel, open);
        state.history.push((channel, open));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switching_is_recorded() {
        let board = VirtualRelayBoard::new(8);
        assert_eq!(board.is_open(3), None);
        board.open_channel(3).unwrap();
        board.close_channel(3).unwrap();
        assert_eq!(board.is_open(3), Some(false));
        assert_eq!(board.history(), vec![(3, true), (3, false)]);
    }

    #[test]
    fn test_unknown_channel() {
        let board = VirtualRelayBoard::new(8);
        assert!(board.open_channel(9).is_err());
        assert!(board.open_channel(0).is_err());
    }
}
