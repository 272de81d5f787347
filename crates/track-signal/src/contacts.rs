//! Contact sensors wired to the serial handshake lines

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Handshake input a track contact is wired to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContactPin {
    /// Ring indicator
    #[serde(rename = "RI")]
    Ri,
    /// Data set ready
    #[serde(rename = "DSR")]
    Dsr,
    /// Carrier detect
    #[serde(rename = "CD")]
    Cd,
}

impl ContactPin {
    pub const ALL: [ContactPin; 3] = [ContactPin::Ri, ContactPin::Dsr, ContactPin::Cd];

    pub fn name(&self) -> &'static str {
        match self {
            ContactPin::Ri => "RI",
            ContactPin::Dsr => "DSR",
            ContactPin::Cd => "CD",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            ContactPin::Ri => 0,
            ContactPin::Dsr => 1,
            ContactPin::Cd => 2,
        }
    }
}

impl fmt::Display for ContactPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ContactPin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RI" => Ok(ContactPin::Ri),
            "DSR" => Ok(ContactPin::Dsr),
            "CD" | "DCD" => Ok(ContactPin::Cd),
            other => Err(format!("unknown contact pin '{other}'")),
        }
    }
}

/// Raw line levels in [`ContactPin::ALL`] order
pub type ContactLevels = [bool; 3];

/// A contact changed level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContactEvent {
    pub pin: ContactPin,
    pub level: bool,
    pub at: Instant,
}

/// Last known level of every contact
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContactSnapshot {
    levels: [Option<bool>; 3],
    changed_at: [Option<Instant>; 3],
}

impl ContactSnapshot {
    /// `None` until the line has been read once
    pub fn level(&self, pin: ContactPin) -> Option<bool> {
        self.levels[pin.index()]
    }

    pub fn last_change(&self, pin: ContactPin) -> Option<Instant> {
        self.changed_at[pin.index()]
    }

    /// Apply a fresh reading, returning the transitions it contains.
    /// The first reading of a pin sets its level without reporting a change.
    pub(crate) fn update(&mut self, levels: ContactLevels, now: Instant) -> Vec<ContactEvent> {
        let mut events = Vec::new();
        for pin in ContactPin::ALL {
            let i = pin.index();
            let level = levels[i];
            match self.levels[i] {
                Some(previous) if previous == level => {}
                Some(_) => {
                    self.levels[i] = Some(level);
                    self.changed_at[i] = Some(now);
                    events.push(ContactEvent { pin, level, at: now });
                }
                None => self.levels[i] = Some(level),
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reading_is_silent() {
        let mut snapshot = ContactSnapshot::default();
        let now = Instant::now();
        assert!(snapshot.update([true, true, false], now).is_empty());
        assert_eq!(snapshot.level(ContactPin::Ri), Some(true));
        assert_eq!(snapshot.last_change(ContactPin::Ri), None);
    }

    #[test]
    fn test_transition_reported_once() {
        let mut snapshot = ContactSnapshot::default();
        let now = Instant::now();
        snapshot.update([true, true, true], now);
        let events = snapshot.update([false, true, true], now);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].pin, ContactPin::Ri);
        assert!(!events[0].level);
        assert!(snapshot.update([false, true, true], now).is_empty());
    }

    #[test]
    fn test_pin_names() {
        for pin in ContactPin::ALL {
            assert_eq!(pin.name().parse::<ContactPin>().unwrap(), pin);
        }
        assert!("CTS".parse::<ContactPin>().is_err());
    }
}
