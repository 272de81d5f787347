//! Museum layout geometry
//!
//! Two loops joined by connector tracks. Positions are millimetres of the
//! train's centre along the active loop. The outer loop wraps around; the
//! inner loop is a dead-end line whose far end reverses onto itself, which is
//! why a train leaving it at the far end flips its `aligned` orientation.
//!
//! Negative positions lie on the connectors toward the other loop.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use track_signal::ContactPin;

/// Distance from train centre to the outermost wheel
pub const HALF_TRAIN: f64 = 366.0;
/// Distance from train centre to the outermost contact wheel
pub const TRAIN_CONTACT: f64 = 195.0;
/// Inner loop length, excluding the joint track
pub const INNER: f64 = 4137.7;
pub const OUTER: f64 = 5201.2;
pub const INNER_CONNECTION: f64 = 565.5;
pub const OUTER_CONNECTION: f64 = 643.0;
/// Joint track between the inner connector and the outer loop switch
pub const INTERIM: f64 = 1794.8;
/// Position on the outer loop of the switch toward the inner loop
pub const OUTER_UNTIL_SWITCH: f64 = 2565.4;

/// Contact on the outer loop
pub const OUTER_CONTACT: ContactPin = ContactPin::Ri;
/// Contact on the inner loop
pub const INNER_CONTACT: ContactPin = ContactPin::Dsr;
/// Contact at the airport station
pub const AIRPORT_CONTACT: ContactPin = ContactPin::Cd;

/// Named stops and contact positions
pub mod landmarks {
    pub const INNER_AIRPORT: f64 = 1700.0;
    pub const INNER_ERDING: f64 = 2630.0;
    pub const INNER_MUNICH: f64 = 0.0;
    pub const INNER_SAFE_REVERSAL: f64 = -500.0;
    pub const OUTER_ERDING: f64 = 1650.0;
    pub const OUTER_AIRPORT: f64 = 2700.0;
    pub const OUTER_MUNICH: f64 = 5100.0;
    pub const OUTER_SAFE_WAIT: f64 = 3500.0;
    pub const OUTER_CONTACT_NORTH: f64 = 4558.2;
    pub const INNER_AIRPORT_CONTACT_WEST: f64 = -1801.0;
    pub const INNER_CONTACT_NORTH: f64 = -925.5 - 269.6;
    pub const INNER_CONTACT_SOUTH: f64 = -565.5;
    /// Inner contacts as seen by a train coming from the outer loop
    pub const INNER_CONTACT_NORTH_FROM_OUTER: f64 = -1003.0 - 269.6;
    pub const INNER_CONTACT_SOUTH_FROM_OUTER: f64 = -643.0;
}

/// One of the two loops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackLoop {
    Outer,
    Inner,
}

impl TrackLoop {
    pub fn name(&self) -> &'static str {
        match self {
            TrackLoop::Outer => "outer",
            TrackLoop::Inner => "inner",
        }
    }

    /// Contact whose trips this loop's drives usually wait for
    pub fn contact(&self) -> ContactPin {
        match self {
            TrackLoop::Outer => OUTER_CONTACT,
            TrackLoop::Inner => INNER_CONTACT,
        }
    }
}

impl fmt::Display for TrackLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a train is, derived from its odometer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    /// Odometer reading this state corresponds to
    pub cumulative_signed_distance: f64,
    /// `None` if unknown
    pub track: Option<TrackLoop>,
    /// Train centre in mm, NaN if unknown
    pub position: f64,
    /// Whether driving forward increases `position`, `None` if unknown
    pub aligned: Option<bool>,
}

impl Default for PositionState {
    fn default() -> Self {
        Self::unknown()
    }
}

impl PositionState {
    pub fn new(track: TrackLoop, position: f64, aligned: bool) -> Self {
        Self {
            cumulative_signed_distance: 0.0,
            track: Some(track),
            position,
            aligned: Some(aligned),
        }
    }

    pub fn unknown() -> Self {
        Self {
            cumulative_signed_distance: 0.0,
            track: None,
            position: f64::NAN,
            aligned: None,
        }
    }

    pub fn is_known(&self) -> bool {
        self.track.is_some() && self.aligned.is_some() && self.position.is_finite()
    }

    /// +1 when driving forward increases the position, -1 otherwise
    pub fn orientation(&self) -> f64 {
        if self.aligned == Some(false) {
            -1.0
        } else {
            1.0
        }
    }

    /// Same place, different odometer reference
    pub fn at_odometer(mut self, cumulative_signed_distance: f64) -> Self {
        self.cumulative_signed_distance = cumulative_signed_distance;
        self
    }
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let track = self.track.map(|t| t.name()).unwrap_or("?");
        let aligned = match self.aligned {
            Some(true) => "fwd",
            Some(false) => "bwd",
            None => "?",
        };
        write!(f, "{} {:.1} {}", track, self.position, aligned)
    }
}

impl FromStr for PositionState {
    type Err = String;

    /// Parse `"<outer|inner|?> <position> <fwd|bwd|?>"`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split_whitespace().collect();
        let [track, position, aligned] = parts.as_slice() else {
            return Err(format!("expected 3 fields in position '{s}'"));
        };
        let track = match *track {
            "outer" => Some(TrackLoop::Outer),
            "inner" => Some(TrackLoop::Inner),
            "?" => None,
            other => return Err(format!("unknown track '{other}'")),
        };
        let position: f64 = position
            .parse()
            .map_err(|_| format!("invalid position '{position}'"))?;
        let aligned = match *aligned {
            "fwd" => Some(true),
            "bwd" => Some(false),
            "?" => None,
            other => return Err(format!("unknown orientation '{other}'")),
        };
        Ok(Self {
            cumulative_signed_distance: 0.0,
            track,
            position,
            aligned,
        })
    }
}

/// Calibrated lengths of the layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackGeometry {
    pub half_train: f64,
    pub inner: f64,
    pub outer: f64,
    pub inner_connection: f64,
    pub outer_connection: f64,
    pub interim: f64,
    pub outer_until_switch: f64,
}

impl Default for TrackGeometry {
    fn default() -> Self {
        Self {
            half_train: HALF_TRAIN,
            inner: INNER,
            outer: OUTER,
            inner_connection: INNER_CONNECTION,
            outer_connection: OUTER_CONNECTION,
            interim: INTERIM,
            outer_until_switch: OUTER_UNTIL_SWITCH,
        }
    }
}

impl TrackGeometry {
    /// Range a position stays in while on `track`
    pub fn bounds(&self, track: TrackLoop) -> (f64, f64) {
        match track {
            TrackLoop::Outer => (
                -(self.outer_connection + self.half_train),
                self.outer + self.half_train,
            ),
            TrackLoop::Inner => (
                -(self.inner_connection + self.interim + self.half_train),
                self.inner + self.half_train,
            ),
        }
    }

    /// Largest odometer step for which at most one boundary is crossed
    pub fn max_step(&self) -> f64 {
        self.half_train
            .min(self.outer_connection - self.inner_connection + self.half_train)
    }

    /// Advance `state` to a new odometer reading.
    ///
    /// At most one boundary rule is applied, so the odometer must not move by
    /// more than [`max_step`](Self::max_step) between updates. Unknown states
    /// only take the new odometer reading.
    pub fn update(&self, state: &PositionState, cumulative_signed_distance: f64) -> PositionState {
        let (Some(track), Some(aligned)) = (state.track, state.aligned) else {
            return state.at_odometer(cumulative_signed_distance);
        };
        let delta = state.orientation() * (cumulative_signed_distance - state.cumulative_signed_distance);
        let mut position = state.position + delta;
        let mut track = track;
        let mut aligned = aligned;
        match track {
            TrackLoop::Outer if position > self.outer + self.half_train => {
                position %= self.outer;
            }
            TrackLoop::Outer if position < -self.outer_connection - self.half_train => {
                track = TrackLoop::Inner;
                position += self.outer_connection - self.inner_connection;
            }
            TrackLoop::Inner if position > self.inner + self.half_train => {
                position = -(position - self.inner);
                aligned = !aligned;
            }
            TrackLoop::Inner
                if position < -(self.inner_connection + self.interim + self.half_train) =>
            {
                track = TrackLoop::Outer;
                position =
                    self.outer_until_switch - (-position - self.inner_connection - self.interim);
            }
            _ => {}
        }
        PositionState {
            cumulative_signed_distance,
            track: Some(track),
            position,
            aligned: Some(aligned),
        }
    }

    /// Normalise a position given in loop coordinates
    pub fn project(&self, position: f64, track: TrackLoop) -> f64 {
        self.update(&PositionState::new(track, position, true), 0.0)
            .position
    }
}
