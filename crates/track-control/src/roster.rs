//! Static train definitions

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use track_protocol::{Protocol, MAX_ADDRESS};

use crate::error::{ControlError, Result};

/// Number of entries in a speed ladder
pub const LADDER_LEN: usize = 15;

/// Index of a train in the [`Roster`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrainId(pub usize);

impl TrainId {
    /// Get the raw index
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl fmt::Display for TrainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A decoder function such as lights or a horn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainFunction {
    pub name: String,
    /// Function number, 0 for f0
    pub id: u8,
    #[serde(default)]
    pub default_on: bool,
    /// Minimum time between two triggers
    #[serde(default)]
    pub cooldown_secs: f64,
    /// Momentary functions switch off again after this long
    #[serde(default)]
    pub duration_secs: Option<f64>,
}

impl TrainFunction {
    pub fn new(name: impl Into<String>, id: u8, default_on: bool) -> Self {
        Self {
            name: name.into(),
            id,
            default_on,
            cooldown_secs: 0.0,
            duration_secs: None,
        }
    }

    /// Make this a momentary function
    pub fn momentary(mut self, duration_secs: f64, cooldown_secs: f64) -> Self {
        self.duration_secs = Some(duration_secs);
        self.cooldown_secs = cooldown_secs;
        self
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.cooldown_secs.max(0.0))
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration_secs.map(|d| Duration::from_secs_f64(d.max(0.0)))
    }
}

/// How a train is stopped instantly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardStop {
    /// Broadcast the protocol's emergency speed code
    EmergencyCode,
    /// Broadcast speed 0 with the direction toggled
    ReverseToggle,
}

/// Static description of one locomotive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainSpec {
    pub name: String,
    /// Decoder address (1..=79)
    pub address: u8,
    /// Scale km/h of every speed step, index 0 is standstill
    pub speeds: Vec<f64>,
    /// Ramp-up rate in km/h per second
    pub acceleration: f64,
    /// Ramp-down rate in km/h per second, defaults to `acceleration`
    #[serde(default)]
    pub deceleration: Option<f64>,
    #[serde(default)]
    pub protocol: Protocol,
    /// Decoder ignores the emergency code and must be stopped by a direction toggle
    #[serde(default)]
    pub requires_reverse_stop: bool,
    #[serde(default)]
    pub functions: Vec<TrainFunction>,
    /// Probability that a terminus entry is handled as a regional train
    #[serde(default = "default_regional_probability")]
    pub regional_probability: f64,
}

fn default_regional_probability() -> f64 {
    0.5
}

impl TrainSpec {
    pub fn new(name: impl Into<String>, address: u8, speeds: Vec<f64>, acceleration: f64) -> Self {
        Self {
            name: name.into(),
            address,
            speeds,
            acceleration,
            deceleration: None,
            protocol: Protocol::Mm2,
            requires_reverse_stop: false,
            functions: Vec::new(),
            regional_probability: default_regional_probability(),
        }
    }

    /// Evenly spaced ladder from 0 to `max`
    pub fn linear_ladder(max: f64) -> Vec<f64> {
        let last = (LADDER_LEN - 1) as f64;
        (0..LADDER_LEN).map(|i| max * i as f64 / last).collect()
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_deceleration(mut self, deceleration: f64) -> Self {
        self.deceleration = Some(deceleration);
        self
    }

    pub fn with_reverse_stop(mut self) -> Self {
        self.requires_reverse_stop = true;
        self
    }

    pub fn with_function(mut self, function: TrainFunction) -> Self {
        self.functions.push(function);
        self
    }

    pub fn with_regional_probability(mut self, probability: f64) -> Self {
        self.regional_probability = probability;
        self
    }

    /// Check the ladder, rates and address
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| ControlError::InvalidTrain {
            train: self.name.clone(),
            reason,
        };
        if self.address == 0 || self.address > MAX_ADDRESS {
            return Err(invalid(format!("address {} out of range", self.address)));
        }
        if self.speeds.len() != LADDER_LEN {
            return Err(invalid(format!(
                "speed ladder has {} entries, expected {}",
                self.speeds.len(),
                LADDER_LEN
            )));
        }
        if self.speeds[0] != 0.0 {
            return Err(invalid("first speed step must be 0".into()));
        }
        if self
            .speeds
            .windows(2)
            .any(|w| !w[1].is_finite() || w[1] < w[0])
        {
            return Err(invalid("speed ladder must be ascending".into()));
        }
        let positive = |rate: f64| rate.is_finite() && rate > 0.0;
        if !positive(self.acceleration) || !positive(self.deceleration()) {
            return Err(invalid("acceleration rates must be positive".into()));
        }
        if let Some(f) = self.functions.iter().find(|f| f.id > 4) {
            return Err(invalid(format!("function {} has unsupported id {}", f.name, f.id)));
        }
        Ok(())
    }

    pub fn deceleration(&self) -> f64 {
        self.deceleration.unwrap_or(self.acceleration)
    }

    pub fn max_speed(&self) -> f64 {
        self.speeds.last().copied().unwrap_or(0.0)
    }

    pub fn hard_stop(&self) -> HardStop {
        if self.requires_reverse_stop || !self.protocol.has_emergency_code() {
            HardStop::ReverseToggle
        } else {
            HardStop::EmergencyCode
        }
    }

    /// Ladder index closest to `speed`, the lower one on ties
    pub fn nearest_step(&self, speed: f64) -> usize {
        let speed = speed.abs();
        let mut best = 0;
        let mut best_delta = f64::INFINITY;
        for (i, s) in self.speeds.iter().enumerate() {
            let delta = (s - speed).abs();
            if delta < best_delta {
                best = i;
                best_delta = delta;
            }
        }
        best
    }

    pub fn function(&self, id: u8) -> Option<&TrainFunction> {
        self.functions.iter().find(|f| f.id == id)
    }
}

/// The trains known to the layout, created once at startup
#[derive(Debug, Clone, Default)]
pub struct Roster {
    trains: Vec<TrainSpec>,
}

impl Roster {
    /// Validate and index the given trains
    pub fn new(trains: Vec<TrainSpec>) -> Result<Self> {
        for (i, train) in trains.iter().enumerate() {
            train.validate()?;
            if trains[..i].iter().any(|t| t.name == train.name) {
                return Err(ControlError::InvalidTrain {
                    train: train.name.clone(),
                    reason: "duplicate name".into(),
                });
            }
        }
        Ok(Self { trains })
    }

    pub fn get(&self, id: TrainId) -> Option<&TrainSpec> {
        self.trains.get(id.0)
    }

    /// Like [`get`](Self::get) but as an error
    pub fn train(&self, id: TrainId) -> Result<&TrainSpec> {
        self.get(id)
            .ok_or_else(|| ControlError::UnknownTrain(id.to_string()))
    }

    pub fn find(&self, name: &str) -> Option<TrainId> {
        self.trains
            .iter()
            .position(|t| t.name.eq_ignore_ascii_case(name))
            .map(TrainId)
    }

    /// Name of a train, or its index if unknown
    pub fn name(&self, id: TrainId) -> String {
        self.get(id)
            .map(|t| t.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    pub fn ids(&self) -> impl Iterator<Item = TrainId> + '_ {
        (0..self.trains.len()).map(TrainId)
    }

    pub fn iter(&self) -> impl Iterator<Item = (TrainId, &TrainSpec)> {
        self.trains.iter().enumerate().map(|(i, t)| (TrainId(i), t))
    }

    pub fn len(&self) -> usize {
        self.trains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trains.is_empty()
    }
}

/// The museum layout's locomotives
pub fn default_roster() -> Vec<TrainSpec> {
    let light = || TrainFunction::new("Light", 0, true);
    let slow_mode = || TrainFunction::new("Slow mode", 3, false);
    let instant_acceleration = || TrainFunction::new("Instant acceleration", 4, true);
    vec![
        TrainSpec::new("ICE", 3, TrainSpec::linear_ladder(310.0), 25.0)
            .with_function(light())
            .with_function(slow_mode())
            .with_function(instant_acceleration())
            .with_regional_probability(0.1),
        TrainSpec::new(
            "RE",
            1,
            vec![
                0.0, 13.4, 24.9, 45.6, 66.5, 86.3, 107.6, 124.5, 139.5, 155.6, 173.2, 190.9,
                201.1, 215.2, 226.0,
            ],
            30.0,
        )
        .with_reverse_stop()
        .with_function(light())
        .with_function(TrainFunction::new("Fog lights", 2, false))
        .with_function(TrainFunction::new("Rear lights", 3, false))
        .with_function(instant_acceleration())
        .with_regional_probability(0.6),
        TrainSpec::new(
            "RB",
            24,
            vec![
                0.0, 1.9, 20.2, 33.0, 49.2, 62.7, 77.1, 93.7, 109.0, 124.5, 136.9, 154.7, 168.7,
                181.6, 183.0,
            ],
            30.0,
        )
        .with_protocol(Protocol::Mm1)
        .with_reverse_stop()
        .with_function(light())
        .with_regional_probability(0.9),
        TrainSpec::new(
            "S",
            48,
            vec![
                0.0, 1.9, 5.2, 9.6, 14.8, 22.0, 29.9, 40.7, 51.2, 64.1, 77.1, 90.8, 106.3, 120.2,
                136.0,
            ],
            35.0,
        )
        .with_function(light())
        .with_function(TrainFunction::new("Interior lights", 1, false))
        .with_function(TrainFunction::new("Engine sound", 2, false))
        .with_function(TrainFunction::new("Horn", 3, false).momentary(1.5, 5.0))
        .with_function(instant_acceleration())
        .with_regional_probability(1.0),
        TrainSpec::new(
            "Dampf",
            78,
            vec![
                0.0, 0.1, 0.2, 0.3, 48.0, 80.0, 100.0, 110.0, 120.0, 140.0, 165.0, 180.0, 192.0,
                202.0, 210.0,
            ],
            30.0,
        )
        .with_function(light())
        .with_regional_probability(0.5),
        TrainSpec::new(
            "218",
            73,
            vec![
                0.0, 15.5, 31.0, 47.0, 62.0, 78.0, 94.0, 110.0, 125.0, 141.0, 157.0, 172.0, 188.0,
                204.0, 220.0,
            ],
            25.0,
        )
        .with_function(light())
        .with_function(slow_mode())
        .with_function(instant_acceleration())
        .with_regional_probability(0.7),
        TrainSpec::new("Diesel", 72, TrainSpec::linear_ladder(217.0), 25.0)
            .with_function(light())
            .with_function(slow_mode())
            .with_function(instant_acceleration())
            .with_regional_probability(0.5),
        TrainSpec::new("E40", 23, TrainSpec::linear_ladder(220.0), 30.0)
            .with_reverse_stop()
            .with_function(light())
            .with_function(instant_acceleration())
            .with_regional_probability(0.3),
        TrainSpec::new("Bus", 62, TrainSpec::linear_ladder(190.0), 40.0)
            .with_reverse_stop()
            .with_regional_probability(1.0),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_roster_is_valid() {
        let roster = Roster::new(default_roster()).unwrap();
        assert_eq!(roster.len(), 9);
        let ice = roster.find("ice").unwrap();
        assert_eq!(roster.get(ice).unwrap().address, 3);
        assert_eq!(roster.get(ice).unwrap().max_speed(), 310.0);
    }

    #[test]
    fn test_rejects_short_ladder() {
        let train = TrainSpec::new("X", 5, vec![0.0, 10.0], 10.0);
        assert!(matches!(
            train.validate(),
            Err(ControlError::InvalidTrain { .. })
        ));
    }

    #[test]
    fn test_rejects_descending_ladder() {
        let mut speeds = TrainSpec::linear_ladder(100.0);
        speeds.swap(3, 4);
        assert!(TrainSpec::new("X", 5, speeds, 10.0).validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let train = TrainSpec::new("X", 5, TrainSpec::linear_ladder(100.0), 10.0);
        assert!(Roster::new(vec![train.clone(), train]).is_err());
    }

    #[test]
    fn test_hard_stop_choice() {
        let ladder = TrainSpec::linear_ladder(100.0);
        let mm2 = TrainSpec::new("A", 5, ladder.clone(), 10.0);
        assert_eq!(mm2.hard_stop(), HardStop::EmergencyCode);
        assert_eq!(mm2.clone().with_reverse_stop().hard_stop(), HardStop::ReverseToggle);
        let mm1 = mm2.with_protocol(Protocol::Mm1);
        assert_eq!(mm1.hard_stop(), HardStop::ReverseToggle);
    }

    #[test]
    fn test_nearest_step() {
        let train = TrainSpec::new("A", 5, TrainSpec::linear_ladder(140.0), 10.0);
        assert_eq!(train.nearest_step(0.0), 0);
        assert_eq!(train.nearest_step(9.0), 1);
        assert_eq!(train.nearest_step(-21.0), 2);
        assert_eq!(train.nearest_step(500.0), 14);
    }

    #[test]
    fn test_spec_json() {
        let json = r#"{"name": "T", "address": 7, "speeds": [0,1,2,3,4,5,6,7,8,9,10,11,12,13,14], "acceleration": 5}"#;
        let train: TrainSpec = serde_json::from_str(json).unwrap();
        assert_eq!(train.protocol, Protocol::Mm2);
        assert_eq!(train.deceleration(), 5.0);
        assert!(train.validate().is_ok());
    }
}
