//! Motion controller
//!
//! Owns target and actual speed of every train, ramps actual toward target on
//! each tick, integrates odometry and hands changed broadcast commands to the
//! signal generators that carry the train.
//!
//! Speeds are magnitudes in scale km/h plus an explicit [`Direction`]. A
//! train's actual direction only changes while it stands still, so a moving
//! train is never broadcast with a flipped direction bit.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use track_protocol::{FunctionBits, SpeedCode, TrainCommand};
use track_signal::SignalGenerator;

use crate::error::{ControlError, Result};
use crate::events::{ControlEvent, Events};
use crate::roster::{HardStop, Roster, TrainId, TrainSpec};

/// Name of the limit applied to every train by
/// [`MotionController::set_global_speed_limit`]
pub const GLOBAL_LIMIT: &str = "global";

/// Direction of travel relative to the locomotive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

impl Direction {
    pub fn sign(self) -> f64 {
        match self {
            Direction::Forward => 1.0,
            Direction::Reverse => -1.0,
        }
    }

    pub fn flipped(self) -> Self {
        match self {
            Direction::Forward => Direction::Reverse,
            Direction::Reverse => Direction::Forward,
        }
    }

    pub fn is_reverse(self) -> bool {
        self == Direction::Reverse
    }

    fn of(value: f64) -> Self {
        if value < 0.0 {
            Direction::Reverse
        } else {
            Direction::Forward
        }
    }
}

/// Where a train is heading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Heading {
    /// Standing, will move forward on the next command
    ParkedForward,
    /// Standing, will move backward on the next command
    ParkedBackward,
    Moving(Direction),
}

impl fmt::Display for Heading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Heading::ParkedForward => f.write_str("parked fwd"),
            Heading::ParkedBackward => f.write_str("parked bwd"),
            Heading::Moving(Direction::Forward) => f.write_str("fwd"),
            Heading::Moving(Direction::Reverse) => f.write_str("bwd"),
        }
    }
}

/// Motion controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Update period in milliseconds
    pub tick_ms: u64,
    /// Model scale, 87 for H0
    pub scale: f64,
    /// How long the hard-stop frame is held before a regular stop frame
    pub emergency_hold_ms: u64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            scale: 87.0,
            emergency_hold_ms: 500,
        }
    }
}

impl MotionConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn emergency_hold(&self) -> Duration {
        Duration::from_millis(self.emergency_hold_ms)
    }

    /// Model millimetres per second at `kmh` scale km/h
    pub fn mm_per_second(&self, kmh: f64) -> f64 {
        kmh / 3.6 * 1000.0 / self.scale
    }
}

/// Observable state of one train
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainSnapshot {
    pub train: TrainId,
    pub name: String,
    /// Signed actual speed in km/h
    pub speed: f64,
    /// Signed target speed in km/h
    pub target: f64,
    pub heading: Heading,
    pub emergency: bool,
    pub force_stopping: Option<String>,
    /// Odometer in mm, backward travel counts negative
    pub signed_distance: f64,
    /// Odometer in mm
    pub abs_distance: f64,
    /// State of f0..f4, `None` for undefined functions
    pub functions: [Option<bool>; 5],
    pub limits: BTreeMap<String, f64>,
    /// Speed step currently broadcast
    pub speed_step: Option<u8>,
}

#[derive(Debug)]
struct TrainState {
    target: f64,
    direction: Direction,
    speed: f64,
    speed_direction: Direction,
    emergency: Option<Instant>,
    force_stopping: Option<String>,
    limits: BTreeMap<String, f64>,
    functions: FunctionBits,
    last_used: HashMap<u8, Instant>,
    expires: HashMap<u8, Instant>,
    signed_distance: f64,
    abs_distance: f64,
    last_sent: Option<TrainCommand>,
}

impl TrainState {
    fn new(spec: &TrainSpec) -> Self {
        let mut functions = FunctionBits::new();
        functions.f0 = spec.function(0).map(|f| f.default_on).unwrap_or(false);
        for function in spec.functions.iter().filter(|f| f.id > 0) {
            // ids were validated by the roster
            let _ = functions.set(function.id, function.default_on);
        }
        Self {
            target: 0.0,
            direction: Direction::Forward,
            speed: 0.0,
            speed_direction: Direction::Forward,
            emergency: None,
            force_stopping: None,
            limits: BTreeMap::new(),
            functions,
            last_used: HashMap::new(),
            expires: HashMap::new(),
            signed_distance: 0.0,
            abs_distance: 0.0,
            last_sent: None,
        }
    }

    fn effective_max(&self, spec: &TrainSpec) -> f64 {
        self.limits
            .values()
            .fold(spec.max_speed(), |max, limit| max.min(*limit))
    }

    fn heading(&self) -> Heading {
        if self.speed > 0.0 {
            Heading::Moving(self.speed_direction)
        } else if self.direction.is_reverse() {
            Heading::ParkedBackward
        } else {
            Heading::ParkedForward
        }
    }

    fn signed_speed(&self) -> f64 {
        self.speed * self.speed_direction.sign()
    }

    /// Move actual speed toward target, never through zero
    fn ramp(&mut self, spec: &TrainSpec, dt: f64) {
        if self.speed == 0.0 {
            self.speed_direction = self.direction;
        }
        if self.speed_direction != self.direction {
            self.speed = (self.speed - spec.deceleration() * dt).max(0.0);
            if self.speed == 0.0 {
                self.speed_direction = self.direction;
            }
        } else if self.target > self.speed {
            self.speed = (self.speed + spec.acceleration * dt).min(self.target);
        } else {
            self.speed = (self.speed - spec.deceleration() * dt).max(self.target);
        }
    }

    /// Speed step for the current actual speed, at least 1 while moving
    fn speed_step(&self, spec: &TrainSpec) -> u8 {
        let mut step = spec.nearest_step(self.speed);
        if self.speed > 0.0 && step == 0 {
            step = 1;
        }
        step as u8
    }
}

struct Output {
    generator: SignalGenerator,
    /// `None` carries every train
    trains: Option<Vec<TrainId>>,
}

impl Output {
    fn carries(&self, train: TrainId) -> bool {
        self.trains.as_ref().map_or(true, |t| t.contains(&train))
    }
}

/// Controls the speed and functions of every train in the roster
pub struct MotionController {
    roster: Roster,
    config: MotionConfig,
    states: Vec<Mutex<TrainState>>,
    outputs: Mutex<Vec<Output>>,
    events: Events,
}

impl fmt::Debug for MotionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MotionController")
            .field("trains", &self.roster.len())
            .field("config", &self.config)
            .finish()
    }
}

impl MotionController {
    pub fn new(roster: Roster, config: MotionConfig, events: Events) -> Self {
        let states = roster
            .iter()
            .map(|(_, spec)| Mutex::new(TrainState::new(spec)))
            .collect();
        Self {
            roster,
            config,
            states,
            outputs: Mutex::new(Vec::new()),
            events,
        }
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    pub fn events(&self) -> &Events {
        &self.events
    }

    /// Broadcast trains through `generator`. `None` carries every train.
    ///
    /// Commands already sent to other generators are replayed so the new
    /// port starts out in sync.
    pub fn add_generator(&self, generator: SignalGenerator, trains: Option<Vec<TrainId>>) {
        let output = Output { generator, trains };
        for (id, spec) in self.roster.iter() {
            if !output.carries(id) {
                continue;
            }
            if let Some(command) = self.state(id).ok().and_then(|s| s.last_sent) {
                if let Err(e) = output.generator.set(command, spec.protocol) {
                    warn!(train = %spec.name, "Cannot replay command: {}", e);
                }
            }
        }
        info!(
            port = %output.generator.port(),
            "Generator carries {}",
            match &output.trains {
                Some(t) => format!("{} trains", t.len()),
                None => "all trains".to_string(),
            }
        );
        self.outputs().push(output);
    }

    /// Generators that carry `train`
    pub fn generators_for(&self, train: TrainId) -> Vec<SignalGenerator> {
        self.outputs()
            .iter()
            .filter(|o| o.carries(train))
            .map(|o| o.generator.clone())
            .collect()
    }

    pub fn generators(&self) -> Vec<SignalGenerator> {
        self.outputs().iter().map(|o| o.generator.clone()).collect()
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    /// Set the signed target speed in km/h.
    ///
    /// The magnitude is clamped to the train's maximum and all active limits.
    /// Zero keeps the current direction. Any nonzero target ends an
    /// emergency stop.
    pub fn set_target_speed(&self, train: TrainId, signed_speed: f64) -> Result<f64> {
        let spec = self.roster.train(train)?;
        let mut state = self.state(train)?;
        if signed_speed != 0.0 && signed_speed.is_finite() {
            state.emergency = None;
            state.direction = Direction::of(signed_speed);
        }
        let magnitude = if signed_speed.is_finite() {
            signed_speed.abs()
        } else {
            0.0
        };
        state.target = magnitude.min(state.effective_max(spec));
        debug!(train = %spec.name, "Target {:.1} km/h {:?}", state.target, state.direction);
        Ok(state.target * state.direction.sign())
    }

    /// Move the target `steps` ladder steps up (positive) or down
    pub fn accelerate(&self, train: TrainId, steps: i32) -> Result<f64> {
        let spec = self.roster.train(train)?;
        let (target, direction) = {
            let state = self.state(train)?;
            (state.target, state.direction)
        };
        let current = spec.nearest_step(target) as i32;
        let next = (current + steps).clamp(0, spec.speeds.len() as i32 - 1) as usize;
        self.set_target_speed(train, spec.speeds[next] * direction.sign())
    }

    /// Stop and turn around. The new direction takes effect once the train
    /// stands still.
    pub fn reverse(&self, train: TrainId) -> Result<Direction> {
        let spec = self.roster.train(train)?;
        let mut state = self.state(train)?;
        state.target = 0.0;
        state.direction = state.direction.flipped();
        info!(train = %spec.name, "Reversed, now {:?}", state.direction);
        Ok(state.direction)
    }

    /// Stop instantly with the train's hard-stop frame
    pub fn emergency_stop(&self, train: TrainId, cause: &str) -> Result<()> {
        let spec = self.roster.train(train)?;
        let command = {
            let mut state = self.state(train)?;
            state.target = 0.0;
            state.speed = 0.0;
            state.force_stopping = None;
            state.emergency = Some(Instant::now());
            let currently_reverse = state
                .last_sent
                .map(|c| c.reverse)
                .unwrap_or(state.speed_direction.is_reverse());
            let command = match spec.hard_stop() {
                HardStop::EmergencyCode => TrainCommand::new(
                    spec.address,
                    SpeedCode::Emergency,
                    currently_reverse,
                    state.functions,
                ),
                HardStop::ReverseToggle => TrainCommand::new(
                    spec.address,
                    SpeedCode::Step(0),
                    !currently_reverse,
                    state.functions,
                ),
            };
            state.last_sent = Some(command);
            command
        };
        warn!(train = %spec.name, cause, "Emergency stop ({:?})", spec.hard_stop());
        self.events.emit(ControlEvent::EmergencyStop {
            train,
            cause: cause.to_string(),
        });
        self.send(train, spec, command)
    }

    pub fn emergency_stop_all(&self, cause: &str) -> Result<()> {
        let mut result = Ok(());
        for train in self.roster.ids() {
            if let Err(e) = self.emergency_stop(train, cause) {
                result = Err(e);
            }
        }
        result
    }

    /// Hold the target at zero until the train has stopped
    pub fn force_stop(&self, train: TrainId, cause: &str) -> Result<()> {
        let spec = self.roster.train(train)?;
        info!(train = %spec.name, cause, "Stopping");
        self.state(train)?.force_stopping = Some(cause.to_string());
        Ok(())
    }

    /// Set or lift a named speed limit.
    ///
    /// A train above a new limit is slowed to it at once.
    pub fn set_speed_limit(&self, train: TrainId, name: &str, limit: Option<f64>) -> Result<()> {
        let spec = self.roster.train(train)?;
        {
            let mut state = self.state(train)?;
            match limit {
                None => {
                    if state.limits.remove(name).is_none() {
                        return Ok(());
                    }
                }
                Some(limit) => {
                    let limit = limit.max(0.0);
                    if state.limits.get(name) == Some(&limit) {
                        return Ok(());
                    }
                    state.limits.insert(name.to_string(), limit);
                    if state.speed > limit {
                        state.speed = limit;
                    }
                }
            }
            state.target = state.target.min(state.effective_max(spec));
        }
        debug!(train = %spec.name, "Speed limit '{}' = {:?}", name, limit);
        self.events.emit(ControlEvent::SpeedLimitChanged {
            train,
            name: name.to_string(),
            limit,
        });
        Ok(())
    }

    /// Apply a limit to every train, `None` lifts it
    pub fn set_global_speed_limit(&self, limit: Option<f64>) -> Result<()> {
        for train in self.roster.ids() {
            self.set_speed_limit(train, GLOBAL_LIMIT, limit)?;
        }
        Ok(())
    }

    pub fn set_function(&self, train: TrainId, function: u8, on: bool) -> Result<()> {
        let spec = self.roster.train(train)?;
        self.state(train)?.functions.set(function, on)?;
        debug!(train = %spec.name, "f{} = {}", function, on);
        Ok(())
    }

    /// Switch a function on, respecting its cooldown. Momentary functions
    /// switch off again on a later tick.
    pub fn trigger_function(&self, train: TrainId, function: u8) -> Result<()> {
        let spec = self.roster.train(train)?;
        let definition = spec.function(function);
        let now = Instant::now();
        let mut state = self.state(train)?;
        if let (Some(def), Some(last)) = (definition, state.last_used.get(&function)) {
            let ready = *last + def.cooldown();
            if now < ready {
                return Err(ControlError::Cooldown {
                    train,
                    function,
                    remaining_ms: (ready - now).as_millis() as u64,
                });
            }
        }
        state.functions.set(function, true)?;
        state.last_used.insert(function, now);
        if let Some(duration) = definition.and_then(|d| d.duration()) {
            state.expires.insert(function, now + duration);
        }
        Ok(())
    }

    /// Start broadcasting on the ports carrying `train`, or on every port
    pub fn power_on(&self, train: Option<TrainId>) {
        for generator in self.power_targets(train) {
            generator.start();
        }
        info!("Power on ({})", self.describe(train));
        self.events.emit(ControlEvent::PowerChanged { train, on: true });
    }

    pub fn power_off(&self, train: Option<TrainId>) {
        for generator in self.power_targets(train) {
            generator.stop();
        }
        info!("Power off ({})", self.describe(train));
        self.events.emit(ControlEvent::PowerChanged { train, on: false });
    }

    /// Whether any port carrying `train` (or any port at all) is sending
    pub fn is_power_on(&self, train: Option<TrainId>) -> bool {
        self.power_targets(train).iter().any(|g| g.is_sending())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Signed actual speed in km/h
    pub fn speed(&self, train: TrainId) -> Result<f64> {
        Ok(self.state(train)?.signed_speed())
    }

    /// Signed target speed in km/h
    pub fn target_speed(&self, train: TrainId) -> Result<f64> {
        let state = self.state(train)?;
        Ok(state.target * state.direction.sign())
    }

    pub fn heading(&self, train: TrainId) -> Result<Heading> {
        Ok(self.state(train)?.heading())
    }

    /// Intended direction, which a moving train may not have reached yet
    pub fn direction(&self, train: TrainId) -> Result<Direction> {
        Ok(self.state(train)?.direction)
    }

    pub fn is_stopped(&self, train: TrainId) -> Result<bool> {
        Ok(self.state(train)?.speed == 0.0)
    }

    pub fn is_emergency_stopping(&self, train: TrainId) -> Result<bool> {
        Ok(self.state(train)?.emergency.is_some())
    }

    /// Odometer in mm, backward travel counts negative
    pub fn signed_distance(&self, train: TrainId) -> Result<f64> {
        Ok(self.state(train)?.signed_distance)
    }

    pub fn abs_distance(&self, train: TrainId) -> Result<f64> {
        Ok(self.state(train)?.abs_distance)
    }

    pub fn snapshot(&self, train: TrainId) -> Result<TrainSnapshot> {
        let spec = self.roster.train(train)?;
        let state = self.state(train)?;
        let mut functions = [None; 5];
        for (i, slot) in functions.iter_mut().enumerate() {
            *slot = state.functions.get(i as u8);
        }
        Ok(TrainSnapshot {
            train,
            name: spec.name.clone(),
            speed: state.signed_speed(),
            target: state.target * state.direction.sign(),
            heading: state.heading(),
            emergency: state.emergency.is_some(),
            force_stopping: state.force_stopping.clone(),
            signed_distance: state.signed_distance,
            abs_distance: state.abs_distance,
            functions,
            limits: state.limits.clone(),
            speed_step: state.last_sent.and_then(|c| match c.speed {
                SpeedCode::Step(step) => Some(step),
                SpeedCode::Emergency => None,
            }),
        })
    }

    pub fn snapshots(&self) -> Vec<TrainSnapshot> {
        self.roster
            .ids()
            .filter_map(|id| self.snapshot(id).ok())
            .collect()
    }

    // -------------------------------------------------------------------------
    // Update
    // -------------------------------------------------------------------------

    /// Advance every train by `dt`. A failing train is logged and skipped.
    pub fn tick(&self, dt: Duration) {
        for (id, spec) in self.roster.iter() {
            if let Err(e) = self.update_train(id, spec, dt) {
                warn!(train = %spec.name, "Update failed: {}", e);
                self.events.error(&spec.name, e);
            }
        }
    }

    fn update_train(&self, train: TrainId, spec: &TrainSpec, dt: Duration) -> Result<()> {
        let powered = self.is_power_on(Some(train));
        let now = Instant::now();
        let dt = dt.as_secs_f64();
        let command = {
            let mut state = self.state(train)?;
            if !powered {
                state.speed = 0.0;
                return Ok(());
            }

            if state.speed > 0.0 {
                let travelled = self.config.mm_per_second(state.speed) * dt;
                state.signed_distance += travelled * state.speed_direction.sign();
                state.abs_distance += travelled;
            }

            let expired: Vec<u8> = state
                .expires
                .iter()
                .filter(|(_, at)| now >= **at)
                .map(|(f, _)| *f)
                .collect();
            for function in expired {
                state.expires.remove(&function);
                state.functions.set(function, false)?;
            }

            if state.force_stopping.is_some() {
                state.target = 0.0;
                if state.speed == 0.0 {
                    state.force_stopping = None;
                }
            }

            if let Some(at) = state.emergency {
                state.speed = 0.0;
                if now.duration_since(at) < self.config.emergency_hold() {
                    return Ok(());
                }
            } else {
                state.ramp(spec, dt);
            }

            let command = TrainCommand::new(
                spec.address,
                SpeedCode::Step(state.speed_step(spec)),
                state.speed_direction.is_reverse(),
                state.functions,
            );
            if state.last_sent == Some(command) {
                return Ok(());
            }
            state.last_sent = Some(command);
            command
        };
        self.send(train, spec, command)
    }

    fn send(&self, train: TrainId, spec: &TrainSpec, command: TrainCommand) -> Result<()> {
        debug!(
            train = %spec.name,
            "Sending {}{:?}",
            if command.reverse { '-' } else { '+' },
            command.speed
        );
        for generator in self.generators_for(train) {
            generator.set(command, spec.protocol)?;
        }
        self.events.emit(ControlEvent::FrameSent {
            train,
            speed: command.speed,
            reverse: command.reverse,
        });
        Ok(())
    }

    fn state(&self, train: TrainId) -> Result<MutexGuard<'_, TrainState>> {
        self.states
            .get(train.0)
            .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner))
            .ok_or_else(|| ControlError::UnknownTrain(train.to_string()))
    }

    fn outputs(&self) -> MutexGuard<'_, Vec<Output>> {
        self.outputs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn power_targets(&self, train: Option<TrainId>) -> Vec<SignalGenerator> {
        match train {
            Some(train) => self.generators_for(train),
            None => self.generators(),
        }
    }

    fn describe(&self, train: Option<TrainId>) -> String {
        match train {
            Some(train) => self.roster.name(train),
            None => "all ports".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_direction_of_signed_value() {
        assert_eq!(Direction::of(3.0), Direction::Forward);
        assert_eq!(Direction::of(-3.0), Direction::Reverse);
        assert_eq!(Direction::of(0.0), Direction::Forward);
        assert_eq!(Direction::Forward.flipped(), Direction::Reverse);
    }

    #[test]
    fn test_mm_per_second() {
        let config = MotionConfig::default();
        // 87 scale km/h is 1 km/h on the model
        assert!((config.mm_per_second(87.0) - 277.777).abs() < 0.01);
    }

    fn spec() -> TrainSpec {
        TrainSpec::new("T", 5, TrainSpec::linear_ladder(140.0), 10.0).with_deceleration(20.0)
    }

    #[test]
    fn test_ramp_up_stops_at_target() {
        let spec = spec();
        let mut state = TrainState::new(&spec);
        state.target = 25.0;
        for _ in 0..30 {
            state.ramp(&spec, 0.1);
        }
        assert_eq!(state.speed, 25.0);
    }

    #[test]
    fn test_ramp_never_crosses_zero() {
        let spec = spec();
        let mut state = TrainState::new(&spec);
        state.speed = 3.0;
        state.target = 10.0;
        state.direction = Direction::Reverse;
        state.ramp(&spec, 0.1);
        assert_eq!(state.speed, 1.0);
        assert_eq!(state.speed_direction, Direction::Forward);
        state.ramp(&spec, 0.1);
        assert_eq!(state.speed, 0.0);
        assert_eq!(state.speed_direction, Direction::Reverse);
        state.ramp(&spec, 0.1);
        assert_eq!(state.speed, 1.0);
        assert_eq!(state.speed_direction, Direction::Reverse);
    }

    #[test]
    fn test_moving_train_has_nonzero_step() {
        let spec = spec();
        let mut state = TrainState::new(&spec);
        state.speed = 0.5;
        assert_eq!(state.speed_step(&spec), 1);
        state.speed = 0.0;
        assert_eq!(state.speed_step(&spec), 0);
    }

    #[test]
    fn test_heading() {
        let spec = spec();
        let mut state = TrainState::new(&spec);
        assert_eq!(state.heading(), Heading::ParkedForward);
        state.direction = Direction::Reverse;
        assert_eq!(state.heading(), Heading::ParkedBackward);
        state.speed = 4.0;
        state.speed_direction = Direction::Reverse;
        assert_eq!(state.heading(), Heading::Moving(Direction::Reverse));
    }

    #[test]
    fn test_default_functions() {
        let spec = spec()
            .with_function(crate::roster::TrainFunction::new("Light", 0, true))
            .with_function(crate::roster::TrainFunction::new("Horn", 2, false));
        let state = TrainState::new(&spec);
        assert!(state.functions.f0);
        assert_eq!(state.functions.get(2), Some(false));
        assert_eq!(state.functions.get(1), None);
    }

    proptest! {
        #[test]
        fn ramp_moves_toward_target_within_rate(
            speed in 0.0f64..140.0,
            target in 0.0f64..140.0,
            dt in 0.01f64..0.5,
        ) {
            let spec = spec();
            let mut state = TrainState::new(&spec);
            state.speed = speed;
            state.target = target;
            state.ramp(&spec, dt);
            let limit = spec.acceleration.max(spec.deceleration()) * dt + 1e-9;
            prop_assert!((state.speed - speed).abs() <= limit);
            prop_assert!((state.speed - target).abs() <= (speed - target).abs() + 1e-9);
            prop_assert!(state.speed <= speed.max(target) + 1e-9);
        }
    }
}
