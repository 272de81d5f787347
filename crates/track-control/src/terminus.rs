//! Terminus allocator
//!
//! Admits trains into the five-platform terminus. A single entry sensor,
//! the entry signal, the entry track power and the switch relays are shared,
//! so only one train may be entering at any time. Entering a platform may
//! also block exits from platforms whose route crosses the entry route.
//!
//! Distances are odometer millimetres. A parked train's position is measured
//! from the entry sensor toward the buffer stop.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use track_signal::{ContactPin, RelayBoard, SignalGenerator};

use crate::error::{ControlError, Result};
use crate::events::{ControlEvent, Events};
use crate::motion::MotionController;
use crate::roster::TrainId;

/// Speed limit name applied while a train is in the terminus
pub const TERMINUS_LIMIT: &str = "terminus";
/// Speed limit name holding trains whose exit is blocked
pub const TERMINUS_WAIT_LIMIT: &str = "terminus-wait";

/// Terminus layout and timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminusConfig {
    /// Contact input of the entry sensor
    pub sensor_pin: ContactPin,
    /// Level the sensor reports while a train is over it
    pub tripped_level: bool,
    /// Relay channel states (`true` = open) that route the entry to each platform
    pub routes: BTreeMap<u8, BTreeMap<u8, bool>>,
    /// Switch channel that is thrown after the others
    pub secondary_channel: u8,
    pub secondary_delay_ms: u64,
    /// Platforms whose exit is blocked while entering a platform
    pub exit_blocks: BTreeMap<u8, Vec<u8>>,
    /// Relay closed to block exits while entering a platform
    pub exit_block_relays: BTreeMap<u8, u8>,
    /// Relays opened to release all exits
    pub exit_relays: Vec<u8>,
    pub entry_signal_relay: u8,
    /// Entry track has no power while this relay is open
    pub entry_power_relay: u8,
    /// Speed limit inside the terminus in km/h
    pub speed_limit: f64,
    /// Platforms preferred by regional trains
    pub regional_platforms: Vec<u8>,
    /// Extra cost of platforms nested behind others
    pub congestion: BTreeMap<u8, f64>,
    /// Length of the sensor track in mm
    pub sensor_length: f64,
    /// Longest train in mm
    pub max_train_length: f64,
    /// Train is assumed fully past the sensor once this far in
    pub max_entry_length: f64,
    /// Entry signal turns red once the train is this far in
    pub signal_red_after: f64,
    /// A re-trip before the train end is this far in counts as another axle
    pub retrip_window: f64,
    /// Entry is settled once the train end is this far in
    pub settle_after: f64,
    /// Position assumed for trains registered by hand
    pub default_position: f64,
    /// Position cap after a parked train reversed
    pub reversed_position_cap: f64,
    /// Odometer factor applied to distance driven after reversing
    pub reverse_margin: f64,
    pub poll_ms: u64,
    /// Entry is aborted if the sensor does not trip within this time
    pub trip_timeout_ms: u64,
    /// Entry is released if still entering this long after the trip
    pub stale_entry_ms: u64,
}

impl Default for TerminusConfig {
    fn default() -> Self {
        let route = |channels: &[(u8, bool)]| channels.iter().copied().collect::<BTreeMap<_, _>>();
        Self {
            sensor_pin: ContactPin::Ri,
            tripped_level: false,
            routes: BTreeMap::from([
                (1, route(&[(6, false), (8, true)])),
                (2, route(&[(6, false), (8, false)])),
                (3, route(&[(6, true), (7, true)])),
                (4, route(&[(6, true), (7, false), (8, false)])),
                (5, route(&[(6, true), (7, false), (8, true)])),
            ]),
            secondary_channel: 8,
            secondary_delay_ms: 1000,
            exit_blocks: BTreeMap::from([(1, vec![2, 3]), (2, vec![3]), (5, vec![4])]),
            exit_block_relays: BTreeMap::from([(1, 1), (2, 1), (5, 2)]),
            exit_relays: vec![1, 2],
            entry_signal_relay: 3,
            entry_power_relay: 4,
            speed_limit: 80.0,
            regional_platforms: vec![1, 2, 3],
            congestion: BTreeMap::from([(1, 0.0), (2, 0.1), (3, 0.2), (4, 0.1), (5, 0.0)]),
            sensor_length: 180.0,
            max_train_length: 1200.0,
            max_entry_length: 1300.0,
            signal_red_after: 200.0,
            retrip_window: 300.0,
            settle_after: 600.0,
            default_position: 2200.0,
            reversed_position_cap: 3000.0,
            reverse_margin: 0.8,
            poll_ms: 10,
            trip_timeout_ms: 6000,
            stale_entry_ms: 20_000,
        }
    }
}

impl TerminusConfig {
    pub fn platforms(&self) -> impl Iterator<Item = u8> + '_ {
        self.routes.keys().copied()
    }

    fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms.max(1))
    }
}

/// What is happening on a platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlatformState {
    Empty,
    Parked,
    Entering,
    Exiting,
}

impl fmt::Display for PlatformState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlatformState::Empty => "empty",
            PlatformState::Parked => "parked",
            PlatformState::Entering => "entering",
            PlatformState::Exiting => "exiting",
        };
        f.write_str(name)
    }
}

/// A train assigned to a platform
#[derive(Debug, Clone, PartialEq)]
pub struct ParkedTrain {
    pub train: TrainId,
    pub platform: u8,
    /// Odometer when entry was requested, `None` for trains registered by hand
    pub dist_request: Option<f64>,
    /// Odometer when the sensor tripped
    pub dist_trip: Option<f64>,
    /// Odometer when the sensor cleared
    pub dist_clear: Option<f64>,
    /// Absolute odometer at the first reverse in the station
    pub dist_reverse: Option<f64>,
    time_trip: Option<Instant>,
    time_stopped: Option<Instant>,
    dist_stopped: Option<f64>,
}

impl ParkedTrain {
    fn requested(train: TrainId, platform: u8, odometer: f64) -> Self {
        Self {
            train,
            platform,
            dist_request: Some(odometer),
            dist_trip: None,
            dist_clear: None,
            dist_reverse: None,
            time_trip: None,
            time_stopped: None,
            dist_stopped: None,
        }
    }

    pub fn has_tripped(&self) -> bool {
        self.dist_trip.is_some()
    }

    pub fn has_cleared(&self) -> bool {
        self.dist_clear.is_some()
    }

    pub fn has_reversed(&self) -> bool {
        self.dist_reverse.is_some()
    }

    /// Whether the train drove forward into the station, once known
    pub fn entered_forward(&self) -> Option<bool> {
        let trip = self.dist_trip?;
        match self.dist_clear {
            Some(clear) => Some(clear - trip > 0.0),
            None => self.dist_request.map(|request| trip - request > 0.0),
        }
    }

    /// Train length in mm derived from the sensor pass
    pub fn train_length(&self, config: &TerminusConfig) -> Option<f64> {
        let length = (self.dist_clear? - self.dist_trip?).abs() - config.sensor_length;
        Some(length.min(config.max_train_length))
    }

    /// Distance of the train head past the sensor, positive toward the
    /// buffer stop. `None` before the sensor tripped.
    pub fn position(&self, config: &TerminusConfig, signed: f64, abs: f64) -> Option<f64> {
        let trip = self.dist_trip?;
        let mut delta = signed - trip;
        if self.dist_request.is_none() {
            delta = config.default_position - (delta - config.default_position).abs();
        } else if self.entered_forward() == Some(false) {
            delta = -delta;
        }
        if let Some(reverse) = self.dist_reverse {
            let since_reverse = abs - reverse;
            return Some(delta.min(config.reversed_position_cap) - since_reverse * config.reverse_margin);
        }
        Some(delta)
    }

    /// Position of the train end
    pub fn end_position(&self, config: &TerminusConfig, signed: f64, abs: f64) -> Option<f64> {
        Some(self.position(config, signed, abs)? - self.train_length(config).unwrap_or(0.0))
    }

    fn state(&self, speed: f64) -> PlatformState {
        if speed == 0.0 {
            return PlatformState::Parked;
        }
        match self.entered_forward() {
            Some(forward) if (speed > 0.0) != forward => PlatformState::Exiting,
            _ => PlatformState::Entering,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedTerminus {
    trains: Vec<SavedTrain>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedTrain {
    train: String,
    platform: u8,
    signed_distance: f64,
    abs_distance: f64,
    request: Option<f64>,
    trip: Option<f64>,
    clear: Option<f64>,
    reverse: Option<f64>,
}

#[derive(Debug, Default)]
struct TerminusState {
    trains: Vec<ParkedTrain>,
    entering: Option<TrainId>,
    locked: bool,
    generation: u64,
    monitor: Option<JoinHandle<()>>,
}

impl TerminusState {
    fn find(&self, train: TrainId) -> Option<&ParkedTrain> {
        self.trains.iter().find(|t| t.train == train)
    }

    fn find_mut(&mut self, train: TrainId) -> Option<&mut ParkedTrain> {
        self.trains.iter_mut().find(|t| t.train == train)
    }
}

/// Admits, tracks and releases trains in the terminus
pub struct Terminus {
    motion: Arc<MotionController>,
    relay: Arc<dyn RelayBoard>,
    sensor: SignalGenerator,
    config: TerminusConfig,
    state: Mutex<TerminusState>,
    events: Events,
}

impl fmt::Debug for Terminus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Terminus")
            .field("trains", &state.trains.len())
            .field("entering", &state.entering)
            .field("locked", &state.locked)
            .finish()
    }
}

impl Terminus {
    /// Set the relays to their idle state: signal red, entry unpowered,
    /// exits free.
    pub fn new(
        motion: Arc<MotionController>,
        relay: Arc<dyn RelayBoard>,
        sensor: SignalGenerator,
        config: TerminusConfig,
    ) -> Result<Self> {
        let events = motion.events().clone();
        let terminus = Self {
            motion,
            relay,
            sensor,
            config,
            state: Mutex::new(TerminusState::default()),
            events,
        };
        terminus.relay.close_channel(terminus.config.entry_signal_relay)?;
        terminus.relay.open_channel(terminus.config.entry_power_relay)?;
        for channel in &terminus.config.exit_relays {
            terminus.relay.open_channel(*channel)?;
        }
        info!(port = %terminus.sensor.port(), "Terminus ready");
        Ok(terminus)
    }

    pub fn config(&self) -> &TerminusConfig {
        &self.config
    }

    pub fn entering(&self) -> Option<TrainId> {
        self.lock().entering
    }

    pub fn is_locked(&self) -> bool {
        self.lock().locked
    }

    pub fn trains(&self) -> Vec<ParkedTrain> {
        self.lock().trains.clone()
    }

    /// Platform and position of a train in the terminus
    pub fn train_position(&self, train: TrainId) -> Option<(u8, Option<f64>)> {
        let (signed, abs) = self.odometers(train).ok()?;
        let state = self.lock();
        let parked = state.find(train)?;
        Some((parked.platform, parked.position(&self.config, signed, abs)))
    }

    /// State of every platform
    pub fn platform_states(&self) -> BTreeMap<u8, PlatformState> {
        let state = self.lock();
        self.platform_states_of(&state)
    }

    fn platform_states_of(&self, state: &TerminusState) -> BTreeMap<u8, PlatformState> {
        let mut states: BTreeMap<u8, PlatformState> = self
            .config
            .platforms()
            .map(|p| (p, PlatformState::Empty))
            .collect();
        for parked in &state.trains {
            let speed = self.motion.speed(parked.train).unwrap_or(0.0);
            states.insert(parked.platform, parked.state(speed));
        }
        states
    }

    // -------------------------------------------------------------------------
    // Entry
    // -------------------------------------------------------------------------

    /// Ask for entry into the terminus. Returns the assigned platform.
    ///
    /// Repeated requests from the entering train are ignored. A second
    /// train requesting entry before the first reached the sensor stops both
    /// and locks the entry until [`reset_entry_lock`](Self::reset_entry_lock).
    pub fn request_entry(self: &Arc<Self>, train: TrainId) -> Result<u8> {
        let name = self.motion.roster().train(train)?.name.clone();
        let odometer = self.motion.signed_distance(train)?;
        let mut state = self.lock();
        debug!(train = %name, "Entry requested, {} trains registered", state.trains.len());

        if state.locked {
            drop(state);
            self.motion.force_stop(train, "terminus entry locked")?;
            self.refuse(train, "entry locked");
            return Err(ControlError::EntryLocked);
        }

        if let Some(entering) = state.entering {
            let Some(record) = state.find(entering).cloned() else {
                return Err(ControlError::NotParked(self.motion.roster().name(entering)));
            };
            if entering == train {
                return Ok(record.platform);
            }
            let entering_name = self.motion.roster().name(entering);
            if record.has_tripped() {
                drop(state);
                info!(train = %name, "Waiting until {} has cleared the switches", entering_name);
                self.motion.force_stop(train, "wait for previous train")?;
                self.refuse(train, "entry busy");
                return Err(ControlError::EntryBusy(entering_name));
            }
            warn!("Contested terminus entry: {} vs {}", entering_name, name);
            let cause = format!("contested terminus entry: {} vs {}", entering_name, name);
            state.trains.retain(|t| t.train != entering);
            state.locked = true;
            self.clear_entering(&mut state)?;
            drop(state);
            self.motion.emergency_stop(train, &cause)?;
            self.motion.emergency_stop(entering, &cause)?;
            self.lift_limits(entering)?;
            self.events.emit(ControlEvent::EntryContested {
                first: entering,
                second: train,
            });
            return Err(ControlError::ContestedEntry {
                first: entering_name,
                second: name,
            });
        }

        if let Some(parked) = state.find(train) {
            let platform = parked.platform;
            info!(train = %name, "Already in terminus on platform {}", platform);
            self.events.emit(ControlEvent::ArrivalAnnouncement { train, platform });
            return Ok(platform);
        }

        let regional = {
            let probability = self.motion.roster().train(train)?.regional_probability;
            rand::thread_rng().gen_bool(probability.clamp(0.0, 1.0))
        };
        let Some(platform) = self.select_platform(&state, regional) else {
            drop(state);
            warn!(train = %name, "No platform available");
            self.motion.force_stop(train, "no platform")?;
            self.refuse(train, "no platform");
            return Err(ControlError::NoPlatform(name));
        };
        info!(train = %name, "Assigned to platform {} (regional: {})", platform, regional);

        state.trains.push(ParkedTrain::requested(train, platform, odometer));
        state.entering = Some(train);
        state.generation += 1;
        let generation = state.generation;

        self.motion
            .set_speed_limit(train, TERMINUS_LIMIT, Some(self.config.speed_limit))?;
        self.prevent_exit(&state, platform)?;
        self.set_route(platform)?;
        self.relay.open_channel(self.config.entry_signal_relay)?;
        self.relay.close_channel(self.config.entry_power_relay)?;

        let terminus = Arc::clone(self);
        let monitor = tokio::spawn(async move {
            if let Err(e) = Arc::clone(&terminus).monitor_entry(train, generation).await {
                warn!("Entry monitor failed: {}", e);
                terminus.events.error("terminus", e);
            }
        });
        if let Some(old) = state.monitor.replace(monitor) {
            old.abort();
        }
        drop(state);

        self.events.emit(ControlEvent::EntryAssigned { train, platform });
        Ok(platform)
    }

    /// Cheapest enterable platform, the first one on ties
    fn select_platform(&self, state: &TerminusState, regional: bool) -> Option<u8> {
        let states = self.platform_states_of(state);
        let (regional_cost, far_cost) = if regional { (0.0, 1.0) } else { (1.0, 0.0) };
        let mut best: Option<(u8, f64)> = None;
        for (&platform, &platform_state) in &states {
            if platform_state != PlatformState::Empty {
                continue;
            }
            let blocked = self
                .config
                .exit_blocks
                .get(&platform)
                .into_iter()
                .flatten()
                .any(|p| states.get(p) == Some(&PlatformState::Exiting));
            if blocked {
                continue;
            }
            let affinity = if self.config.regional_platforms.contains(&platform) {
                regional_cost
            } else {
                far_cost
            };
            let cost = affinity + self.config.congestion.get(&platform).copied().unwrap_or(0.0);
            debug!("Platform {} costs {:.1}", platform, cost);
            if best.map_or(true, |(_, lowest)| cost < lowest) {
                best = Some((platform, cost));
            }
        }
        best.map(|(platform, _)| platform)
    }

    fn set_route(&self, platform: u8) -> Result<()> {
        let route = self
            .config
            .routes
            .get(&platform)
            .ok_or(ControlError::InvalidPlatform(platform))?;
        for (&channel, &open) in route {
            if channel == self.config.secondary_channel {
                let relay = Arc::clone(&self.relay);
                let delay = Duration::from_millis(self.config.secondary_delay_ms);
                tokio::spawn(async move {
                    sleep(delay).await;
                    if let Err(e) = relay.set_channel(channel, open) {
                        warn!("Secondary switch {} failed: {}", channel, e);
                    }
                });
            } else {
                self.relay.set_channel(channel, open)?;
            }
        }
        Ok(())
    }

    /// Block exits crossing the route into `platform` and hold the trains
    /// that use them
    fn prevent_exit(&self, state: &TerminusState, platform: u8) -> Result<()> {
        if let Some(channel) = self.config.exit_block_relays.get(&platform) {
            self.relay.close_channel(*channel)?;
        }
        let Some(blocked) = self.config.exit_blocks.get(&platform) else {
            return Ok(());
        };
        for parked in state.trains.iter().filter(|t| blocked.contains(&t.platform)) {
            let speed = self.motion.speed(parked.train)?;
            if parked.state(speed) == PlatformState::Exiting {
                self.motion.emergency_stop(parked.train, "terminus conflict")?;
            }
            self.motion
                .set_speed_limit(parked.train, TERMINUS_WAIT_LIMIT, Some(0.0))?;
        }
        Ok(())
    }

    fn free_exit(&self, state: &TerminusState) -> Result<()> {
        for channel in &self.config.exit_relays {
            self.relay.open_channel(*channel)?;
        }
        for parked in &state.trains {
            self.motion
                .set_speed_limit(parked.train, TERMINUS_WAIT_LIMIT, None)?;
        }
        Ok(())
    }

    fn clear_entering(&self, state: &mut TerminusState) -> Result<()> {
        state.entering = None;
        state.generation += 1;
        if let Some(monitor) = state.monitor.take() {
            // a monitor clearing its own entry ends right after this anyway
            if !monitor.is_finished() {
                monitor.abort();
            }
        }
        self.relay.close_channel(self.config.entry_signal_relay)?;
        self.relay.open_channel(self.config.entry_power_relay)?;
        self.free_exit(state)
    }

    /// Drop the limits a terminus record puts on its train
    fn lift_limits(&self, train: TrainId) -> Result<()> {
        self.motion.set_speed_limit(train, TERMINUS_LIMIT, None)?;
        self.motion.set_speed_limit(train, TERMINUS_WAIT_LIMIT, None)
    }

    fn refuse(&self, train: TrainId, reason: &str) {
        self.events.emit(ControlEvent::EntryRefused {
            train,
            reason: reason.to_string(),
        });
    }

    fn sensor_tripped(&self) -> bool {
        self.sensor.contact_status().level(self.config.sensor_pin) == Some(self.config.tripped_level)
    }

    fn odometers(&self, train: TrainId) -> Result<(f64, f64)> {
        Ok((
            self.motion.signed_distance(train)?,
            self.motion.abs_distance(train)?,
        ))
    }

    /// Follow an entering train from request until it cleared the switches
    async fn monitor_entry(self: Arc<Self>, train: TrainId, generation: u64) -> Result<()> {
        let poll = self.config.poll();
        let deadline = Instant::now() + Duration::from_millis(self.config.trip_timeout_ms);
        while !self.sensor_tripped() {
            if Instant::now() >= deadline {
                return self.abort_entry(train, generation);
            }
            sleep(poll).await;
        }

        let (signed, _) = self.odometers(train)?;
        let platform = {
            let mut state = self.lock();
            if state.generation != generation {
                return Ok(());
            }
            let Some(record) = state.find_mut(train) else {
                return Ok(());
            };
            record.dist_trip = Some(signed);
            record.time_trip = Some(Instant::now());
            if record.dist_request == Some(signed) {
                // keep the entry direction defined
                let nudge = if self.motion.direction(train)?.is_reverse() { -1e-3 } else { 1e-3 };
                record.dist_request = Some(signed - nudge);
            }
            record.platform
        };
        info!(train = %self.motion.roster().name(train), "Entry sensor tripped");
        self.events.emit(ControlEvent::ArrivalAnnouncement { train, platform });

        let mut signal_red = false;
        loop {
            sleep(poll).await;
            let (signed, abs) = self.odometers(train)?;
            let tripped = self.sensor_tripped();
            let mut state = self.lock();
            if state.generation != generation {
                return Ok(());
            }
            let Some(record) = state.find_mut(train) else {
                return Ok(());
            };
            let position = record.position(&self.config, signed, abs).unwrap_or(0.0);
            if !signal_red && position > self.config.signal_red_after {
                self.relay.close_channel(self.config.entry_signal_relay)?;
                signal_red = true;
            }
            if !tripped {
                if record.dist_clear.is_none() {
                    debug!("Entry sensor clear, waiting for further axles");
                    record.dist_clear = Some(signed);
                    self.relay.open_channel(self.config.entry_power_relay)?;
                }
            } else if record.dist_clear.is_some()
                && record
                    .end_position(&self.config, signed, abs)
                    .is_some_and(|end| end < self.config.retrip_window)
            {
                debug!("Entry sensor tripped again by another axle");
                record.dist_clear = None;
                self.relay.close_channel(self.config.entry_power_relay)?;
                continue;
            }
            if record.dist_clear.is_none() && position > self.config.max_entry_length {
                debug!("Maximum train length reached, assuming sensor cleared");
                record.dist_clear = Some(signed);
            }
            let settled = record.dist_clear.is_some()
                && record
                    .end_position(&self.config, signed, abs)
                    .is_some_and(|end| end > self.config.settle_after);
            if settled {
                let platform = record.platform;
                self.clear_entering(&mut state)?;
                drop(state);
                info!(train = %self.motion.roster().name(train), "Cleared the switches");
                self.events.emit(ControlEvent::EntrySettled { train, platform });
                return Ok(());
            }
        }
    }

    fn abort_entry(&self, train: TrainId, generation: u64) -> Result<()> {
        {
            let mut state = self.lock();
            if state.generation != generation {
                return Ok(());
            }
            state.trains.retain(|t| t.train != train);
            self.clear_entering(&mut state)?;
        }
        warn!(train = %self.motion.roster().name(train), "Did not reach the entry sensor");
        self.motion.force_stop(train, "train did not enter terminus")?;
        self.lift_limits(train)?;
        self.events.emit(ControlEvent::EntryAborted { train });
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Periodic tasks
    // -------------------------------------------------------------------------

    /// Remove trains that backed out of the terminus
    pub fn check_exited(&self) -> Result<Vec<TrainId>> {
        let mut exited = Vec::new();
        let mut state = self.lock();
        let mut kept = Vec::with_capacity(state.trains.len());
        for parked in std::mem::take(&mut state.trains) {
            let gone = parked.has_cleared()
                && self
                    .odometers(parked.train)
                    .ok()
                    .and_then(|(signed, abs)| parked.position(&self.config, signed, abs))
                    .is_some_and(|p| p < 0.0);
            if gone {
                exited.push((parked.train, parked.platform));
            } else {
                kept.push(parked);
            }
        }
        state.trains = kept;
        drop(state);
        for (train, platform) in &exited {
            info!(train = %self.motion.roster().name(*train), "Left platform {}", platform);
            self.lift_limits(*train)?;
            self.events.emit(ControlEvent::TrainExited {
                train: *train,
                platform: *platform,
            });
        }
        Ok(exited.into_iter().map(|(train, _)| train).collect())
    }

    /// Note trains coming to rest and release stale entries
    pub fn update(&self) -> Result<()> {
        let now = Instant::now();
        let mut settle = None;
        let mut state = self.lock();
        let entering = state.entering;
        for parked in state.trains.iter_mut() {
            let speed = self.motion.speed(parked.train)?;
            let signed = self.motion.signed_distance(parked.train)?;
            if speed == 0.0 && parked.has_cleared() {
                match parked.time_stopped {
                    None => {
                        debug!(train = %self.motion.roster().name(parked.train), "Came to a stop");
                        parked.time_stopped = Some(now);
                        parked.dist_stopped = Some(signed);
                        if entering == Some(parked.train) {
                            settle = Some((parked.train, parked.platform));
                        }
                    }
                    Some(_) if !parked.has_reversed() && parked.dist_stopped != Some(signed) => {
                        parked.time_stopped = Some(now);
                        parked.dist_stopped = Some(signed);
                    }
                    Some(_) => {}
                }
            }
        }
        let stale = state
            .entering
            .and_then(|t| state.find(t))
            .and_then(|t| t.time_trip.map(|at| (t.train, t.platform, at)))
            .filter(|(_, _, at)| now.duration_since(*at) > Duration::from_millis(self.config.stale_entry_ms));
        if let Some((train, platform, _)) = stale {
            warn!(train = %self.motion.roster().name(train), "Still entering long after the trip, releasing entry");
            settle = Some((train, platform));
        }
        if let Some((train, platform)) = settle {
            self.clear_entering(&mut state)?;
            drop(state);
            self.events.emit(ControlEvent::EntrySettled { train, platform });
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Manual operations
    // -------------------------------------------------------------------------

    /// Register a train standing on `platform`
    pub fn set_occupied(&self, platform: u8, train: TrainId) -> Result<()> {
        if !self.config.routes.contains_key(&platform) {
            return Err(ControlError::InvalidPlatform(platform));
        }
        let (signed, abs) = self.odometers(train)?;
        let mut state = self.lock();
        if state.entering == Some(train) {
            self.clear_entering(&mut state)?;
        }
        if let Some(parked) = state.find_mut(train) {
            parked.platform = platform;
            info!(train = %self.motion.roster().name(train), "Moved to platform {}", platform);
        } else {
            let trip = signed - self.config.default_position;
            state.trains.push(ParkedTrain {
                train,
                platform,
                dist_request: None,
                dist_trip: Some(trip),
                dist_clear: Some(trip + 500.0 + self.config.sensor_length),
                dist_reverse: Some(abs),
                time_trip: None,
                time_stopped: None,
                dist_stopped: None,
            });
            info!(train = %self.motion.roster().name(train), "Registered on platform {}", platform);
        }
        drop(state);
        self.motion
            .set_speed_limit(train, TERMINUS_LIMIT, Some(self.config.speed_limit))
    }

    /// Forget a train
    pub fn release(&self, train: TrainId) -> Result<()> {
        let mut state = self.lock();
        let before = state.trains.len();
        state.trains.retain(|t| t.train != train);
        if state.trains.len() == before {
            return Err(ControlError::NotParked(self.motion.roster().name(train)));
        }
        if state.entering == Some(train) {
            self.clear_entering(&mut state)?;
        }
        drop(state);
        self.lift_limits(train)
    }

    /// Forget whatever stands on `platform`
    pub fn set_empty(&self, platform: u8) -> Result<()> {
        let trains: Vec<TrainId> = self
            .lock()
            .trains
            .iter()
            .filter(|t| t.platform == platform)
            .map(|t| t.train)
            .collect();
        for train in trains {
            self.release(train)?;
        }
        Ok(())
    }

    /// Allow entries again after a contested entry
    pub fn reset_entry_lock(&self) {
        let mut state = self.lock();
        if state.locked {
            info!("Terminus entry lock reset");
        }
        state.locked = false;
    }

    /// Remember the first reverse of a parked train
    pub fn on_reversed(&self, train: TrainId) -> Result<()> {
        let abs = self.motion.abs_distance(train)?;
        let mut state = self.lock();
        if let Some(parked) = state.find_mut(train) {
            if parked.dist_reverse.is_none() {
                parked.dist_reverse = Some(abs);
                info!(train = %self.motion.roster().name(train), "Reversed in terminus");
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    pub fn save_state(&self, path: &Path) -> Result<()> {
        let trains = self
            .lock()
            .trains
            .iter()
            .map(|t| {
                let (signed, abs) = self.odometers(t.train)?;
                Ok(SavedTrain {
                    train: self.motion.roster().name(t.train),
                    platform: t.platform,
                    signed_distance: signed,
                    abs_distance: abs,
                    request: t.dist_request,
                    trip: t.dist_trip,
                    clear: t.dist_clear,
                    reverse: t.dist_reverse,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let json = serde_json::to_string_pretty(&SavedTerminus { trains })?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| ControlError::persistence(dir, e))?;
        }
        std::fs::write(path, json).map_err(|e| ControlError::persistence(path, e))
    }

    /// Restore saved trains, shifting their markers by the odometer change
    /// since saving
    pub fn load_state(&self, path: &Path) -> Result<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let content =
            std::fs::read_to_string(path).map_err(|e| ControlError::persistence(path, e))?;
        let saved: SavedTerminus = serde_json::from_str(&content)?;
        let mut restored = Vec::new();
        for entry in saved.trains {
            let Some(train) = self.motion.roster().find(&entry.train) else {
                warn!("Ignoring unknown train '{}' in {}", entry.train, path.display());
                continue;
            };
            let (signed, abs) = self.odometers(train)?;
            let shift = signed - entry.signed_distance;
            let abs_shift = abs - entry.abs_distance;
            restored.push(ParkedTrain {
                train,
                platform: entry.platform,
                dist_request: entry.request.map(|d| d + shift),
                dist_trip: entry.trip.map(|d| d + shift),
                dist_clear: entry.clear.map(|d| d + shift),
                // the train may have been turned while powered down
                dist_reverse: Some(entry.reverse.map(|d| d + abs_shift).unwrap_or(abs)),
                time_trip: None,
                time_stopped: None,
                dist_stopped: Some(signed),
            });
        }
        let count = restored.len();
        for parked in &restored {
            self.motion
                .set_speed_limit(parked.train, TERMINUS_LIMIT, Some(self.config.speed_limit))?;
        }
        let mut state = self.lock();
        state.trains.retain(|t| !restored.iter().any(|r| r.train == t.train));
        state.trains.extend(restored);
        info!("Restored {} terminus trains from {}", count, path.display());
        Ok(count)
    }

    fn lock(&self) -> MutexGuard<'_, TerminusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
