//! Layout assembly
//!
//! [`World`] owns the motion controller, one position tracker per tracked
//! train and the optional terminus, and runs their periodic work.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use track_signal::{RelayBoard, SignalEvent, SignalGenerator};

use crate::error::{ControlError, Result};
use crate::events::{ControlEvent, Events};
use crate::motion::{Direction, MotionConfig, MotionController, TrainSnapshot};
use crate::position_log::{read_last_positions, PositionLog};
use crate::roster::{Roster, TrainId};
use crate::routines::{Crew, RoutineConfig};
use crate::terminus::{PlatformState, Terminus, TerminusConfig};
use crate::topology::{PositionState, TrackGeometry};
use crate::tracker::{PositionTracker, TrackerSnapshot};

const TERMINUS_FILE: &str = "terminus.json";

/// Everything about the layout that is not a train
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    pub motion: MotionConfig,
    pub geometry: TrackGeometry,
    pub terminus: TerminusConfig,
    /// Trains with position tracking, in position log column order
    pub tracked: Vec<String>,
    /// Where position logs and terminus state are kept
    pub data_dir: Option<PathBuf>,
    pub exit_check_ms: u64,
    pub save_interval_ms: u64,
    pub log_interval_ms: u64,
    pub routines: RoutineConfig,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            motion: MotionConfig::default(),
            geometry: TrackGeometry::default(),
            terminus: TerminusConfig::default(),
            tracked: Vec::new(),
            data_dir: None,
            exit_check_ms: 1000,
            save_interval_ms: 5000,
            log_interval_ms: 2000,
            routines: RoutineConfig::default(),
        }
    }
}

impl LayoutConfig {
    pub fn exit_check(&self) -> Duration {
        Duration::from_millis(self.exit_check_ms.max(1))
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_millis(self.save_interval_ms.max(1))
    }

    pub fn log_interval(&self) -> Duration {
        Duration::from_millis(self.log_interval_ms.max(1))
    }

    fn terminus_file(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(TERMINUS_FILE))
    }
}

/// Observable state of the whole layout
#[derive(Debug, Clone, Serialize)]
pub struct WorldSnapshot {
    pub trains: Vec<TrainSnapshot>,
    pub trackers: Vec<TrackerSnapshot>,
    pub platforms: BTreeMap<u8, PlatformState>,
    pub entering: Option<TrainId>,
    pub entry_locked: bool,
    pub power: bool,
    /// Last error per signal port that has one
    pub port_errors: BTreeMap<String, String>,
}

/// The controlled layout
pub struct World {
    config: LayoutConfig,
    motion: Arc<MotionController>,
    trackers: Vec<Arc<PositionTracker>>,
    terminus: Option<Arc<Terminus>>,
    position_log: Mutex<Option<PositionLog>>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("motion", &self.motion)
            .field("trackers", &self.trackers.len())
            .field("terminus", &self.terminus.is_some())
            .finish()
    }
}

impl World {
    pub fn new(roster: Roster, config: LayoutConfig, events: Events) -> Self {
        let motion = Arc::new(MotionController::new(roster, config.motion.clone(), events));
        Self {
            config,
            motion,
            trackers: Vec::new(),
            terminus: None,
            position_log: Mutex::new(None),
            forwarders: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &LayoutConfig {
        &self.config
    }

    pub fn motion(&self) -> &Arc<MotionController> {
        &self.motion
    }

    pub fn events(&self) -> &Events {
        self.motion.events()
    }

    pub fn trackers(&self) -> &[Arc<PositionTracker>] {
        &self.trackers
    }

    pub fn tracker(&self, train: TrainId) -> Option<&Arc<PositionTracker>> {
        self.trackers.iter().find(|t| t.train() == train)
    }

    pub fn terminus(&self) -> Option<&Arc<Terminus>> {
        self.terminus.as_ref()
    }

    fn require_terminus(&self) -> Result<&Arc<Terminus>> {
        self.terminus.as_ref().ok_or(ControlError::NoTerminus)
    }

    fn require_tracker(&self, train: TrainId) -> Result<&Arc<PositionTracker>> {
        self.tracker(train)
            .ok_or_else(|| ControlError::PositionUnknown(self.motion.roster().name(train)))
    }

    // -------------------------------------------------------------------------
    // Setup
    // -------------------------------------------------------------------------

    /// Broadcast trains through `generator` and report its faults.
    ///
    /// Must be called within a tokio runtime.
    pub fn add_generator(&self, generator: SignalGenerator, trains: Option<Vec<TrainId>>) {
        let mut rx = generator.subscribe();
        let events = self.events().clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(SignalEvent::ShortCircuit { port }) => {
                        warn!(port = %port, "Short circuit");
                        events.emit(ControlEvent::ShortCircuit { port });
                    }
                    Ok(SignalEvent::PortUnavailable { port, reason }) => {
                        events.emit(ControlEvent::PortUnavailable { port, reason });
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => debug!("Generator events lagged by {}", n),
                    Err(RecvError::Closed) => break,
                }
            }
        });
        self.forwarders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(forwarder);
        self.motion.add_generator(generator, trains);
    }

    /// Start tracking `train` from `initial`
    pub fn track(
        &mut self,
        train: TrainId,
        contacts: Option<SignalGenerator>,
        initial: PositionState,
    ) -> Result<Arc<PositionTracker>> {
        if let Some(existing) = self.tracker(train) {
            existing.set_position(initial)?;
            return Ok(Arc::clone(existing));
        }
        let tracker = Arc::new(PositionTracker::new(
            train,
            Arc::clone(&self.motion),
            contacts,
            self.config.geometry.clone(),
            initial,
        )?);
        self.trackers.push(Arc::clone(&tracker));
        Ok(tracker)
    }

    /// Track every configured train from its last logged position and start
    /// a new position log
    pub fn restore_tracking(&mut self, contacts: Option<SignalGenerator>) -> Result<()> {
        let trains = self
            .config
            .tracked
            .iter()
            .map(|name| {
                self.motion
                    .roster()
                    .find(name)
                    .ok_or_else(|| ControlError::UnknownTrain(name.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        let states = match &self.config.data_dir {
            Some(dir) => read_last_positions(dir, trains.len()),
            None => vec![PositionState::unknown(); trains.len()],
        };
        for (train, state) in trains.into_iter().zip(states) {
            self.track(train, contacts.clone(), state)?;
        }
        if let Some(dir) = self.config.data_dir.clone() {
            self.start_position_log(&dir)?;
        }
        Ok(())
    }

    pub fn start_position_log(&self, dir: &Path) -> Result<()> {
        let log = PositionLog::create(dir)?;
        *self.position_log.lock().unwrap_or_else(PoisonError::into_inner) = Some(log);
        Ok(())
    }

    /// Attach the terminus and restore its saved trains
    pub fn attach_terminus(
        &mut self,
        relay: Arc<dyn RelayBoard>,
        sensor: SignalGenerator,
    ) -> Result<Arc<Terminus>> {
        let terminus = Arc::new(Terminus::new(
            Arc::clone(&self.motion),
            relay,
            sensor,
            self.config.terminus.clone(),
        )?);
        if let Some(path) = self.config.terminus_file() {
            if let Err(e) = terminus.load_state(&path) {
                warn!("Cannot restore terminus from {}: {}", path.display(), e);
            }
        }
        self.terminus = Some(Arc::clone(&terminus));
        Ok(terminus)
    }

    // -------------------------------------------------------------------------
    // Operations spanning several parts
    // -------------------------------------------------------------------------

    /// Reverse a train and let the terminus know
    pub fn reverse(&self, train: TrainId) -> Result<Direction> {
        let direction = self.motion.reverse(train)?;
        if let Some(terminus) = &self.terminus {
            terminus.on_reversed(train)?;
        }
        Ok(direction)
    }

    pub fn request_entry(&self, train: TrainId) -> Result<u8> {
        self.require_terminus()?.request_entry(train)
    }

    pub fn set_platform_occupied(&self, platform: u8, train: TrainId) -> Result<()> {
        self.require_terminus()?.set_occupied(platform, train)
    }

    /// Forget a train in the terminus
    pub fn release_train(&self, train: TrainId) -> Result<()> {
        self.require_terminus()?.release(train)
    }

    pub fn set_platform_empty(&self, platform: u8) -> Result<()> {
        self.require_terminus()?.set_empty(platform)
    }

    pub fn reset_entry_lock(&self) -> Result<()> {
        self.require_terminus()?.reset_entry_lock();
        Ok(())
    }

    pub fn set_position(&self, train: TrainId, state: PositionState) -> Result<()> {
        self.require_tracker(train)?.set_position(state)
    }

    pub fn abort_drive(&self, train: TrainId, reason: &str) -> Result<()> {
        self.require_tracker(train)?.abort_drive(reason)
    }

    /// Tracker for a drive request
    pub fn driver(&self, train: TrainId) -> Result<Arc<PositionTracker>> {
        self.require_tracker(train).map(Arc::clone)
    }

    /// The configured outer and shuttle trains, both tracked
    pub fn crew(&self) -> Result<Crew> {
        let config = &self.config.routines;
        let tracked = |name: &Option<String>, role: &str| -> Result<Arc<PositionTracker>> {
            let name = name
                .as_deref()
                .ok_or_else(|| ControlError::Routine(format!("no {} train configured", role)))?;
            let train = self
                .motion
                .roster()
                .find(name)
                .ok_or_else(|| ControlError::UnknownTrain(name.to_string()))?;
            self.driver(train)
        };
        let outer = tracked(&config.outer_train, "outer")?;
        let shuttle = tracked(&config.shuttle_train, "shuttle")?;
        if outer.train() == shuttle.train() {
            return Err(ControlError::Routine(format!(
                "{} cannot be both outer train and shuttle",
                outer.name()
            )));
        }
        Ok(Crew::new(outer, shuttle, config.clone(), self.events().clone()))
    }

    pub fn snapshot(&self) -> WorldSnapshot {
        let (platforms, entering, entry_locked) = match &self.terminus {
            Some(t) => (t.platform_states(), t.entering(), t.is_locked()),
            None => (BTreeMap::new(), None, false),
        };
        WorldSnapshot {
            trains: self.motion.snapshots(),
            trackers: self.trackers.iter().map(|t| t.snapshot()).collect(),
            platforms,
            entering,
            entry_locked,
            power: self.motion.is_power_on(None),
            port_errors: self
                .motion
                .generators()
                .iter()
                .filter_map(|g| g.error().map(|e| (g.port().to_string(), e)))
                .collect(),
        }
    }

    // -------------------------------------------------------------------------
    // Periodic work
    // -------------------------------------------------------------------------

    /// Advance motion by `dt`, then trackers and terminus
    pub fn tick(&self, dt: Duration) {
        self.motion.tick(dt);
        for tracker in &self.trackers {
            if let Err(e) = tracker.update() {
                warn!(train = %self.motion.roster().name(tracker.train()), "Tracker update failed: {}", e);
                self.events().error("tracker", e);
            }
        }
        if let Some(terminus) = &self.terminus {
            if let Err(e) = terminus.update() {
                warn!("Terminus update failed: {}", e);
                self.events().error("terminus", e);
            }
        }
    }

    pub fn check_exited(&self) {
        if let Some(terminus) = &self.terminus {
            if let Err(e) = terminus.check_exited() {
                warn!("Exit check failed: {}", e);
                self.events().error("terminus", e);
            }
        }
    }

    /// Write the terminus state file
    pub fn save(&self) -> Result<()> {
        match (&self.terminus, self.config.terminus_file()) {
            (Some(terminus), Some(path)) => terminus.save_state(&path),
            _ => Ok(()),
        }
    }

    /// Append the tracked positions to the position log
    pub fn log_positions(&self) -> Result<()> {
        let mut log = self.position_log.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(log) = log.as_mut() else {
            return Ok(());
        };
        let states: Vec<PositionState> = self.trackers.iter().map(|t| t.state()).collect();
        log.append(&states)
    }

    /// Stop everything, persist state and close the ports
    pub fn shutdown(&self) {
        info!("Shutting down layout");
        if let Err(e) = self.motion.emergency_stop_all("shutdown") {
            warn!("Cannot stop all trains: {}", e);
        }
        if let Err(e) = self.save() {
            warn!("Cannot save terminus: {}", e);
        }
        if let Err(e) = self.log_positions() {
            warn!("Cannot log positions: {}", e);
        }
        for generator in self.motion.generators() {
            generator.shutdown();
        }
        for forwarder in self
            .forwarders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            forwarder.abort();
        }
    }
}
