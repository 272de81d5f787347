//! Position tracker
//!
//! Follows one train around the layout by integrating the motion
//! controller's odometer, and runs drive-to operations: drive toward a
//! position, optionally correcting the estimate at contacts on the way, brake
//! so the train stops on target, and report completion once it has stood
//! still for the requested pause.
//!
//! At most one drive is in flight per train. [`PositionTracker::drive`]
//! queues behind the previous one.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use track_signal::{ContactPin, SignalGenerator};

use crate::error::{ControlError, Result};
use crate::events::{ControlEvent, Events};
use crate::motion::MotionController;
use crate::roster::TrainId;
use crate::topology::{PositionState, TrackGeometry};

/// Drives closer than this to the target are skipped
const ALREADY_THERE_MM: f64 = 10.0;

/// How long [`PositionTracker::drive`] blocks after starting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitFor {
    /// Return once the drive has started
    #[default]
    None,
    /// Return once the train starts braking for the target
    Brake,
    /// Return once the drive is complete
    Done,
}

/// Tuning of a single drive
#[derive(Debug, Clone, PartialEq)]
pub struct DriveOptions {
    /// Cruise speed in km/h
    pub max_speed: f64,
    /// Stop instantly when the target is overshot
    pub use_emergency_stop: bool,
    pub wait: WaitFor,
    /// How long each waypoint contact may take to trip
    pub waypoint_timeout: Duration,
    /// Speed for the final approach
    pub creep_speed: f64,
    /// Length of the final approach in mm, on top of the braking distance
    pub creep_distance: f64,
}

impl Default for DriveOptions {
    fn default() -> Self {
        Self {
            max_speed: 80.0,
            use_emergency_stop: false,
            wait: WaitFor::None,
            waypoint_timeout: Duration::from_secs(120),
            creep_speed: 20.0,
            creep_distance: 100.0,
        }
    }
}

impl DriveOptions {
    pub fn wait_for(mut self, wait: WaitFor) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_emergency_stop(mut self) -> Self {
        self.use_emergency_stop = true;
        self
    }

    pub fn with_max_speed(mut self, max_speed: f64) -> Self {
        self.max_speed = max_speed;
        self
    }

    pub fn with_waypoint_timeout(mut self, timeout: Duration) -> Self {
        self.waypoint_timeout = timeout;
        self
    }
}

/// A contact the train must trip on its way
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Waypoint {
    pub pin: ContactPin,
    /// Train centre position when the contact trips
    pub position: f64,
    /// Level the contact changes to when tripped
    pub level: bool,
}

impl Waypoint {
    /// Contact that pulls its line low when tripped
    pub fn new(pin: ContactPin, position: f64) -> Self {
        Self {
            pin,
            position,
            level: false,
        }
    }
}

/// Progress of the current drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DriveStatus {
    Idle,
    Driving,
    Braking,
}

/// Observable state of a tracker
#[derive(Debug, Clone, Serialize)]
pub struct TrackerSnapshot {
    pub train: TrainId,
    pub state: PositionState,
    pub status: DriveStatus,
    /// Target position of the current drive
    pub target: Option<f64>,
    /// Odometer distance left to the target
    pub remaining: Option<f64>,
    pub waypoints: Vec<Waypoint>,
}

#[derive(Debug)]
struct Drive {
    target_position: f64,
    target_signed_distance: f64,
    increase_signed_distance: bool,
    pause: Duration,
    waypoints: VecDeque<Waypoint>,
    /// Distance from each waypoint to the target
    contact_to_target: VecDeque<f64>,
    braking: bool,
    stopped_since: Option<Instant>,
    warned_waypoint: bool,
    options: DriveOptions,
}

impl Drive {
    fn direction(&self) -> f64 {
        if self.increase_signed_distance {
            1.0
        } else {
            -1.0
        }
    }

    /// Odometer distance left, negative once overshot
    fn remaining(&self, cumulative_signed_distance: f64) -> f64 {
        (self.target_signed_distance - cumulative_signed_distance) * self.direction()
    }
}

#[derive(Debug)]
struct Inner {
    state: PositionState,
    drive: Option<Drive>,
    generation: u64,
    waiter: Option<JoinHandle<()>>,
    outcome: Option<std::result::Result<(), String>>,
}

/// Tracks the position of one train and drives it to targets
pub struct PositionTracker {
    train: TrainId,
    name: String,
    motion: Arc<MotionController>,
    contacts: Option<SignalGenerator>,
    geometry: TrackGeometry,
    inner: Mutex<Inner>,
    queue: tokio::sync::Mutex<()>,
    status: watch::Sender<DriveStatus>,
    events: Events,
}

impl std::fmt::Debug for PositionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionTracker")
            .field("train", &self.name)
            .field("state", &self.state())
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl PositionTracker {
    /// Track `train` starting from `initial`.
    ///
    /// Without a `contacts` generator, waypoints are ignored.
    pub fn new(
        train: TrainId,
        motion: Arc<MotionController>,
        contacts: Option<SignalGenerator>,
        geometry: TrackGeometry,
        initial: PositionState,
    ) -> Result<Self> {
        let name = motion.roster().train(train)?.name.clone();
        let odometer = motion.signed_distance(train)?;
        let events = motion.events().clone();
        let (status, _) = watch::channel(DriveStatus::Idle);
        info!(train = %name, "Tracking from {}", initial);
        Ok(Self {
            train,
            name,
            motion,
            contacts,
            geometry,
            inner: Mutex::new(Inner {
                state: initial.at_odometer(odometer),
                drive: None,
                generation: 0,
                waiter: None,
                outcome: None,
            }),
            queue: tokio::sync::Mutex::new(()),
            status,
            events,
        })
    }

    pub fn train(&self) -> TrainId {
        self.train
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> PositionState {
        self.inner().state
    }

    pub fn status(&self) -> DriveStatus {
        *self.status.borrow()
    }

    pub fn is_executing(&self) -> bool {
        self.status() != DriveStatus::Idle
    }

    pub fn geometry(&self) -> &TrackGeometry {
        &self.geometry
    }

    /// Generator whose contacts correct this train's position
    pub fn contacts(&self) -> Option<&SignalGenerator> {
        self.contacts.as_ref()
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        let odometer = self.motion.signed_distance(self.train).unwrap_or(0.0);
        let inner = self.inner();
        TrackerSnapshot {
            train: self.train,
            state: inner.state,
            status: self.status(),
            target: inner.drive.as_ref().map(|d| d.target_position),
            remaining: inner.drive.as_ref().map(|d| d.remaining(odometer)),
            waypoints: inner
                .drive
                .as_ref()
                .map(|d| d.waypoints.iter().copied().collect())
                .unwrap_or_default(),
        }
    }

    /// Replace the position estimate
    pub fn set_position(&self, state: PositionState) -> Result<()> {
        let odometer = self.motion.signed_distance(self.train)?;
        info!(train = %self.name, "Position set to {}", state);
        self.inner().state = state.at_odometer(odometer);
        Ok(())
    }

    /// Snap the position to where `pin` trips, outside of drives.
    /// Returns the applied correction in mm.
    pub fn correct_position(&self, pin: ContactPin, position: f64) -> Result<f64> {
        let odometer = self.motion.signed_distance(self.train)?;
        let (state, delta) = {
            let mut inner = self.inner();
            let current = self.geometry.update(&inner.state, odometer);
            let Some(track) = current.track.filter(|_| current.is_known()) else {
                return Err(ControlError::PositionUnknown(self.name.clone()));
            };
            let projected = self.geometry.project(position, track);
            let delta = projected - current.position;
            inner.state = PositionState {
                position: projected,
                ..current
            };
            (inner.state, delta)
        };
        info!(train = %self.name, "{} tripped, corrected by {:.0} mm", pin, delta);
        self.events.emit(ControlEvent::PositionCorrected {
            train: self.train,
            pin,
            delta,
            state,
        });
        Ok(delta)
    }

    // -------------------------------------------------------------------------
    // Drives
    // -------------------------------------------------------------------------

    /// Drive to `target` and stand still for `pause` afterwards.
    ///
    /// Waits for any previous drive to finish first. Each waypoint's contact
    /// must trip in order; the position is corrected at every trip.
    pub async fn drive(
        self: &Arc<Self>,
        target: f64,
        pause: Duration,
        waypoints: Vec<Waypoint>,
        options: DriveOptions,
    ) -> Result<()> {
        let wait = options.wait;
        {
            let _turn = self.queue.lock().await;
            let _ = self.wait().await;
            self.start_drive(target, pause, waypoints, options)?;
        }
        match wait {
            WaitFor::None => Ok(()),
            WaitFor::Brake => {
                let mut rx = self.status.subscribe();
                let _ = rx.wait_for(|s| *s != DriveStatus::Driving).await;
                Ok(())
            }
            WaitFor::Done => self.wait().await,
        }
    }

    fn start_drive(
        self: &Arc<Self>,
        target: f64,
        pause: Duration,
        waypoints: Vec<Waypoint>,
        options: DriveOptions,
    ) -> Result<()> {
        let odometer = self.motion.signed_distance(self.train)?;
        let mut inner = self.inner();
        inner.state = self.geometry.update(&inner.state, odometer);
        let state = inner.state;
        if !state.is_known() {
            return Err(ControlError::PositionUnknown(self.name.clone()));
        }
        let aligned = state.aligned == Some(true);
        let distance = (target - state.position) * state.orientation();
        let increase_position = target >= state.position;
        let waypoints: VecDeque<Waypoint> = if self.contacts.is_some() {
            waypoints.into()
        } else {
            VecDeque::new()
        };
        info!(
            train = %self.name,
            "Drive {:.0} mm from {} to {:.0}, {} waypoints",
            distance,
            state,
            target,
            waypoints.len()
        );
        if distance.abs() < ALREADY_THERE_MM {
            info!(train = %self.name, "Already there");
            inner.outcome = Some(Ok(()));
            return Ok(());
        }
        inner.generation += 1;
        let generation = inner.generation;
        inner.drive = Some(Drive {
            target_position: target,
            target_signed_distance: odometer + distance,
            increase_signed_distance: increase_position ^ !aligned,
            pause,
            contact_to_target: waypoints
                .iter()
                .map(|w| (target - w.position).abs())
                .collect(),
            waypoints,
            braking: false,
            stopped_since: None,
            warned_waypoint: false,
            options,
        });
        inner.outcome = None;
        let has_waypoints = inner
            .drive
            .as_ref()
            .is_some_and(|d| !d.waypoints.is_empty());
        if has_waypoints {
            let tracker = Arc::clone(self);
            if let Some(old) = inner.waiter.replace(tokio::spawn(async move {
                tracker.await_waypoints(generation).await;
            })) {
                old.abort();
            }
        }
        drop(inner);
        self.status.send_replace(DriveStatus::Driving);
        self.events.emit(ControlEvent::DriveStarted {
            train: self.train,
            target,
        });
        Ok(())
    }

    /// Wait until no drive is in flight. Fails if the last drive was aborted.
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.status.subscribe();
        let _ = rx.wait_for(|s| *s == DriveStatus::Idle).await;
        match self.inner().outcome.clone() {
            Some(Err(reason)) => Err(ControlError::AbortedDrive {
                train: self.name.clone(),
                reason,
            }),
            _ => Ok(()),
        }
    }

    /// Give up the current drive and stop the train
    pub fn abort_drive(&self, reason: &str) -> Result<()> {
        let generation = self.inner().generation;
        self.abort_generation(generation, reason)
    }

    fn abort_generation(&self, generation: u64, reason: &str) -> Result<()> {
        {
            let mut inner = self.inner();
            if inner.generation != generation || inner.drive.is_none() {
                return Ok(());
            }
            inner.drive = None;
            inner.generation += 1;
            inner.outcome = Some(Err(reason.to_string()));
            if let Some(waiter) = inner.waiter.take() {
                waiter.abort();
            }
        }
        warn!(train = %self.name, "Drive aborted: {}", reason);
        self.status.send_replace(DriveStatus::Idle);
        self.events.emit(ControlEvent::DriveAborted {
            train: self.train,
            reason: reason.to_string(),
        });
        self.motion.force_stop(self.train, "drive aborted")
    }

    async fn await_waypoints(self: Arc<Self>, generation: u64) {
        let Some(contacts) = self.contacts.clone() else {
            return;
        };
        let listener = format!("tracker-{}", self.name);
        loop {
            let (waypoint, timeout) = {
                let inner = self.inner();
                if inner.generation != generation {
                    return;
                }
                match inner.drive.as_ref().and_then(|d| {
                    d.waypoints
                        .front()
                        .map(|w| (*w, d.options.waypoint_timeout))
                }) {
                    Some(next) => next,
                    None => return,
                }
            };
            debug!(train = %self.name, "Waiting for {}", waypoint.pin);
            let result = contacts
                .await_event(&[waypoint.pin], &[waypoint.level], timeout, &listener)
                .await;
            let outcome = match result {
                Ok(_) => self.on_waypoint(generation, waypoint),
                Err(e) => {
                    let reason = format!("waiting for {}: {}", waypoint.pin, e);
                    self.abort_generation(generation, &reason)
                }
            };
            if let Err(e) = outcome {
                warn!(train = %self.name, "Waypoint handling failed: {}", e);
                self.events.error(&self.name, e);
                return;
            }
        }
    }

    /// Correct the position at a tripped waypoint
    fn on_waypoint(&self, generation: u64, waypoint: Waypoint) -> Result<()> {
        let odometer = self.motion.signed_distance(self.train)?;
        let (state, delta, overshot) = {
            let mut inner = self.inner();
            if inner.generation != generation {
                return Ok(());
            }
            let current = self.geometry.update(&inner.state, odometer);
            let Some(track) = current.track else {
                return Err(ControlError::PositionUnknown(self.name.clone()));
            };
            let projected = self.geometry.project(waypoint.position, track);
            let projected_delta = projected - current.position;
            let direct_delta = waypoint.position - current.position;
            let delta = if direct_delta.abs() < projected_delta.abs() {
                direct_delta
            } else {
                projected_delta
            };
            let state = PositionState {
                position: projected,
                ..current
            };
            inner.state = state;
            let orientation = state.orientation();
            let Some(drive) = inner.drive.as_mut() else {
                return Ok(());
            };
            drive.target_signed_distance -= delta * orientation;
            drive.waypoints.pop_front();
            drive.contact_to_target.pop_front();
            let overshot = drive.remaining(odometer) < 0.0 && drive.waypoints.is_empty();
            (state, delta, overshot)
        };
        info!(
            train = %self.name,
            "Tripped {}, position corrected by {:.0} mm to {}",
            waypoint.pin,
            delta,
            state
        );
        self.events.emit(ControlEvent::PositionCorrected {
            train: self.train,
            pin: waypoint.pin,
            delta,
            state,
        });
        if overshot {
            warn!(train = %self.name, "Target overshot after contact correction");
            self.motion.emergency_stop(self.train, "overshoot after contact")?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Update
    // -------------------------------------------------------------------------

    /// Follow the odometer and steer the current drive. Call after every
    /// motion tick.
    pub fn update(&self) -> Result<()> {
        let odometer = self.motion.signed_distance(self.train)?;
        let speed = self.motion.speed(self.train)?.abs();
        let deceleration = self.motion.roster().train(self.train)?.deceleration();
        let scale = self.motion.config().scale;

        let mut inner = self.inner();
        let previous = inner.state;
        inner.state = self.geometry.update(&previous, odometer);
        let Inner { state, drive, .. } = &mut *inner;
        let Some(drive) = drive.as_mut() else {
            return Ok(());
        };
        if speed > 0.0 {
            drive.stopped_since = None;
        }

        let braking_distance =
            0.5 * (deceleration / 3.6) * (speed / deceleration).powi(2) * 1000.0 / scale;
        let mut distance = drive.remaining(odometer);
        if let Some(contact_to_target) = drive.contact_to_target.front().copied() {
            if contact_to_target > distance {
                // hold at the contact until it trips
                distance = contact_to_target;
                drive.target_signed_distance += odometer - previous.cumulative_signed_distance;
                *state = previous.at_odometer(odometer);
            }
        }

        if distance < 0.0 && speed > 0.0 && drive.options.use_emergency_stop {
            warn!(train = %self.name, "Emergency stop due to overshoot");
            self.motion.emergency_stop(self.train, "drive overshoot")?;
        }

        let direction = drive.direction();
        // once braking, standing still short of the target still ends the drive
        if distance <= braking_distance || (drive.braking && speed == 0.0) {
            let done = self.brake_wait(drive, speed)?;
            if done {
                let position = state.position;
                inner.drive = None;
                inner.outcome = Some(Ok(()));
                drop(inner);
                info!(train = %self.name, "Drive done at {:.0}", position);
                self.status.send_replace(DriveStatus::Idle);
                self.events.emit(ControlEvent::DriveCompleted {
                    train: self.train,
                    position,
                });
            }
        } else if distance <= braking_distance + drive.options.creep_distance {
            let creep = if drive.braking {
                speed.min(drive.options.creep_speed)
            } else {
                drive.options.creep_speed
            };
            self.motion.set_target_speed(self.train, creep * direction)?;
        } else {
            let cruise = if drive.braking {
                speed.min(drive.options.max_speed)
            } else {
                drive.options.max_speed
            };
            self.motion.set_target_speed(self.train, cruise * direction)?;
        }
        Ok(())
    }

    /// Brake, then wait out the pause. Returns whether the drive is complete.
    /// The pause starts over whenever the train moves again.
    fn brake_wait(&self, drive: &mut Drive, speed: f64) -> Result<bool> {
        if let Some(waypoint) = drive.waypoints.front() {
            if !drive.warned_waypoint {
                warn!(
                    train = %self.name,
                    "Cannot brake before {} has tripped",
                    waypoint.pin
                );
                drive.warned_waypoint = true;
            }
            return Ok(false);
        }
        if !drive.braking {
            drive.braking = true;
            self.status.send_replace(DriveStatus::Braking);
        }
        if self.motion.target_speed(self.train)? != 0.0 {
            self.motion.set_target_speed(self.train, 0.0)?;
            return Ok(false);
        }
        if speed > 0.0 {
            return Ok(false);
        }
        let now = Instant::now();
        match drive.stopped_since {
            None => {
                drive.stopped_since = Some(now);
                Ok(false)
            }
            Some(since) => Ok(now.duration_since(since) >= drive.pause),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drive_remaining() {
        let drive = Drive {
            target_position: 0.0,
            target_signed_distance: -500.0,
            increase_signed_distance: false,
            pause: Duration::ZERO,
            waypoints: VecDeque::new(),
            contact_to_target: VecDeque::new(),
            braking: false,
            stopped_since: None,
            warned_waypoint: false,
            options: DriveOptions::default(),
        };
        assert_eq!(drive.remaining(0.0), 500.0);
        assert_eq!(drive.remaining(-600.0), -100.0);
    }

    #[test]
    fn test_default_options() {
        let options = DriveOptions::default();
        assert_eq!(options.max_speed, 80.0);
        assert_eq!(options.creep_speed, 20.0);
        assert_eq!(options.wait, WaitFor::None);
    }
}
