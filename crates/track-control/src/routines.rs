//! Layout routines
//!
//! Programs for the two tracked trains of the museum layout: the outer
//! train stays on the outer loop, the shuttle runs the inner loop and
//! reaches the outer loop over the airport connector.
//!
//! A routine is planned as a list of [`Leg`]s from the current positions and
//! then driven leg by leg. Each leg queues behind the previous drive of the
//! same train, so both trains move at the same time.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, info, warn};
use track_signal::{ContactPin, SignalGenerator};

use crate::error::{ControlError, Result};
use crate::events::{ControlEvent, Events};
use crate::roster::TrainId;
use crate::topology::landmarks::*;
use crate::topology::{
    PositionState, TrackGeometry, TrackLoop, AIRPORT_CONTACT, INNER_CONTACT, OUTER_CONTACT,
    TRAIN_CONTACT,
};
use crate::tracker::{DriveOptions, PositionTracker, WaitFor, Waypoint};

/// Who drives the routines and how long trains stop at stations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutineConfig {
    /// Train that stays on the outer loop
    pub outer_train: Option<String>,
    /// Train that runs the inner loop and the airport connector
    pub shuttle_train: Option<String>,
    /// Shortest stop at a station
    pub pause_ms: u64,
    /// Longest random addition to a stop
    pub pause_random_ms: u64,
    pub regular_rounds: usize,
    pub fast_rounds: usize,
    pub outside_rounds: usize,
}

impl Default for RoutineConfig {
    fn default() -> Self {
        Self {
            outer_train: None,
            shuttle_train: None,
            pause_ms: 10_000,
            pause_random_ms: 15_000,
            regular_rounds: 2,
            fast_rounds: 4,
            outside_rounds: 1,
        }
    }
}

impl RoutineConfig {
    /// Station stop scaled by `scale`
    fn draw_pause(&self, rng: &mut impl Rng, scale: f64) -> Duration {
        let ms = (self.pause_ms as f64 + rng.gen::<f64>() * self.pause_random_ms as f64) * scale;
        Duration::from_secs_f64(ms.max(0.0) / 1000.0)
    }
}

/// Tracked train a leg moves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Outer,
    Shuttle,
}

/// One drive of a routine
#[derive(Debug, Clone, PartialEq)]
pub struct Leg {
    pub role: Role,
    pub target: f64,
    pub pause: Duration,
    pub waypoints: Vec<Waypoint>,
    pub options: DriveOptions,
}

impl Leg {
    pub fn new(role: Role, target: f64) -> Self {
        Self {
            role,
            target,
            pause: Duration::ZERO,
            waypoints: Vec::new(),
            options: DriveOptions::default(),
        }
    }

    fn pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    fn via(mut self, pin: ContactPin, position: f64) -> Self {
        self.waypoints.push(Waypoint::new(pin, position));
        self
    }

    fn wait_for(mut self, wait: WaitFor) -> Self {
        self.options = self.options.wait_for(wait);
        self
    }

    fn max_speed(mut self, speed: f64) -> Self {
        self.options = self.options.with_max_speed(speed);
        self
    }

    fn emergency_stop(mut self) -> Self {
        self.options = self.options.with_emergency_stop();
        self
    }
}

/// Show programs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Program {
    /// Both trains serve the stations of their own loop
    RegularRound,
    /// The outer train laps the outer loop while the shuttle serves the inner loop
    OutsideFast,
    /// The shuttle joins the outer train on the outer loop
    BothOutside,
}

impl Program {
    pub const ALL: [Program; 3] = [Program::RegularRound, Program::OutsideFast, Program::BothOutside];

    pub fn name(&self) -> &'static str {
        match self {
            Program::RegularRound => "regular",
            Program::OutsideFast => "fast",
            Program::BothOutside => "outside",
        }
    }

    /// Program that follows this one in the show rotation
    pub fn next(self) -> Self {
        match self {
            Program::RegularRound => Program::OutsideFast,
            Program::OutsideFast => Program::BothOutside,
            Program::BothOutside => Program::RegularRound,
        }
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Program {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Program::ALL
            .into_iter()
            .find(|p| p.name() == s)
            .ok_or_else(|| format!("unknown program '{s}'"))
    }
}

/// Something [`Crew::run`] can do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routine {
    /// Snap positions to contacts that are tripped right now
    CorrectPositions,
    /// Bring both trains to their home stations
    StandardPositions,
    Program(Program),
}

impl fmt::Display for Routine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Routine::CorrectPositions => f.write_str("contact correction"),
            Routine::StandardPositions => f.write_str("standard positions"),
            Routine::Program(program) => write!(f, "{} program", program),
        }
    }
}

// ============================================================================
// Planning
// ============================================================================

/// Positions implied by contacts that are tripped right now
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Corrections {
    pub outer: Option<(ContactPin, PositionState)>,
    pub shuttle: Option<(ContactPin, PositionState)>,
}

fn placed(track: TrackLoop, position: f64, aligned: Option<bool>) -> PositionState {
    PositionState {
        cumulative_signed_distance: 0.0,
        track: Some(track),
        position,
        aligned,
    }
}

/// Work out which estimates a tripped contact contradicts.
///
/// Unknown positions count as contradicted where only one train can be on
/// the contact.
pub fn contact_corrections(
    outer: &PositionState,
    shuttle: &PositionState,
    tripped: impl Fn(ContactPin) -> bool,
) -> Corrections {
    let mut corrections = Corrections::default();
    let mut shuttle = *shuttle;
    let on_outer = |state: &PositionState| state.track == Some(TrackLoop::Outer);

    if tripped(AIRPORT_CONTACT) {
        let at_contact = INNER_AIRPORT_CONTACT_WEST + TRAIN_CONTACT;
        if on_outer(&shuttle) || !(shuttle.position <= at_contact) {
            shuttle = placed(TrackLoop::Inner, at_contact, shuttle.aligned);
            corrections.shuttle = Some((AIRPORT_CONTACT, shuttle));
        }
    }

    if tripped(OUTER_CONTACT) && !on_outer(&shuttle) {
        let at_contact = OUTER_CONTACT_NORTH - TRAIN_CONTACT;
        if !(outer.position >= at_contact) {
            corrections.outer = Some((
                OUTER_CONTACT,
                placed(TrackLoop::Outer, at_contact + 10.0, Some(true)),
            ));
        }
    }

    if tripped(INNER_CONTACT) {
        let corrected = if on_outer(&shuttle) {
            Some(placed(
                TrackLoop::Inner,
                (INNER_CONTACT_SOUTH + INNER_CONTACT_NORTH) / 2.0,
                shuttle.aligned,
            ))
        } else if shuttle.position > INNER_CONTACT_SOUTH + TRAIN_CONTACT {
            // that far in, the train came round the far end
            let aligned = if shuttle.position < 1000.0 {
                shuttle.aligned
            } else {
                shuttle.aligned.map(|a| !a)
            };
            Some(placed(TrackLoop::Inner, INNER_CONTACT_SOUTH - 100.0, aligned))
        } else if shuttle.position < INNER_CONTACT_NORTH - TRAIN_CONTACT {
            Some(placed(TrackLoop::Inner, INNER_CONTACT_NORTH + 100.0, shuttle.aligned))
        } else {
            None
        };
        if let Some(state) = corrected {
            corrections.shuttle = Some((INNER_CONTACT, state));
        }
    }
    corrections
}

/// Shuttle target on the outer loop just past the airport switch
fn airport_exit(g: &TrackGeometry) -> f64 {
    -g.interim - g.inner_connection - (g.outer_until_switch - OUTER_ERDING)
}

fn inner_reversal(g: &TrackGeometry) -> Leg {
    Leg::new(Role::Shuttle, g.inner + INNER_SAFE_REVERSAL.abs()).via(
        INNER_CONTACT,
        g.inner + INNER_CONTACT_SOUTH.abs() - TRAIN_CONTACT,
    )
}

fn outer_home() -> Leg {
    Leg::new(Role::Outer, OUTER_MUNICH).via(OUTER_CONTACT, OUTER_CONTACT_NORTH - TRAIN_CONTACT)
}

/// Back the shuttle from the outer loop into the inner loop, then send both home
fn shuttle_inside(g: &TrackGeometry) -> Vec<Leg> {
    vec![
        Leg::new(Role::Shuttle, -g.outer_connection - g.half_train - 250.0)
            .via(INNER_CONTACT, INNER_CONTACT_SOUTH_FROM_OUTER)
            .wait_for(WaitFor::Done),
        outer_home().emergency_stop(),
        Leg::new(Role::Shuttle, INNER_MUNICH),
    ]
}

/// Park the outer train out of the way, then [`shuttle_inside`]
fn clear_outer_then_shuttle_inside(g: &TrackGeometry, outer_position: f64) -> Vec<Leg> {
    let mut legs = Vec::new();
    if outer_position > g.outer - g.half_train - 100.0 {
        legs.push(
            Leg::new(Role::Outer, OUTER_SAFE_WAIT + g.outer)
                .via(OUTER_CONTACT, OUTER_CONTACT_NORTH - g.half_train),
        );
    } else {
        legs.push(Leg::new(Role::Outer, OUTER_SAFE_WAIT));
    }
    legs.extend(shuttle_inside(g));
    legs
}

/// Legs that bring both trains to their home stations, `None` if the
/// positions allow no safe way there
pub fn standard_positions(
    g: &TrackGeometry,
    outer: &PositionState,
    shuttle: &PositionState,
    outer_contact_clear: bool,
) -> Option<Vec<Leg>> {
    if !outer.is_known() || !shuttle.is_known() {
        return None;
    }
    let connector_end = -g.inner_connection - g.interim + 2.0 * g.half_train + 100.0;
    let outer_at_contact = OUTER_CONTACT_NORTH - TRAIN_CONTACT;
    let mut legs = Vec::new();
    match shuttle.track? {
        TrackLoop::Inner if shuttle.position > connector_end => {
            if shuttle.position > -20.0 && shuttle.position < 2000.0 {
                legs.push(
                    Leg::new(Role::Shuttle, INNER_SAFE_REVERSAL)
                        .via(INNER_CONTACT, INNER_CONTACT_SOUTH + TRAIN_CONTACT),
                );
            } else if shuttle.position >= 2000.0 {
                legs.push(inner_reversal(g));
            } else {
                legs.push(
                    Leg::new(Role::Shuttle, INNER_AIRPORT_CONTACT_WEST)
                        .via(AIRPORT_CONTACT, INNER_AIRPORT_CONTACT_WEST + TRAIN_CONTACT)
                        .max_speed(40.0)
                        .emergency_stop(),
                );
                legs.push(Leg::new(
                    Role::Shuttle,
                    INNER_AIRPORT_CONTACT_WEST + TRAIN_CONTACT + 100.0,
                ));
            }
            if outer.position < outer_at_contact && outer_contact_clear {
                legs.push(outer_home().max_speed(50.0));
            } else {
                legs.push(Leg::new(Role::Outer, g.outer + OUTER_ERDING));
                legs.push(outer_home().max_speed(50.0).emergency_stop());
            }
            legs.push(Leg::new(Role::Shuttle, INNER_MUNICH));
        }
        TrackLoop::Inner => {
            // shuttle stands at the airport switch
            let outer_target = if outer.position < g.outer_until_switch {
                g.half_train + 100.0
            } else {
                OUTER_MUNICH
            };
            legs.push(Leg::new(Role::Outer, outer_target));
            legs.push(Leg::new(Role::Shuttle, airport_exit(g)));
            legs.push(
                Leg::new(Role::Shuttle, g.outer + g.half_train + 100.0)
                    .via(OUTER_CONTACT, OUTER_CONTACT_NORTH - g.half_train),
            );
            legs.extend(clear_outer_then_shuttle_inside(g, outer_target));
        }
        TrackLoop::Outer
            if shuttle.position < outer.position
                && outer.position < outer_at_contact
                && outer_contact_clear =>
        {
            legs.extend(shuttle_inside(g));
        }
        TrackLoop::Outer => {
            legs.push(
                Leg::new(Role::Shuttle, g.outer + g.half_train + 100.0)
                    .via(OUTER_CONTACT, OUTER_CONTACT_NORTH - g.half_train),
            );
            legs.extend(clear_outer_then_shuttle_inside(g, outer.position));
        }
    }
    Some(legs)
}

/// Legs of one run of `program`
pub fn program_legs(
    program: Program,
    g: &TrackGeometry,
    outer: &PositionState,
    shuttle: &PositionState,
    config: &RoutineConfig,
    rng: &mut impl Rng,
) -> Vec<Leg> {
    let mut stop = |scale: f64| config.draw_pause(&mut *rng, scale);
    let mut legs = Vec::new();
    match program {
        Program::RegularRound => {
            for _ in 0..config.regular_rounds {
                legs.push(Leg::new(Role::Shuttle, INNER_AIRPORT).pause(stop(1.0)));
                legs.push(Leg::new(Role::Outer, g.outer + OUTER_ERDING).pause(stop(1.0)));
                legs.push(Leg::new(Role::Shuttle, INNER_ERDING).pause(stop(1.0)));
                legs.push(Leg::new(Role::Outer, OUTER_AIRPORT).pause(stop(1.0)));
                legs.push(inner_reversal(g));
                legs.push(outer_home().pause(stop(1.0)));
                legs.push(Leg::new(Role::Shuttle, INNER_MUNICH).pause(stop(1.0)));
            }
        }
        Program::OutsideFast => {
            let rounds = config.fast_rounds.max(1);
            for _ in 0..2 {
                let mut lap = Leg::new(Role::Outer, g.outer * rounds as f64 + OUTER_MUNICH)
                    .pause(stop(1.0));
                for round in 1..=rounds {
                    lap = lap.via(
                        OUTER_CONTACT,
                        OUTER_CONTACT_NORTH - TRAIN_CONTACT + g.outer * round as f64,
                    );
                }
                legs.push(lap);
                legs.push(Leg::new(Role::Shuttle, INNER_AIRPORT).pause(stop(1.0)));
                legs.push(Leg::new(Role::Shuttle, INNER_ERDING).pause(stop(1.0)));
                legs.push(inner_reversal(g));
                legs.push(Leg::new(Role::Shuttle, INNER_MUNICH).pause(stop(1.0)));
            }
        }
        Program::BothOutside => {
            if shuttle.aligned != Some(true) {
                legs.push(inner_reversal(g));
            }
            if g.half_train + 100.0 < outer.position && outer.position < OUTER_SAFE_WAIT {
                legs.push(Leg::new(Role::Outer, g.outer + OUTER_SAFE_WAIT).wait_for(WaitFor::Brake));
            }
            legs.push(
                Leg::new(Role::Shuttle, airport_exit(g))
                    .pause(stop(0.5))
                    .via(AIRPORT_CONTACT, INNER_AIRPORT_CONTACT_WEST + TRAIN_CONTACT),
            );
            for _ in 0..config.outside_rounds.max(1) {
                legs.push(outer_home().pause(stop(1.0)));
                legs.push(
                    Leg::new(Role::Shuttle, OUTER_AIRPORT)
                        .pause(stop(1.0))
                        .wait_for(WaitFor::Brake),
                );
                legs.push(
                    Leg::new(Role::Outer, g.outer + OUTER_ERDING)
                        .pause(stop(1.0))
                        .wait_for(WaitFor::Brake),
                );
                legs.push(
                    Leg::new(Role::Shuttle, OUTER_MUNICH)
                        .pause(stop(1.0))
                        .via(OUTER_CONTACT, OUTER_CONTACT_NORTH - TRAIN_CONTACT)
                        .wait_for(WaitFor::Brake),
                );
                legs.push(
                    Leg::new(Role::Outer, OUTER_AIRPORT)
                        .pause(stop(1.0))
                        .wait_for(WaitFor::Brake),
                );
                legs.push(
                    Leg::new(Role::Shuttle, g.outer + OUTER_ERDING)
                        .pause(stop(1.0))
                        .wait_for(WaitFor::Brake),
                );
            }
            legs.push(Leg::new(Role::Outer, OUTER_SAFE_WAIT));
            legs.push(
                Leg::new(Role::Shuttle, -g.outer_connection - g.half_train - 250.0)
                    .via(INNER_CONTACT, INNER_CONTACT_SOUTH_FROM_OUTER)
                    .wait_for(WaitFor::Done),
            );
            legs.push(outer_home().pause(stop(1.0)));
            legs.push(Leg::new(Role::Shuttle, INNER_MUNICH).pause(stop(1.0)));
        }
    }
    legs
}

// ============================================================================
// Running
// ============================================================================

/// The two tracked trains that routines drive
pub struct Crew {
    outer: Arc<PositionTracker>,
    shuttle: Arc<PositionTracker>,
    contacts: Option<SignalGenerator>,
    config: RoutineConfig,
    events: Events,
}

impl fmt::Debug for Crew {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Crew")
            .field("outer", &self.outer.name())
            .field("shuttle", &self.shuttle.name())
            .field("contacts", &self.contacts.is_some())
            .finish()
    }
}

impl Crew {
    /// Contacts are read through the outer train's generator
    pub fn new(
        outer: Arc<PositionTracker>,
        shuttle: Arc<PositionTracker>,
        config: RoutineConfig,
        events: Events,
    ) -> Self {
        let contacts = outer.contacts().cloned();
        Self {
            outer,
            shuttle,
            contacts,
            config,
            events,
        }
    }

    pub fn outer(&self) -> &Arc<PositionTracker> {
        &self.outer
    }

    pub fn shuttle(&self) -> &Arc<PositionTracker> {
        &self.shuttle
    }

    fn tracker(&self, role: Role) -> &Arc<PositionTracker> {
        match role {
            Role::Outer => &self.outer,
            Role::Shuttle => &self.shuttle,
        }
    }

    fn level(&self, pin: ContactPin) -> Option<bool> {
        self.contacts
            .as_ref()
            .and_then(|c| c.contact_status().level(pin))
    }

    pub async fn run(&self, routine: Routine) -> Result<()> {
        info!("Starting {}", routine);
        self.events.emit(ControlEvent::RoutineStarted {
            routine: routine.to_string(),
        });
        let result = match routine {
            Routine::CorrectPositions => self.correct_from_contacts().map(|_| ()),
            Routine::StandardPositions => self.move_to_standard_positions().await,
            Routine::Program(program) => self.run_program(program).await,
        };
        match &result {
            Ok(()) => info!("Finished {}", routine),
            Err(e) => warn!("{} failed: {}", routine, e),
        }
        self.events.emit(ControlEvent::RoutineFinished {
            routine: routine.to_string(),
            error: result.as_ref().err().map(|e| e.to_string()),
        });
        result
    }

    /// Snap both trains to contacts that are tripped right now. Returns the
    /// corrected trains.
    pub fn correct_from_contacts(&self) -> Result<Vec<TrainId>> {
        let corrections = contact_corrections(&self.outer.state(), &self.shuttle.state(), |pin| {
            self.level(pin) == Some(false)
        });
        let mut corrected = Vec::new();
        for (tracker, correction) in [
            (&self.outer, corrections.outer),
            (&self.shuttle, corrections.shuttle),
        ] {
            let Some((pin, state)) = correction else {
                continue;
            };
            let previous = tracker.state().position;
            tracker.set_position(state)?;
            let delta = if previous.is_finite() {
                state.position - previous
            } else {
                0.0
            };
            info!(train = %tracker.name(), "Standing on {}, position set to {}", pin, state);
            self.events.emit(ControlEvent::PositionCorrected {
                train: tracker.train(),
                pin,
                delta,
                state: tracker.state(),
            });
            corrected.push(tracker.train());
        }
        Ok(corrected)
    }

    /// Correct from contacts, then drive both trains home
    pub async fn move_to_standard_positions(&self) -> Result<()> {
        self.settle().await;
        self.correct_from_contacts()?;
        let (outer, shuttle) = (self.outer.state(), self.shuttle.state());
        let outer_contact_clear = self.contacts.is_none() || self.level(OUTER_CONTACT) == Some(true);
        let legs = standard_positions(self.outer.geometry(), &outer, &shuttle, outer_contact_clear)
            .ok_or_else(|| {
                ControlError::Routine(format!(
                    "no way to standard positions from {} and {}",
                    outer, shuttle
                ))
            })?;
        self.drive_legs(legs).await
    }

    pub async fn run_program(&self, program: Program) -> Result<()> {
        self.settle().await;
        let legs = {
            let mut rng = rand::thread_rng();
            program_legs(
                program,
                self.outer.geometry(),
                &self.outer.state(),
                &self.shuttle.state(),
                &self.config,
                &mut rng,
            )
        };
        self.drive_legs(legs).await
    }

    /// Let drives still in flight finish, whatever their outcome
    async fn settle(&self) {
        for tracker in [&self.outer, &self.shuttle] {
            if let Err(e) = tracker.wait().await {
                debug!(train = %tracker.name(), "Previous drive: {}", e);
            }
        }
    }

    async fn drive_legs(&self, legs: Vec<Leg>) -> Result<()> {
        let mut rx = self.events.subscribe();
        debug!("Driving {} legs", legs.len());
        for leg in legs {
            let tracker = self.tracker(leg.role);
            tracker
                .drive(leg.target, leg.pause, leg.waypoints, leg.options)
                .await?;
            if let Err(e) = self.check_aborted(&mut rx) {
                for tracker in [&self.outer, &self.shuttle] {
                    tracker.abort_drive("routine stopped")?;
                }
                return Err(e);
            }
        }
        self.outer.wait().await?;
        self.shuttle.wait().await
    }

    /// Fail if a drive of either train was aborted since the last check
    fn check_aborted(&self, rx: &mut broadcast::Receiver<ControlEvent>) -> Result<()> {
        loop {
            match rx.try_recv() {
                Ok(ControlEvent::DriveAborted { train, reason }) => {
                    if let Some(tracker) = [&self.outer, &self.shuttle]
                        .into_iter()
                        .find(|t| t.train() == train)
                    {
                        return Err(ControlError::AbortedDrive {
                            train: tracker.name().to_string(),
                            reason,
                        });
                    }
                }
                Ok(_) | Err(TryRecvError::Lagged(_)) => {}
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn g() -> TrackGeometry {
        TrackGeometry::default()
    }

    fn outer_at(position: f64) -> PositionState {
        PositionState::new(TrackLoop::Outer, position, true)
    }

    fn inner_at(position: f64, aligned: bool) -> PositionState {
        PositionState::new(TrackLoop::Inner, position, aligned)
    }

    fn none(_: ContactPin) -> bool {
        false
    }

    #[test]
    fn test_nothing_tripped_nothing_corrected() {
        let c = contact_corrections(&outer_at(100.0), &inner_at(500.0, true), none);
        assert_eq!(c, Corrections::default());
    }

    #[test]
    fn test_outer_contact_places_unknown_outer_train() {
        let c = contact_corrections(&PositionState::unknown(), &inner_at(0.0, true), |pin| {
            pin == OUTER_CONTACT
        });
        let (pin, state) = c.outer.unwrap();
        assert_eq!(pin, OUTER_CONTACT);
        assert_eq!(state.track, Some(TrackLoop::Outer));
        assert_eq!(state.position, OUTER_CONTACT_NORTH - TRAIN_CONTACT + 10.0);
        assert!(c.shuttle.is_none());
    }

    #[test]
    fn test_outer_contact_ignored_while_shuttle_is_outside() {
        let c = contact_corrections(&outer_at(100.0), &outer_at(4000.0), |pin| pin == OUTER_CONTACT);
        assert!(c.outer.is_none());
    }

    #[test]
    fn test_airport_contact_pulls_shuttle_off_the_outer_loop() {
        let c = contact_corrections(&outer_at(100.0), &outer_at(900.0), |pin| {
            pin == AIRPORT_CONTACT || pin == OUTER_CONTACT
        });
        let (pin, state) = c.shuttle.unwrap();
        assert_eq!(pin, AIRPORT_CONTACT);
        assert_eq!(state.track, Some(TrackLoop::Inner));
        assert_eq!(state.position, INNER_AIRPORT_CONTACT_WEST + TRAIN_CONTACT);
        // with the shuttle placed inside, the outer contact belongs to the outer train
        assert!(c.outer.is_some());
    }

    #[test]
    fn test_inner_contact_after_a_full_ring_flips_alignment() {
        let c = contact_corrections(&outer_at(100.0), &inner_at(3000.0, true), |pin| {
            pin == INNER_CONTACT
        });
        let (_, state) = c.shuttle.unwrap();
        assert_eq!(state.position, INNER_CONTACT_SOUTH - 100.0);
        assert_eq!(state.aligned, Some(false));

        let c = contact_corrections(&outer_at(100.0), &inner_at(-2000.0, true), |pin| {
            pin == INNER_CONTACT
        });
        let (_, state) = c.shuttle.unwrap();
        assert_eq!(state.position, INNER_CONTACT_NORTH + 100.0);
        assert_eq!(state.aligned, Some(true));
    }

    #[test]
    fn test_standard_positions_from_the_inner_loop() {
        let legs = standard_positions(&g(), &outer_at(1000.0), &inner_at(500.0, true), true).unwrap();
        assert_eq!(legs.len(), 3);
        assert_eq!(legs[0].role, Role::Shuttle);
        assert_eq!(legs[0].target, INNER_SAFE_REVERSAL);
        assert_eq!(legs[0].waypoints[0].pin, INNER_CONTACT);
        assert_eq!(legs[1], outer_home().max_speed(50.0));
        assert_eq!(legs[2], Leg::new(Role::Shuttle, INNER_MUNICH));
    }

    #[test]
    fn test_standard_positions_laps_outer_train_past_a_tripped_contact() {
        let legs = standard_positions(&g(), &outer_at(1000.0), &inner_at(500.0, true), false).unwrap();
        assert_eq!(legs.len(), 4);
        assert_eq!(legs[1].target, g().outer + OUTER_ERDING);
        assert!(legs[2].options.use_emergency_stop);
    }

    #[test]
    fn test_standard_positions_reverses_shuttle_in_from_outer_loop() {
        let legs = standard_positions(&g(), &outer_at(3000.0), &outer_at(1000.0), true).unwrap();
        assert_eq!(legs, shuttle_inside(&g()));
        assert_eq!(legs[0].options.wait, WaitFor::Done);
    }

    #[test]
    fn test_standard_positions_needs_known_positions() {
        assert!(standard_positions(&g(), &PositionState::unknown(), &inner_at(0.0, true), true).is_none());
    }

    #[test]
    fn test_regular_round_alternates_trains() {
        let config = RoutineConfig::default();
        let mut rng = StdRng::seed_from_u64(7);
        let legs = program_legs(
            Program::RegularRound,
            &g(),
            &outer_at(OUTER_MUNICH),
            &inner_at(INNER_MUNICH, true),
            &config,
            &mut rng,
        );
        assert_eq!(legs.len(), 7 * config.regular_rounds);
        let roles: Vec<Role> = legs[..4].iter().map(|l| l.role).collect();
        assert_eq!(roles, vec![Role::Shuttle, Role::Outer, Role::Shuttle, Role::Outer]);
        for leg in legs.iter().filter(|l| !l.pause.is_zero()) {
            assert!(leg.pause >= Duration::from_millis(config.pause_ms));
            assert!(leg.pause <= Duration::from_millis(config.pause_ms + config.pause_random_ms));
        }
    }

    #[test]
    fn test_outside_fast_checks_every_lap() {
        let config = RoutineConfig::default();
        let mut rng = StdRng::seed_from_u64(1);
        let legs = program_legs(
            Program::OutsideFast,
            &g(),
            &outer_at(OUTER_MUNICH),
            &inner_at(INNER_MUNICH, true),
            &config,
            &mut rng,
        );
        let lap = &legs[0];
        assert_eq!(lap.role, Role::Outer);
        assert_eq!(lap.waypoints.len(), config.fast_rounds);
        assert!(lap
            .waypoints
            .windows(2)
            .all(|w| (w[1].position - w[0].position - g().outer).abs() < 1e-6));
    }

    #[test]
    fn test_both_outside_turns_a_reversed_shuttle_first() {
        let config = RoutineConfig::default();
        let mut rng = StdRng::seed_from_u64(3);
        let aligned = program_legs(
            Program::BothOutside,
            &g(),
            &outer_at(OUTER_MUNICH),
            &inner_at(INNER_MUNICH, true),
            &config,
            &mut rng,
        );
        let reversed = program_legs(
            Program::BothOutside,
            &g(),
            &outer_at(OUTER_MUNICH),
            &inner_at(INNER_MUNICH, false),
            &config,
            &mut rng,
        );
        assert_eq!(reversed.len(), aligned.len() + 1);
        assert_eq!(reversed[0], inner_reversal(&g()));
        assert_eq!(aligned[0].target, airport_exit(&g()));
    }

    #[test]
    fn test_program_names() {
        for program in Program::ALL {
            assert_eq!(program.name().parse::<Program>(), Ok(program));
        }
        assert_eq!(Program::BothOutside.next(), Program::RegularRound);
        assert!("waltz".parse::<Program>().is_err());
    }
}
