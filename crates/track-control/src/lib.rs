//! Layout Control Engine
//!
//! Drives the trains of a model railway layout on top of one or more
//! signal generators.
//!
//! # Architecture
//!
//! - **Motion**: ramps each train's speed toward its target within the
//!   train's acceleration, enforces named speed limits and emergency stops,
//!   and integrates an odometer per train
//! - **Position tracking**: maps the odometer onto the two loops of the
//!   layout and runs drive-to operations corrected at track contacts
//! - **Terminus**: assigns platforms to arriving trains and operates the
//!   entry signal, entry power and switch relays
//! - **Routines**: contact correction, homing and show programs for the
//!   two tracked trains
//!
//! All state changes are published as [`ControlEvent`]s. The control actor
//! serializes operator commands and runs the periodic work.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use track_control::{default_roster, ControlHandle, Events, LayoutConfig, Roster, World};
//! use track_signal::{GeneratorConfig, SerialLineOpener, SignalGenerator};
//!
//! # async fn demo() -> track_control::Result<()> {
//! let roster = Roster::new(default_roster())?;
//! let ice = roster.find("ICE").unwrap();
//! let world = World::new(roster, LayoutConfig::default(), Events::default());
//! world.add_generator(
//!     SignalGenerator::spawn(
//!         Box::new(SerialLineOpener::new("/dev/ttyUSB0")),
//!         GeneratorConfig::default(),
//!     ),
//!     None,
//! );
//!
//! let (control, _task) = ControlHandle::spawn(Arc::new(world));
//! control.set_power(None, true).await?;
//! control.set_target_speed(ice, 120.0).await?;
//! # Ok(())
//! # }
//! ```

pub mod actor;
pub mod error;
pub mod events;
pub mod motion;
pub mod position_log;
pub mod roster;
pub mod routines;
pub mod terminus;
pub mod topology;
pub mod tracker;
pub mod world;

pub use actor::{run_control_actor, ControlCommand, ControlHandle};
pub use error::{ControlError, Result};
pub use events::{ControlEvent, Events};
pub use motion::{Direction, Heading, MotionConfig, MotionController, TrainSnapshot, GLOBAL_LIMIT};
pub use position_log::{read_last_positions, PositionLog};
pub use roster::{default_roster, HardStop, Roster, TrainFunction, TrainId, TrainSpec};
pub use routines::{Crew, Program, Routine, RoutineConfig};
pub use terminus::{
    ParkedTrain, PlatformState, Terminus, TerminusConfig, TERMINUS_LIMIT, TERMINUS_WAIT_LIMIT,
};
pub use topology::{PositionState, TrackGeometry, TrackLoop};
pub use tracker::{
    DriveOptions, DriveStatus, PositionTracker, TrackerSnapshot, WaitFor, Waypoint,
};
pub use world::{LayoutConfig, World, WorldSnapshot};
