//! Control actor
//!
//! Serializes operator commands onto the layout and drives its periodic
//! work: motion ticks, terminus exit checks, state saves and position logs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{ControlError, Result};
use crate::motion::Direction;
use crate::roster::TrainId;
use crate::routines::Routine;
use crate::topology::PositionState;
use crate::tracker::{DriveOptions, Waypoint};
use crate::world::{World, WorldSnapshot};

/// Commands accepted by [`run_control_actor`]
#[derive(Debug)]
pub enum ControlCommand {
    SetTargetSpeed {
        train: TrainId,
        /// Signed km/h
        speed: f64,
        response: oneshot::Sender<Result<f64>>,
    },
    Accelerate {
        train: TrainId,
        steps: i32,
        response: oneshot::Sender<Result<f64>>,
    },
    Reverse {
        train: TrainId,
        response: oneshot::Sender<Result<Direction>>,
    },
    /// `None` stops every train
    EmergencyStop {
        train: Option<TrainId>,
        cause: String,
        response: oneshot::Sender<Result<()>>,
    },
    /// `None` sets the global limit
    SetSpeedLimit {
        train: Option<TrainId>,
        name: String,
        limit: Option<f64>,
        response: oneshot::Sender<Result<()>>,
    },
    SetFunction {
        train: TrainId,
        function: u8,
        on: bool,
        response: oneshot::Sender<Result<()>>,
    },
    TriggerFunction {
        train: TrainId,
        function: u8,
        response: oneshot::Sender<Result<()>>,
    },
    /// `None` switches every generator
    SetPower { train: Option<TrainId>, on: bool },
    /// Answered when the drive ends, as chosen by `options.wait`
    Drive {
        train: TrainId,
        target: f64,
        pause: Duration,
        waypoints: Vec<Waypoint>,
        options: DriveOptions,
        response: oneshot::Sender<Result<()>>,
    },
    AbortDrive {
        train: TrainId,
        reason: String,
        response: oneshot::Sender<Result<()>>,
    },
    SetPosition {
        train: TrainId,
        state: PositionState,
        response: oneshot::Sender<Result<()>>,
    },
    RunRoutine {
        routine: Routine,
        response: oneshot::Sender<Result<()>>,
    },
    RequestEntry {
        train: TrainId,
        response: oneshot::Sender<Result<u8>>,
    },
    SetPlatformOccupied {
        platform: u8,
        train: TrainId,
        response: oneshot::Sender<Result<()>>,
    },
    SetPlatformEmpty {
        platform: u8,
        response: oneshot::Sender<Result<()>>,
    },
    ReleaseTrain {
        train: TrainId,
        response: oneshot::Sender<Result<()>>,
    },
    ResetEntryLock {
        response: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        response: oneshot::Sender<WorldSnapshot>,
    },
    Save {
        response: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

/// Run the control actor until the command channel closes or
/// [`ControlCommand::Shutdown`] arrives
pub async fn run_control_actor(mut cmd_rx: mpsc::Receiver<ControlCommand>, world: Arc<World>) {
    info!("Control actor started");

    let mut tick_timer = interval(world.motion().config().tick());
    tick_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut exit_timer = interval(world.config().exit_check());
    exit_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut save_timer = interval(world.config().save_interval());
    save_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut log_timer = interval(world.config().log_interval());
    log_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_tick = Instant::now();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break; };
                if !handle_command(&world, cmd) {
                    break;
                }
            }

            _ = tick_timer.tick() => {
                let now = Instant::now();
                world.tick(now - last_tick);
                last_tick = now;
            }

            _ = exit_timer.tick() => {
                world.check_exited();
            }

            _ = save_timer.tick() => {
                if let Err(e) = world.save() {
                    warn!("Periodic save failed: {}", e);
                    world.events().error("save", e);
                }
            }

            _ = log_timer.tick() => {
                if let Err(e) = world.log_positions() {
                    warn!("Position log failed: {}", e);
                    world.events().error("position-log", e);
                }
            }
        }
    }

    world.shutdown();
    info!("Control actor stopped");
}

/// Returns `false` once the actor should stop
fn handle_command(world: &Arc<World>, cmd: ControlCommand) -> bool {
    let motion = world.motion();
    match cmd {
        ControlCommand::SetTargetSpeed {
            train,
            speed,
            response,
        } => {
            let _ = response.send(motion.set_target_speed(train, speed));
        }

        ControlCommand::Accelerate {
            train,
            steps,
            response,
        } => {
            let _ = response.send(motion.accelerate(train, steps));
        }

        ControlCommand::Reverse { train, response } => {
            let _ = response.send(world.reverse(train));
        }

        ControlCommand::EmergencyStop {
            train,
            cause,
            response,
        } => {
            let result = match train {
                Some(train) => motion.emergency_stop(train, &cause),
                None => motion.emergency_stop_all(&cause),
            };
            let _ = response.send(result);
        }

        ControlCommand::SetSpeedLimit {
            train,
            name,
            limit,
            response,
        } => {
            let result = match train {
                Some(train) => motion.set_speed_limit(train, &name, limit),
                None => motion.set_global_speed_limit(limit),
            };
            let _ = response.send(result);
        }

        ControlCommand::SetFunction {
            train,
            function,
            on,
            response,
        } => {
            let _ = response.send(motion.set_function(train, function, on));
        }

        ControlCommand::TriggerFunction {
            train,
            function,
            response,
        } => {
            let _ = response.send(motion.trigger_function(train, function));
        }

        ControlCommand::SetPower { train, on } => {
            if on {
                motion.power_on(train);
            } else {
                motion.power_off(train);
            }
        }

        ControlCommand::Drive {
            train,
            target,
            pause,
            waypoints,
            options,
            response,
        } => match world.driver(train) {
            Ok(tracker) => {
                // drives wait on contacts, keep the actor responsive
                tokio::spawn(async move {
                    let result = tracker.drive(target, pause, waypoints, options).await;
                    let _ = response.send(result);
                });
            }
            Err(e) => {
                let _ = response.send(Err(e));
            }
        },

        ControlCommand::AbortDrive {
            train,
            reason,
            response,
        } => {
            let _ = response.send(world.abort_drive(train, &reason));
        }

        ControlCommand::SetPosition {
            train,
            state,
            response,
        } => {
            let _ = response.send(world.set_position(train, state));
        }

        ControlCommand::RunRoutine { routine, response } => match world.crew() {
            Ok(crew) => {
                tokio::spawn(async move {
                    let _ = response.send(crew.run(routine).await);
                });
            }
            Err(e) => {
                let _ = response.send(Err(e));
            }
        },

        ControlCommand::RequestEntry { train, response } => {
            let _ = response.send(world.request_entry(train));
        }

        ControlCommand::SetPlatformOccupied {
            platform,
            train,
            response,
        } => {
            let _ = response.send(world.set_platform_occupied(platform, train));
        }

        ControlCommand::SetPlatformEmpty { platform, response } => {
            let _ = response.send(world.set_platform_empty(platform));
        }

        ControlCommand::ReleaseTrain { train, response } => {
            let _ = response.send(world.release_train(train));
        }

        ControlCommand::ResetEntryLock { response } => {
            let _ = response.send(world.reset_entry_lock());
        }

        ControlCommand::Snapshot { response } => {
            let _ = response.send(world.snapshot());
        }

        ControlCommand::Save { response } => {
            let _ = response.send(world.save());
        }

        ControlCommand::Shutdown => {
            debug!("Shutdown requested");
            return false;
        }
    }
    true
}

/// Cloneable sender side of the control actor
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlCommand>,
}

impl ControlHandle {
    /// Spawn [`run_control_actor`] for `world`
    pub fn spawn(world: Arc<World>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let task = tokio::spawn(run_control_actor(rx, world));
        (Self { tx }, task)
    }

    pub async fn send(&self, cmd: ControlCommand) -> Result<()> {
        self.tx.send(cmd).await.map_err(|_| ControlError::Closed)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> ControlCommand) -> Result<T> {
        let (response, rx) = oneshot::channel();
        self.send(build(response)).await?;
        rx.await.map_err(|_| ControlError::Closed)
    }

    pub async fn set_target_speed(&self, train: TrainId, speed: f64) -> Result<f64> {
        self.request(|response| ControlCommand::SetTargetSpeed {
            train,
            speed,
            response,
        })
        .await?
    }

    pub async fn accelerate(&self, train: TrainId, steps: i32) -> Result<f64> {
        self.request(|response| ControlCommand::Accelerate {
            train,
            steps,
            response,
        })
        .await?
    }

    pub async fn reverse(&self, train: TrainId) -> Result<Direction> {
        self.request(|response| ControlCommand::Reverse { train, response })
            .await?
    }

    pub async fn emergency_stop(&self, train: Option<TrainId>, cause: &str) -> Result<()> {
        self.request(|response| ControlCommand::EmergencyStop {
            train,
            cause: cause.to_string(),
            response,
        })
        .await?
    }

    pub async fn set_speed_limit(
        &self,
        train: Option<TrainId>,
        name: &str,
        limit: Option<f64>,
    ) -> Result<()> {
        self.request(|response| ControlCommand::SetSpeedLimit {
            train,
            name: name.to_string(),
            limit,
            response,
        })
        .await?
    }

    pub async fn set_function(&self, train: TrainId, function: u8, on: bool) -> Result<()> {
        self.request(|response| ControlCommand::SetFunction {
            train,
            function,
            on,
            response,
        })
        .await?
    }

    pub async fn trigger_function(&self, train: TrainId, function: u8) -> Result<()> {
        self.request(|response| ControlCommand::TriggerFunction {
            train,
            function,
            response,
        })
        .await?
    }

    pub async fn set_power(&self, train: Option<TrainId>, on: bool) -> Result<()> {
        self.send(ControlCommand::SetPower { train, on }).await
    }

    pub async fn drive(
        &self,
        train: TrainId,
        target: f64,
        pause: Duration,
        waypoints: Vec<Waypoint>,
        options: DriveOptions,
    ) -> Result<()> {
        self.request(|response| ControlCommand::Drive {
            train,
            target,
            pause,
            waypoints,
            options,
            response,
        })
        .await?
    }

    /// Run a routine of the configured crew to completion
    pub async fn run_routine(&self, routine: Routine) -> Result<()> {
        self.request(|response| ControlCommand::RunRoutine { routine, response })
            .await?
    }

    pub async fn abort_drive(&self, train: TrainId, reason: &str) -> Result<()> {
        self.request(|response| ControlCommand::AbortDrive {
            train,
            reason: reason.to_string(),
            response,
        })
        .await?
    }

    pub async fn set_position(&self, train: TrainId, state: PositionState) -> Result<()> {
        self.request(|response| ControlCommand::SetPosition {
            train,
            state,
            response,
        })
        .await?
    }

    pub async fn request_entry(&self, train: TrainId) -> Result<u8> {
        self.request(|response| ControlCommand::RequestEntry { train, response })
            .await?
    }

    pub async fn set_platform_occupied(&self, platform: u8, train: TrainId) -> Result<()> {
        self.request(|response| ControlCommand::SetPlatformOccupied {
            platform,
            train,
            response,
        })
        .await?
    }

    pub async fn set_platform_empty(&self, platform: u8) -> Result<()> {
        self.request(|response| ControlCommand::SetPlatformEmpty { platform, response })
            .await?
    }

    pub async fn release_train(&self, train: TrainId) -> Result<()> {
        self.request(|response| ControlCommand::ReleaseTrain { train, response })
            .await?
    }

    pub async fn reset_entry_lock(&self) -> Result<()> {
        self.request(|response| ControlCommand::ResetEntryLock { response })
            .await?
    }

    pub async fn snapshot(&self) -> Result<WorldSnapshot> {
        self.request(|response| ControlCommand::Snapshot { response })
            .await
    }

    pub async fn save(&self) -> Result<()> {
        self.request(|response| ControlCommand::Save { response })
            .await?
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(ControlCommand::Shutdown).await
    }
}
