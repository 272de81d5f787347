//! Operator console on stdin
//!
//! Each line is parsed into a [`Request`] and handed to the control actor.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use track_control::{
    ControlHandle, DriveOptions, PositionState, Program, Roster, Routine, TrainId, World,
    WorldSnapshot, GLOBAL_LIMIT,
};

pub const HELP: &str = "\
commands:
  speed <train> <km/h>            set target speed, negative reverses
  acc <train> <steps>             move the target by speed steps
  stop <train>                    brake to a halt
  reverse <train>                 reverse direction
  estop [train]                   emergency stop one or all trains
  limit <train> <name> <km/h|off> set or lift a named speed limit
  limit all <km/h|off>            set or lift the global limit
  power <on|off> [train]          switch track power
  fn <train> <id> <on|off|pulse>  switch or trigger a function
  drive <train> <mm> [km/h]       drive to a position
  abort <train>                   abort a drive
  pos <train> <loop> <mm> <fwd|bwd>  set a tracked position
  enter <train>                   request terminus entry
  occupy <platform> <train>       mark a platform occupied
  empty <platform>                mark a platform empty
  release <train>                 remove a train from the terminus
  unlock                          reset the terminus entry lock
  correct                         snap tracked trains to tripped contacts
  standard                        drive both tracked trains home
  program <regular|fast|outside>  run a show program
  status | save | help | quit";

/// One parsed console line
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Speed(TrainId, f64),
    Accelerate(TrainId, i32),
    Reverse(TrainId),
    EmergencyStop(Option<TrainId>),
    Limit(Option<TrainId>, String, Option<f64>),
    Power(Option<TrainId>, bool),
    Function(TrainId, u8, Option<bool>),
    Drive(TrainId, f64, Option<f64>),
    Abort(TrainId),
    Position(TrainId, PositionState),
    Enter(TrainId),
    Occupy(u8, TrainId),
    Empty(u8),
    Release(TrainId),
    Unlock,
    Routine(Routine),
    Status,
    Save,
    Help,
    Quit,
}

fn train(roster: &Roster, name: Option<&&str>) -> Result<TrainId, String> {
    let name = name.ok_or("missing train")?;
    roster
        .find(name)
        .ok_or_else(|| format!("unknown train '{}'", name))
}

fn number<T: std::str::FromStr>(value: Option<&&str>, what: &str) -> Result<T, String> {
    let value = value.ok_or_else(|| format!("missing {}", what))?;
    value
        .parse()
        .map_err(|_| format!("invalid {} '{}'", what, value))
}

fn limit_value(value: Option<&&str>) -> Result<Option<f64>, String> {
    match value {
        Some(&"off") => Ok(None),
        other => number(other, "limit").map(Some),
    }
}

fn on_off(value: Option<&&str>) -> Result<bool, String> {
    match value {
        Some(&"on") => Ok(true),
        Some(&"off") => Ok(false),
        Some(other) => Err(format!("expected on or off, got '{}'", other)),
        None => Err("expected on or off".to_string()),
    }
}

/// Parse a console line, `Ok(None)` for blank lines
pub fn parse(line: &str, roster: &Roster) -> Result<Option<Request>, String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((&command, args)) = words.split_first() else {
        return Ok(None);
    };
    let request = match command {
        "speed" => Request::Speed(train(roster, args.first())?, number(args.get(1), "speed")?),
        "acc" => Request::Accelerate(train(roster, args.first())?, number(args.get(1), "steps")?),
        "stop" => Request::Speed(train(roster, args.first())?, 0.0),
        "reverse" => Request::Reverse(train(roster, args.first())?),
        "estop" => match args.first() {
            Some(_) => Request::EmergencyStop(Some(train(roster, args.first())?)),
            None => Request::EmergencyStop(None),
        },
        "limit" => match args.first() {
            Some(&"all") => Request::Limit(None, GLOBAL_LIMIT.to_string(), limit_value(args.get(1))?),
            _ => {
                let id = train(roster, args.first())?;
                let name = args.get(1).ok_or("missing limit name")?;
                Request::Limit(Some(id), name.to_string(), limit_value(args.get(2))?)
            }
        },
        "power" => {
            let on = on_off(args.first())?;
            let target = match args.get(1) {
                Some(_) => Some(train(roster, args.get(1))?),
                None => None,
            };
            Request::Power(target, on)
        }
        "fn" => {
            let id = train(roster, args.first())?;
            let function = number(args.get(1), "function")?;
            let state = match args.get(2) {
                Some(&"pulse") => None,
                other => Some(on_off(other)?),
            };
            Request::Function(id, function, state)
        }
        "drive" => {
            let id = train(roster, args.first())?;
            let target = number(args.get(1), "position")?;
            let speed = match args.get(2) {
                Some(_) => Some(number(args.get(2), "speed")?),
                None => None,
            };
            Request::Drive(id, target, speed)
        }
        "abort" => Request::Abort(train(roster, args.first())?),
        "pos" => {
            let id = train(roster, args.first())?;
            let state: PositionState = args.get(1..).unwrap_or_default().join(" ").parse()?;
            Request::Position(id, state)
        }
        "enter" => Request::Enter(train(roster, args.first())?),
        "occupy" => Request::Occupy(
            number(args.first(), "platform")?,
            train(roster, args.get(1))?,
        ),
        "empty" => Request::Empty(number(args.first(), "platform")?),
        "release" => Request::Release(train(roster, args.first())?),
        "unlock" => Request::Unlock,
        "correct" => Request::Routine(Routine::CorrectPositions),
        "standard" => Request::Routine(Routine::StandardPositions),
        "program" => {
            let program: Program = args.first().ok_or("missing program")?.parse()?;
            Request::Routine(Routine::Program(program))
        }
        "status" => Request::Status,
        "save" => Request::Save,
        "help" | "?" => Request::Help,
        "quit" | "exit" => Request::Quit,
        other => return Err(format!("unknown command '{}', try help", other)),
    };
    Ok(Some(request))
}

/// Render a snapshot for the console
pub fn format_status(snapshot: &WorldSnapshot) -> String {
    let mut out = format!("power {}\n", if snapshot.power { "on" } else { "off" });
    for train in &snapshot.trains {
        out.push_str(&format!(
            "{:<12} {:>6.1} km/h (target {:>6.1}) {}",
            train.name, train.speed, train.target, train.heading
        ));
        if train.emergency {
            out.push_str(" [emergency]");
        }
        if let Some(cause) = &train.force_stopping {
            out.push_str(&format!(" [stopping: {}]", cause));
        }
        if let Some(tracker) = snapshot.trackers.iter().find(|t| t.train == train.train) {
            out.push_str(&format!(" @ {} {:?}", tracker.state, tracker.status));
        }
        out.push('\n');
    }
    for (platform, state) in &snapshot.platforms {
        out.push_str(&format!("platform {}: {}\n", platform, state));
    }
    if let Some(entering) = snapshot.entering {
        out.push_str(&format!("entering: {}\n", entering));
    }
    if snapshot.entry_locked {
        out.push_str("entry locked\n");
    }
    for (port, error) in &snapshot.port_errors {
        out.push_str(&format!("{}: {}\n", port, error));
    }
    out
}

/// Carry out one request, returning what to print
async fn execute(control: &ControlHandle, world: &World, request: Request) -> anyhow::Result<String> {
    let name = |id: TrainId| world.motion().roster().name(id);
    let reply = match request {
        Request::Speed(id, speed) => {
            let target = control.set_target_speed(id, speed).await?;
            format!("{} target {:.1} km/h", name(id), target)
        }
        Request::Accelerate(id, steps) => {
            let target = control.accelerate(id, steps).await?;
            format!("{} target {:.1} km/h", name(id), target)
        }
        Request::Reverse(id) => {
            let direction = control.reverse(id).await?;
            format!("{} now {:?}", name(id), direction)
        }
        Request::EmergencyStop(id) => {
            control.emergency_stop(id, "console").await?;
            "stopped".to_string()
        }
        Request::Limit(id, limit_name, limit) => {
            control.set_speed_limit(id, &limit_name, limit).await?;
            "ok".to_string()
        }
        Request::Power(id, on) => {
            control.set_power(id, on).await?;
            format!("power {}", if on { "on" } else { "off" })
        }
        Request::Function(id, function, Some(on)) => {
            control.set_function(id, function, on).await?;
            "ok".to_string()
        }
        Request::Function(id, function, None) => {
            control.trigger_function(id, function).await?;
            "ok".to_string()
        }
        Request::Drive(id, target, speed) => {
            let mut options = DriveOptions::default();
            if let Some(speed) = speed {
                options.max_speed = speed;
            }
            control
                .drive(id, target, Duration::ZERO, Vec::new(), options)
                .await?;
            format!("{} driving to {:.1}", name(id), target)
        }
        Request::Abort(id) => {
            control.abort_drive(id, "console").await?;
            "aborted".to_string()
        }
        Request::Position(id, state) => {
            control.set_position(id, state).await?;
            format!("{} at {}", name(id), state)
        }
        Request::Enter(id) => {
            let platform = control.request_entry(id).await?;
            format!("{} enters platform {}", name(id), platform)
        }
        Request::Occupy(platform, id) => {
            control.set_platform_occupied(platform, id).await?;
            "ok".to_string()
        }
        Request::Empty(platform) => {
            control.set_platform_empty(platform).await?;
            "ok".to_string()
        }
        Request::Release(id) => {
            control.release_train(id).await?;
            format!("{} released", name(id))
        }
        Request::Unlock => {
            control.reset_entry_lock().await?;
            "entry unlocked".to_string()
        }
        Request::Routine(routine) => {
            // routines take minutes, keep reading commands meanwhile
            let control = control.clone();
            tokio::spawn(async move {
                match control.run_routine(routine).await {
                    Ok(()) => info!("{} done", routine),
                    Err(e) => warn!("{} failed: {}", routine, e),
                }
            });
            format!("{} started", routine)
        }
        Request::Status => format_status(&control.snapshot().await?),
        Request::Save => {
            control.save().await?;
            "saved".to_string()
        }
        Request::Help => HELP.to_string(),
        Request::Quit => String::new(),
    };
    Ok(reply)
}

/// Read stdin until `quit` or end of input
pub async fn run(control: ControlHandle, world: Arc<World>) {
    info!("Console ready, type help for commands");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("Console input closed");
                break;
            }
            Err(e) => {
                warn!("Console read failed: {}", e);
                break;
            }
        };
        match parse(&line, world.motion().roster()) {
            Ok(None) => {}
            Ok(Some(Request::Quit)) => break,
            Ok(Some(request)) => match execute(&control, &world, request).await {
                Ok(reply) => println!("{}", reply),
                Err(e) => println!("error: {}", e),
            },
            Err(e) => println!("error: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use track_control::{default_roster, TrackLoop};

    fn roster() -> Roster {
        Roster::new(default_roster()).unwrap()
    }

    #[test]
    fn test_blank_line() {
        assert_eq!(parse("   ", &roster()), Ok(None));
    }

    #[test]
    fn test_speed_and_stop() {
        let roster = roster();
        let ice = roster.find("ICE").unwrap();
        assert_eq!(
            parse("speed ICE -120", &roster),
            Ok(Some(Request::Speed(ice, -120.0)))
        );
        assert_eq!(parse("stop ICE", &roster), Ok(Some(Request::Speed(ice, 0.0))));
    }

    #[test]
    fn test_unknown_train_and_command() {
        let roster = roster();
        assert!(parse("speed Nope 10", &roster).unwrap_err().contains("Nope"));
        assert!(parse("fly ICE", &roster).unwrap_err().contains("fly"));
        assert!(parse("speed ICE fast", &roster).unwrap_err().contains("fast"));
    }

    #[test]
    fn test_estop_all_or_one() {
        let roster = roster();
        let ice = roster.find("ICE").unwrap();
        assert_eq!(parse("estop", &roster), Ok(Some(Request::EmergencyStop(None))));
        assert_eq!(
            parse("estop ICE", &roster),
            Ok(Some(Request::EmergencyStop(Some(ice))))
        );
    }

    #[test]
    fn test_limits() {
        let roster = roster();
        let ice = roster.find("ICE").unwrap();
        assert_eq!(
            parse("limit all 60", &roster),
            Ok(Some(Request::Limit(None, GLOBAL_LIMIT.to_string(), Some(60.0))))
        );
        assert_eq!(
            parse("limit ICE yard off", &roster),
            Ok(Some(Request::Limit(Some(ice), "yard".to_string(), None)))
        );
    }

    #[test]
    fn test_power_and_functions() {
        let roster = roster();
        let ice = roster.find("ICE").unwrap();
        assert_eq!(parse("power on", &roster), Ok(Some(Request::Power(None, true))));
        assert_eq!(
            parse("power off ICE", &roster),
            Ok(Some(Request::Power(Some(ice), false)))
        );
        assert!(parse("power maybe", &roster).is_err());
        assert_eq!(
            parse("fn ICE 0 on", &roster),
            Ok(Some(Request::Function(ice, 0, Some(true))))
        );
        assert_eq!(
            parse("fn ICE 2 pulse", &roster),
            Ok(Some(Request::Function(ice, 2, None)))
        );
    }

    #[test]
    fn test_position_and_terminus() {
        let roster = roster();
        let ice = roster.find("ICE").unwrap();
        match parse("pos ICE inner 120.5 bwd", &roster) {
            Ok(Some(Request::Position(id, state))) => {
                assert_eq!(id, ice);
                assert_eq!(state.track, Some(TrackLoop::Inner));
                assert_eq!(state.position, 120.5);
                assert_eq!(state.aligned, Some(false));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(parse("pos ICE inner", &roster).is_err());
        assert_eq!(
            parse("occupy 3 ICE", &roster),
            Ok(Some(Request::Occupy(3, ice)))
        );
        assert_eq!(parse("empty 2", &roster), Ok(Some(Request::Empty(2))));
        assert_eq!(parse("release ICE", &roster), Ok(Some(Request::Release(ice))));
        assert_eq!(parse("unlock", &roster), Ok(Some(Request::Unlock)));
    }

    #[test]
    fn test_drive_with_optional_speed() {
        let roster = roster();
        let ice = roster.find("ICE").unwrap();
        assert_eq!(
            parse("drive ICE 1500", &roster),
            Ok(Some(Request::Drive(ice, 1500.0, None)))
        );
        assert_eq!(
            parse("drive ICE 1500 40", &roster),
            Ok(Some(Request::Drive(ice, 1500.0, Some(40.0))))
        );
    }

    #[test]
    fn test_routines() {
        let roster = roster();
        assert_eq!(
            parse("correct", &roster),
            Ok(Some(Request::Routine(Routine::CorrectPositions)))
        );
        assert_eq!(
            parse("standard", &roster),
            Ok(Some(Request::Routine(Routine::StandardPositions)))
        );
        assert_eq!(
            parse("program outside", &roster),
            Ok(Some(Request::Routine(Routine::Program(Program::BothOutside))))
        );
        assert!(parse("program", &roster).is_err());
        assert!(parse("program waltz", &roster).unwrap_err().contains("waltz"));
    }

    proptest! {
        #[test]
        fn prop_parse_never_panics(line in "[a-z0-9 .-]{0,40}") {
            let _ = parse(&line, &roster());
        }

        #[test]
        fn prop_speed_accepts_any_number(speed in -300.0f64..300.0) {
            let roster = roster();
            let ice = roster.find("ICE").unwrap();
            let line = format!("speed ICE {}", speed);
            prop_assert_eq!(parse(&line, &roster), Ok(Some(Request::Speed(ice, speed))));
        }
    }
}
