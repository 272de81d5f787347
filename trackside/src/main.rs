//! Trackside Layout Controller
//!
//! Headless controller for a model railway layout driven over serial
//! ports with the Motorola track signal. Operator commands come in on
//! stdin, layout activity goes to the log.

mod console;
mod settings;

use std::sync::Arc;

use anyhow::{bail, Context};
use settings::Settings;
use tokio::sync::broadcast::error::RecvError;
use track_control::{ControlEvent, ControlHandle, Events, Roster, Routine, World};
use track_signal::{GeneratorConfig, LineOpener, PortScanner, SerialLineOpener, SignalGenerator};
use track_sim::{VirtualLine, VirtualLineOpener, VirtualRelayBoard};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// A generator together with the port name it was configured under
struct OpenPort {
    port: String,
    generator: SignalGenerator,
}

/// Start a generator for every configured port, scanning or falling back to
/// a virtual line when none are configured
fn open_ports(settings: &Settings, world: &World) -> anyhow::Result<Vec<OpenPort>> {
    let mut ports = settings.ports.clone();
    if ports.is_empty() && settings.auto_detect {
        match PortScanner::new().enumerate_ports() {
            Ok(found) => {
                for info in found {
                    let matches = match (&settings.product_filter, &info.product) {
                        (Some(filter), Some(product)) => product.contains(filter.as_str()),
                        (Some(_), None) => false,
                        (None, _) => true,
                    };
                    if matches {
                        ports.push(settings::PortSettings {
                            port: info.port,
                            trains: None,
                            simulated: false,
                        });
                    }
                }
            }
            Err(e) => warn!("Port scan failed: {}", e),
        }
    }
    if ports.is_empty() {
        warn!("No signal ports found, running on a virtual line");
        ports.push(settings::PortSettings {
            port: "virtual0".to_string(),
            trains: None,
            simulated: true,
        });
    }

    let roster = world.motion().roster();
    let mut open = Vec::with_capacity(ports.len());
    for entry in ports {
        let trains = match &entry.trains {
            Some(names) => {
                let mut ids = Vec::with_capacity(names.len());
                for name in names {
                    match roster.find(name) {
                        Some(id) => ids.push(id),
                        None => bail!("unknown train '{}' on port {}", name, entry.port),
                    }
                }
                Some(ids)
            }
            None => None,
        };
        let opener: Box<dyn LineOpener> = if entry.simulated {
            Box::new(VirtualLineOpener::new(entry.port.clone(), VirtualLine::new()))
        } else {
            Box::new(SerialLineOpener::new(entry.port.clone()))
        };
        let generator = SignalGenerator::spawn(opener, GeneratorConfig::default());
        info!("Signal generator on {}", entry.port);
        world.add_generator(generator.clone(), trains);
        open.push(OpenPort {
            port: entry.port,
            generator,
        });
    }
    Ok(open)
}

fn find_port<'a>(ports: &'a [OpenPort], name: Option<&str>) -> Option<&'a SignalGenerator> {
    match name {
        Some(name) => ports.iter().find(|p| p.port == name).map(|p| &p.generator),
        None => ports.first().map(|p| &p.generator),
    }
}

/// Log layout events until the stream closes
async fn log_events(events: Events) {
    let mut rx = events.subscribe();
    loop {
        match rx.recv().await {
            Ok(ControlEvent::FrameSent {
                train,
                speed,
                reverse,
            }) => debug!(%train, ?speed, reverse, "Frame"),
            Ok(event) if event.is_fault() => warn!(?event, "Fault"),
            Ok(event) if event.is_terminus_event() => info!(?event, "Terminus"),
            Ok(event) => info!(?event, "Layout"),
            Err(RecvError::Lagged(n)) => debug!("Event log lagged by {}", n),
            Err(RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "trackside=info,track_control=info,track_signal=info,track_protocol=info,track_sim=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Trackside");

    let settings = Settings::load();
    let roster = Roster::new(settings.roster_specs()).context("invalid roster")?;
    let events = Events::default();
    let mut world = World::new(roster, settings.layout(), events.clone());

    let ports = open_ports(&settings, &world)?;
    let contacts = find_port(&ports, settings.contact_port.as_deref()).cloned();
    if settings.contact_port.is_some() && contacts.is_none() {
        warn!("Contact port is not among the signal ports, positions stay untracked");
    }
    world
        .restore_tracking(contacts)
        .context("cannot restore tracked trains")?;

    if let Some(terminus) = &settings.terminus {
        let Some(sensor) = find_port(&ports, Some(terminus.sensor_port.as_str())).cloned() else {
            bail!("terminus sensor port {} is not a signal port", terminus.sensor_port);
        };
        warn!("Terminus relays are simulated");
        world
            .attach_terminus(Arc::new(VirtualRelayBoard::new(terminus.relay_channels)), sensor)
            .context("cannot attach terminus")?;
    }

    let world = Arc::new(world);
    let logger = tokio::spawn(log_events(events));
    let (control, actor) = ControlHandle::spawn(Arc::clone(&world));
    if settings.power_on_start {
        control.set_power(None, true).await?;
    }
    if settings.layout.routines.outer_train.is_some() {
        // restored positions may be stale, trust tripped contacts over them
        if let Err(e) = control.run_routine(Routine::CorrectPositions).await {
            warn!("Startup contact correction failed: {}", e);
        }
    }

    let console = tokio::spawn(console::run(control.clone(), Arc::clone(&world)));
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("cannot listen for ctrl-c")?;
            info!("Interrupted");
        }
        _ = console => {}
    }

    // the actor stops every train and saves on the way out
    if let Err(e) = control.shutdown().await {
        debug!("Control actor already gone: {}", e);
    }
    actor.await.context("control actor panicked")?;
    logger.abort();
    info!("Trackside stopped");
    Ok(())
}
