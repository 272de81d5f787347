//! Signal generator task
//!
//! One task per port owns the serial line. Everything else talks to it
//! through [`SignalGenerator`], a cheap clonable handle whose setters never
//! wait on the line.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, error, info, warn};
use track_protocol::{Frame, Protocol, TrainCommand};

use crate::contacts::{ContactEvent, ContactPin, ContactSnapshot};
use crate::error::SignalError;
use crate::line::{LineOpener, TrackLine};
use crate::table::BroadcastTable;

/// Timing of the generator loop
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Silence after each frame write. Decoders only accept a frame seen twice
    /// in a row, so every frame is written twice.
    pub repeat_gap: Duration,
    /// Power-sense is ignored for this long after sending starts
    pub short_circuit_grace: Duration,
    /// Wait between attempts to open an unavailable port
    pub retry_backoff: Duration,
    /// Contact polling interval while not broadcasting
    pub idle_poll: Duration,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            repeat_gap: Duration::from_micros(5_944),
            short_circuit_grace: Duration::from_millis(100),
            retry_backoff: Duration::from_secs(2),
            idle_poll: Duration::from_millis(10),
        }
    }
}

/// Events published by a generator
#[derive(Debug, Clone)]
pub enum SignalEvent {
    /// A contact input changed level
    Contact(ContactEvent),
    /// Broadcasting started
    Sending { port: String },
    /// Broadcasting stopped
    Stopped { port: String },
    /// Power fault detected, broadcasting halted
    ShortCircuit { port: String },
    /// The port could not be opened or failed while open
    PortUnavailable { port: String, reason: String },
}

impl SignalEvent {
    pub fn contact(&self) -> Option<&ContactEvent> {
        match self {
            SignalEvent::Contact(event) => Some(event),
            _ => None,
        }
    }
}

enum GeneratorCommand {
    Wake,
    Shutdown,
}

struct Shared {
    port: String,
    table: Mutex<BroadcastTable>,
    requested: AtomicBool,
    sending: AtomicBool,
    short_circuited: AtomicBool,
    error: Mutex<Option<String>>,
    last_stopped: Mutex<Option<Instant>>,
    contacts: Mutex<ContactSnapshot>,
    events: broadcast::Sender<SignalEvent>,
    listeners: Mutex<HashMap<String, u64>>,
    next_wait: AtomicU64,
}

impl Shared {
    fn set_error(&self, message: Option<String>) {
        *self.error.lock().unwrap_or_else(PoisonError::into_inner) = message;
    }

    fn publish(&self, event: SignalEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn mark_stopped(&self) {
        if self.sending.swap(false, Ordering::SeqCst) {
            *self.last_stopped.lock().unwrap_or_else(PoisonError::into_inner) =
                Some(Instant::now());
            self.publish(SignalEvent::Stopped {
                port: self.port.clone(),
            });
        }
    }
}

/// Handle to the generator task of one port
#[derive(Clone)]
pub struct SignalGenerator {
    shared: Arc<Shared>,
    cmd_tx: mpsc::UnboundedSender<GeneratorCommand>,
}

impl std::fmt::Debug for SignalGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalGenerator")
            .field("port", &self.shared.port)
            .field("sending", &self.is_sending())
            .finish()
    }
}

impl SignalGenerator {
    /// Spawn the generator task. Must be called within a tokio runtime.
    pub fn spawn(opener: Box<dyn LineOpener>, config: GeneratorConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        let shared = Arc::new(Shared {
            port: opener.port_name().to_string(),
            table: Mutex::new(BroadcastTable::new()),
            requested: AtomicBool::new(false),
            sending: AtomicBool::new(false),
            short_circuited: AtomicBool::new(false),
            error: Mutex::new(None),
            last_stopped: Mutex::new(None),
            contacts: Mutex::new(ContactSnapshot::default()),
            events,
            listeners: Mutex::new(HashMap::new()),
            next_wait: AtomicU64::new(0),
        });
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_generator(opener, Arc::clone(&shared), cmd_rx, config));
        Self { shared, cmd_tx }
    }

    pub fn port(&self) -> &str {
        &self.shared.port
    }

    /// Replace the broadcast command for `command.address`
    pub fn set(&self, command: TrainCommand, protocol: Protocol) -> Result<(), SignalError> {
        let changed = self.table().set(command, protocol)?;
        if changed {
            debug!(
                port = %self.shared.port,
                "Set {}: {}{:?} via {}",
                command.address,
                if command.reverse { '-' } else { '+' },
                command.speed,
                protocol.name()
            );
        }
        Ok(())
    }

    /// Stop broadcasting an address
    pub fn remove(&self, address: u8) -> bool {
        self.table().remove(address)
    }

    /// Request broadcasting. Clears a latched short circuit.
    pub fn start(&self) {
        self.shared.short_circuited.store(false, Ordering::SeqCst);
        self.shared.requested.store(true, Ordering::SeqCst);
        let _ = self.cmd_tx.send(GeneratorCommand::Wake);
    }

    pub fn stop(&self) {
        self.shared.requested.store(false, Ordering::SeqCst);
        let _ = self.cmd_tx.send(GeneratorCommand::Wake);
    }

    /// End the task and release the port
    pub fn shutdown(&self) {
        self.shared.requested.store(false, Ordering::SeqCst);
        let _ = self.cmd_tx.send(GeneratorCommand::Shutdown);
    }

    pub fn is_start_requested(&self) -> bool {
        self.shared.requested.load(Ordering::SeqCst)
    }

    /// Whether frames are actually going out on the line
    pub fn is_sending(&self) -> bool {
        self.shared.sending.load(Ordering::SeqCst)
    }

    pub fn is_short_circuited(&self) -> bool {
        self.shared.short_circuited.load(Ordering::SeqCst)
    }

    /// Degraded-status message, if any
    pub fn error(&self) -> Option<String> {
        self.shared
            .error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn time_since_last_stopped(&self) -> Option<Duration> {
        self.shared
            .last_stopped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|at| at.elapsed())
    }

    /// Direction currently broadcast for an address
    pub fn is_in_reverse(&self, address: u8) -> Option<bool> {
        self.table().command(address).map(|c| c.reverse)
    }

    /// Non-blocking snapshot of the contact inputs
    pub fn contact_status(&self) -> ContactSnapshot {
        *self
            .shared
            .contacts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SignalEvent> {
        self.shared.events.subscribe()
    }

    /// Wait until one of `pins` changes to one of `levels`.
    ///
    /// An empty `pins` slice matches any pin. A later call with the same
    /// `listener` supersedes this one.
    pub async fn await_event(
        &self,
        pins: &[ContactPin],
        levels: &[bool],
        timeout: Duration,
        listener: &str,
    ) -> Result<ContactEvent, SignalError> {
        let mut rx = self.shared.events.subscribe();
        let ticket = self.shared.next_wait.fetch_add(1, Ordering::SeqCst);
        self.listeners().insert(listener.to_string(), ticket);
        let deadline = Instant::now() + timeout;
        let result = loop {
            if self.listeners().get(listener) != Some(&ticket) {
                break Err(SignalError::Superseded(listener.to_string()));
            }
            match timeout_at(deadline, rx.recv()).await {
                Err(_) => {
                    break Err(SignalError::ProtocolTimeout {
                        pins: pins.to_vec(),
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
                Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                    warn!(listener, "Contact listener lagged by {} events", n);
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    break Err(SignalError::GeneratorClosed(self.shared.port.clone()))
                }
                Ok(Ok(SignalEvent::Contact(event))) => {
                    let pin_matches = pins.is_empty() || pins.contains(&event.pin);
                    if pin_matches && levels.contains(&event.level) {
                        break Ok(event);
                    }
                }
                Ok(Ok(_)) => {}
            }
        };
        let mut listeners = self.listeners();
        if listeners.get(listener) == Some(&ticket) {
            listeners.remove(listener);
        }
        result
    }

    fn table(&self) -> std::sync::MutexGuard<'_, BroadcastTable> {
        self.shared
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run_generator(
    opener: Box<dyn LineOpener>,
    shared: Arc<Shared>,
    mut cmd_rx: mpsc::UnboundedReceiver<GeneratorCommand>,
    config: GeneratorConfig,
) {
    let port = shared.port.clone();
    info!("Starting signal generator on {}", port);
    let mut line: Option<Box<dyn TrackLine>> = None;
    let mut sending_since: Option<Instant> = None;
    let mut open_failed = false;

    loop {
        // pending commands never block the line
        loop {
            match cmd_rx.try_recv() {
                Ok(GeneratorCommand::Wake) => {}
                Ok(GeneratorCommand::Shutdown)
                | Err(mpsc::error::TryRecvError::Disconnected) => {
                    shared.mark_stopped();
                    info!("Signal generator on {} shut down", port);
                    return;
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
            }
        }

        if line.is_none() {
            match opener.open() {
                Ok(opened) => {
                    if open_failed {
                        info!("Port {} available again", port);
                    }
                    open_failed = false;
                    shared.set_error(None);
                    line = Some(opened);
                }
                Err(e) => {
                    let reason = e.to_string();
                    if !open_failed {
                        warn!("Cannot open {}: {}", port, reason);
                        shared.publish(SignalEvent::PortUnavailable {
                            port: port.clone(),
                            reason: reason.clone(),
                        });
                    }
                    open_failed = true;
                    shared.set_error(Some(reason));
                    shared.mark_stopped();
                    sending_since = None;
                    // retry only while broadcasting is wanted
                    let wait = if shared.requested.load(Ordering::SeqCst) {
                        Some(config.retry_backoff)
                    } else {
                        None
                    };
                    if !wait_for_command(&mut cmd_rx, wait).await {
                        return;
                    }
                    continue;
                }
            }
        }
        let Some(active) = line.as_mut() else {
            continue;
        };

        match step(active.as_mut(), &shared, &config, &mut sending_since).await {
            Ok(true) => {}
            Ok(false) => {
                if !wait_for_command(&mut cmd_rx, Some(config.idle_poll)).await {
                    shared.mark_stopped();
                    return;
                }
            }
            Err(e) => {
                // any line error drops the line until it reopens
                let reason = e.to_string();
                error!("Line {} failed: {}", port, reason);
                shared.publish(SignalEvent::PortUnavailable {
                    port: port.clone(),
                    reason: reason.clone(),
                });
                shared.set_error(Some(reason));
                shared.mark_stopped();
                sending_since = None;
                line = None;
                open_failed = true;
                if !wait_for_command(&mut cmd_rx, Some(config.retry_backoff)).await {
                    return;
                }
            }
        }
    }
}

/// Wait for a command or the timeout. Returns `false` on shutdown.
async fn wait_for_command(
    cmd_rx: &mut mpsc::UnboundedReceiver<GeneratorCommand>,
    wait: Option<Duration>,
) -> bool {
    let recv = async {
        match cmd_rx.recv().await {
            Some(GeneratorCommand::Wake) => true,
            Some(GeneratorCommand::Shutdown) | None => false,
        }
    };
    match wait {
        Some(wait) => tokio::select! {
            keep_running = recv => keep_running,
            _ = sleep(wait) => true,
        },
        None => recv.await,
    }
}

/// Poll contacts and, when broadcasting, send one frame pair.
/// Returns whether a frame was sent.
async fn step(
    line: &mut dyn TrackLine,
    shared: &Shared,
    config: &GeneratorConfig,
    sending_since: &mut Option<Instant>,
) -> Result<bool, SignalError> {
    poll_contacts(line, shared)?;

    let wanted = shared.requested.load(Ordering::SeqCst)
        && !shared.short_circuited.load(Ordering::SeqCst);
    if !wanted {
        *sending_since = None;
        shared.mark_stopped();
        return Ok(false);
    }

    let started = *sending_since.get_or_insert_with(|| {
        shared.sending.store(true, Ordering::SeqCst);
        shared.set_error(None);
        info!("Sending on {}", shared.port);
        shared.publish(SignalEvent::Sending {
            port: shared.port.clone(),
        });
        Instant::now()
    });

    if started.elapsed() > config.short_circuit_grace {
        let fault = line.power_fault()?;
        if fault {
            warn!("Short circuit detected on {}", shared.port);
            shared.short_circuited.store(true, Ordering::SeqCst);
            shared.requested.store(false, Ordering::SeqCst);
            shared.set_error(Some(SignalError::ShortCircuit(shared.port.clone()).to_string()));
            shared.publish(SignalEvent::ShortCircuit {
                port: shared.port.clone(),
            });
            *sending_since = None;
            shared.mark_stopped();
            return Ok(false);
        }
    }

    let frame = shared
        .table
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .next_frame();
    send_twice(line, &shared.port, &frame, config.repeat_gap).await?;
    Ok(true)
}

async fn send_twice(
    line: &mut dyn TrackLine,
    port: &str,
    frame: &Frame,
    gap: Duration,
) -> Result<(), SignalError> {
    let io = |e: std::io::Error| SignalError::Io {
        port: port.to_string(),
        reason: e.to_string(),
    };
    for _ in 0..2 {
        line.write_all(frame.as_bytes()).await.map_err(io)?;
        line.flush().await.map_err(io)?;
        sleep(gap).await;
    }
    Ok(())
}

fn poll_contacts(line: &mut dyn TrackLine, shared: &Shared) -> Result<(), SignalError> {
    let levels = line.read_contacts()?;
    let events = shared
        .contacts
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .update(levels, Instant::now());
    for event in events {
        debug!(port = %shared.port, pin = %event.pin, level = event.level, "Contact changed");
        shared.publish(SignalEvent::Contact(event));
    }
    Ok(())
}
