//! Unified event stream for layout control
//!
//! Everything observers might want to show or log (frames going out,
//! emergency stops, drives, terminus activity) is published through one
//! broadcast channel. Publishing never blocks and never fails when nobody
//! listens.

use tokio::sync::broadcast;
use track_protocol::SpeedCode;
use track_signal::ContactPin;

use crate::roster::TrainId;
use crate::topology::PositionState;

/// Unified event enum for all control activity
#[derive(Debug, Clone)]
pub enum ControlEvent {
    // -------------------------------------------------------------------------
    // Motion events
    // -------------------------------------------------------------------------
    /// A changed broadcast command was handed to the signal generators
    FrameSent {
        train: TrainId,
        speed: SpeedCode,
        reverse: bool,
    },

    /// A train was stopped instantly
    EmergencyStop {
        train: TrainId,
        /// Who or what requested the stop
        cause: String,
    },

    /// A named speed limit was set or lifted
    SpeedLimitChanged {
        train: TrainId,
        name: String,
        /// New limit in km/h, `None` when lifted
        limit: Option<f64>,
    },

    /// Track power was switched
    PowerChanged {
        /// `None` for all ports
        train: Option<TrainId>,
        on: bool,
    },

    // -------------------------------------------------------------------------
    // Position events
    // -------------------------------------------------------------------------
    /// A drive-to operation began
    DriveStarted { train: TrainId, target: f64 },

    /// A drive-to operation finished and the train has come to rest
    DriveCompleted { train: TrainId, position: f64 },

    /// A drive-to operation was given up
    DriveAborted { train: TrainId, reason: String },

    /// The tracked position was snapped to a contact
    PositionCorrected {
        train: TrainId,
        pin: ContactPin,
        /// Correction applied in mm
        delta: f64,
        state: PositionState,
    },

    // -------------------------------------------------------------------------
    // Terminus events
    // -------------------------------------------------------------------------
    /// A train was given a platform and the route was set
    EntryAssigned { train: TrainId, platform: u8 },

    /// Two trains requested entry at once, both stopped and entry locked
    EntryContested { first: TrainId, second: TrainId },

    /// A train could not be admitted
    EntryRefused { train: TrainId, reason: String },

    /// An entry was abandoned because the sensor never tripped
    EntryAborted { train: TrainId },

    /// The entering train cleared the switches
    EntrySettled { train: TrainId, platform: u8 },

    /// A train arrives at (or stands at) a platform
    ArrivalAnnouncement { train: TrainId, platform: u8 },

    /// A parked train backed out of the terminus
    TrainExited { train: TrainId, platform: u8 },

    // -------------------------------------------------------------------------
    // Routine events
    // -------------------------------------------------------------------------
    /// A layout routine began
    RoutineStarted { routine: String },

    /// A layout routine ended, with the reason if it failed
    RoutineFinished {
        routine: String,
        error: Option<String>,
    },

    // -------------------------------------------------------------------------
    // Hardware events
    // -------------------------------------------------------------------------
    /// A signal generator detected a short circuit
    ShortCircuit { port: String },

    /// A serial port could not be opened or failed
    PortUnavailable { port: String, reason: String },

    // -------------------------------------------------------------------------
    // Errors
    // -------------------------------------------------------------------------
    /// A periodic task or background operation failed
    Error {
        /// Component that failed
        source: String,
        message: String,
    },
}

impl ControlEvent {
    /// Train this event concerns, if any
    pub fn train(&self) -> Option<TrainId> {
        match self {
            ControlEvent::FrameSent { train, .. }
            | ControlEvent::EmergencyStop { train, .. }
            | ControlEvent::SpeedLimitChanged { train, .. }
            | ControlEvent::DriveStarted { train, .. }
            | ControlEvent::DriveCompleted { train, .. }
            | ControlEvent::DriveAborted { train, .. }
            | ControlEvent::PositionCorrected { train, .. }
            | ControlEvent::EntryAssigned { train, .. }
            | ControlEvent::EntryRefused { train, .. }
            | ControlEvent::EntryAborted { train }
            | ControlEvent::EntrySettled { train, .. }
            | ControlEvent::ArrivalAnnouncement { train, .. }
            | ControlEvent::TrainExited { train, .. } => Some(*train),
            ControlEvent::PowerChanged { train, .. } => *train,
            ControlEvent::EntryContested { second, .. } => Some(*second),
            ControlEvent::RoutineStarted { .. }
            | ControlEvent::RoutineFinished { .. }
            | ControlEvent::ShortCircuit { .. }
            | ControlEvent::PortUnavailable { .. }
            | ControlEvent::Error { .. } => None,
        }
    }

    /// Check if this is a terminus event
    pub fn is_terminus_event(&self) -> bool {
        matches!(
            self,
            ControlEvent::EntryAssigned { .. }
                | ControlEvent::EntryContested { .. }
                | ControlEvent::EntryRefused { .. }
                | ControlEvent::EntryAborted { .. }
                | ControlEvent::EntrySettled { .. }
                | ControlEvent::ArrivalAnnouncement { .. }
                | ControlEvent::TrainExited { .. }
        )
    }

    /// Check if this is an error or fault event
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            ControlEvent::ShortCircuit { .. }
                | ControlEvent::PortUnavailable { .. }
                | ControlEvent::Error { .. }
        )
    }
}

/// Cloneable publisher for [`ControlEvent`]s
#[derive(Debug, Clone)]
pub struct Events {
    tx: broadcast::Sender<ControlEvent>,
}

impl Default for Events {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Events {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: ControlEvent) {
        // no subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn error(&self, source: &str, message: impl ToString) {
        self.emit(ControlEvent::Error {
            source: source.to_string(),
            message: message.to_string(),
        });
    }
}
