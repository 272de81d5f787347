//! Error types for layout control

use thiserror::Error;

use crate::roster::TrainId;

/// Errors that can occur while controlling trains
#[derive(Debug, Error)]
pub enum ControlError {
    /// Train not in the roster
    #[error("unknown train: {0}")]
    UnknownTrain(String),

    /// A drive was cancelled or a waypoint never tripped
    #[error("drive of {train} aborted: {reason}")]
    AbortedDrive {
        /// Name of the driven train
        train: String,
        /// What ended the drive
        reason: String,
    },

    /// Two trains asked to enter the terminus before either reached the sensor
    #[error("contested terminus entry between {first} and {second}")]
    ContestedEntry {
        /// Train that was entering
        first: String,
        /// Train that requested entry while the first was entering
        second: String,
    },

    /// Entry is locked after a contested entry until reset by hand
    #[error("terminus entry locked")]
    EntryLocked,

    /// Another train is passing the entry switches
    #[error("terminus entry busy with {0}")]
    EntryBusy(String),

    /// Every platform is occupied or blocked by an exiting train
    #[error("no free platform for {0}")]
    NoPlatform(String),

    /// The train is not registered in the terminus
    #[error("{0} is not in the terminus")]
    NotParked(String),

    /// No valid platform number
    #[error("invalid platform: {0}")]
    InvalidPlatform(u8),

    /// Position of a train is not known
    #[error("position of {0} unknown")]
    PositionUnknown(String),

    /// A momentary function was triggered again too soon
    #[error("function {function} of {train} cooling down for {remaining_ms}ms")]
    Cooldown {
        /// Train whose function was triggered
        train: TrainId,
        /// Function number
        function: u8,
        /// Time until the function can be triggered again (milliseconds)
        remaining_ms: u64,
    },

    /// Invalid train definition
    #[error("invalid train definition for {train}: {reason}")]
    InvalidTrain {
        /// Name of the train
        train: String,
        /// What is wrong with it
        reason: String,
    },

    /// State or log file could not be read or written
    #[error("persistence error for {path}: {reason}")]
    Persistence {
        /// File concerned
        path: String,
        /// Underlying failure
        reason: String,
    },

    /// The control actor has shut down
    #[error("control actor closed")]
    Closed,

    /// No terminus is attached to the layout
    #[error("no terminus configured")]
    NoTerminus,

    /// A layout routine cannot run from the current state
    #[error("routine failed: {0}")]
    Routine(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Signal generator or relay error
    #[error("signal error: {0}")]
    Signal(#[from] track_signal::SignalError),

    /// Frame could not be encoded
    #[error("protocol error: {0}")]
    Protocol(#[from] track_protocol::ProtocolError),
}

/// Result type for layout control
pub type Result<T> = std::result::Result<T, ControlError>;

impl ControlError {
    /// Whether the failure came from a contact that never changed in time
    pub fn is_timeout(&self) -> bool {
        matches!(self, ControlError::Signal(e) if e.is_timeout())
    }

    pub(crate) fn persistence(path: &std::path::Path, reason: impl ToString) -> Self {
        ControlError::Persistence {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}
