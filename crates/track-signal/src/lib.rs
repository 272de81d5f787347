//! Track Signal Library
//!
//! Runs the serial signal generator that keeps every registered locomotive's
//! latest command on the rails, and reads the track contacts wired to the same
//! port's handshake inputs.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use track_protocol::{FunctionBits, Protocol, SpeedCode, TrainCommand};
//! use track_signal::{ContactPin, GeneratorConfig, SerialLineOpener, SignalGenerator};
//!
//! # async fn demo() -> Result<(), track_signal::SignalError> {
//! let generator = SignalGenerator::spawn(
//!     Box::new(SerialLineOpener::new("/dev/ttyUSB0")),
//!     GeneratorConfig::default(),
//! );
//! generator.set(
//!     TrainCommand::new(24, SpeedCode::Step(5), false, FunctionBits::new()),
//!     Protocol::Mm2,
//! )?;
//! generator.start();
//!
//! let event = generator
//!     .await_event(&[ContactPin::Ri], &[false], Duration::from_secs(10), "demo")
//!     .await?;
//! println!("{} tripped", event.pin);
//! # Ok(())
//! # }
//! ```

pub mod contacts;
pub mod error;
pub mod generator;
pub mod line;
pub mod relay;
pub mod scanner;
mod table;

pub use contacts::{ContactEvent, ContactLevels, ContactPin, ContactSnapshot};
pub use error::SignalError;
pub use generator::{GeneratorConfig, SignalEvent, SignalGenerator};
pub use line::{LineOpener, SerialLineOpener, TrackLine, SIGNAL_BAUD};
pub use relay::RelayBoard;
pub use scanner::{PortScanner, SerialPortInfo};
