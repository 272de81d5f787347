//! Track Simulation Library
//!
//! Stand-ins for the layout hardware so the controller can run and be tested
//! without a serial adapter:
//!
//! - **VirtualLine**: records every frame written and exposes settable
//!   contact and power-fault inputs
//! - **VirtualRelayBoard**: remembers channel states and switching history
//!
//! # Example
//!
//! ```rust
//! use track_signal::ContactPin;
//! use track_sim::VirtualLine;
//!
//! let line = VirtualLine::new();
//! line.set_contact(ContactPin::Ri, false);
//! assert!(line.frames().is_empty());
//! ```

pub mod line;
pub mod relay;

pub use line::{VirtualLine, VirtualLineOpener};
pub use relay::VirtualRelayBoard;
