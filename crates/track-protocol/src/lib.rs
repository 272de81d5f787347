//! Motorola Track Protocol Library
//!
//! Encoding and decoding of the ternary serial frames that drive Motorola
//! locomotive decoders through an RS-232 line:
//!
//! - **Motorola I**: one frame per locomotive, direction changes via a turn frame
//! - **Motorola II**: velocity frame with absolute direction plus one frame per
//!   auxiliary function, and an emergency stop code
//!
//! # Frame format
//!
//! Each frame is 18 six-bit serial words sent at 38400 baud:
//! - 4 address trits (8 words), least significant base-3 digit first
//! - 1 function trit (2 words) carrying f0
//! - 8 payload words (speed, direction, function bits)
//!
//! A trit is a pair of words: `(63,63)` = 0, `(0,0)` = 1, `(0,63)` = 2.
//!
//! # Example
//!
//! ```rust
//! use track_protocol::{FunctionBits, Protocol, SpeedCode, TrainCommand};
//!
//! let cmd = TrainCommand::new(24, SpeedCode::Step(7), false, FunctionBits::new());
//! let frames = Protocol::Mm2.status_frames(&cmd).unwrap();
//!
//! let decoded = Protocol::Mm2.decode_status(&frames).unwrap();
//! assert_eq!(decoded.speed, SpeedCode::Step(7));
//! assert_eq!(decoded.reverse, Some(false));
//! ```

pub mod command;
pub mod error;
pub mod frame;
pub mod mm1;
pub mod mm2;
pub mod trit;

pub use command::{FunctionBits, SpeedCode, TrainCommand};
pub use error::{ParseError, ProtocolError};
pub use frame::{Frame, FrameCodec, FRAME_LEN};
pub use trit::{Trit, IDLE_ADDRESS, MAX_ADDRESS};

/// Identifies which Motorola variant a decoder understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Protocol {
    /// Motorola I (relative direction, no emergency code)
    Mm1,
    /// Motorola II (absolute direction, f1..f4, emergency code)
    #[default]
    Mm2,
}

/// Result of decoding the frames of one status command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedStatus {
    pub address: u8,
    pub speed: SpeedCode,
    /// `None` when the frames carry no direction (Motorola I, emergency code)
    pub reverse: Option<bool>,
    pub functions: FunctionBits,
}

impl Protocol {
    /// Returns a human-readable name for the protocol
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Mm1 => "Motorola I",
            Protocol::Mm2 => "Motorola II",
        }
    }

    /// Whether [`SpeedCode::Emergency`] can be encoded
    pub fn has_emergency_code(&self) -> bool {
        matches!(self, Protocol::Mm2)
    }

    /// Whether direction changes need a separate turn frame
    pub fn needs_turn_frame(&self) -> bool {
        matches!(self, Protocol::Mm1)
    }

    /// Frames that broadcast `command`, in transmission order
    pub fn status_frames(&self, command: &TrainCommand) -> Result<Vec<Frame>, ProtocolError> {
        check_address(command.address)?;
        command.speed.validate()?;
        match self {
            Protocol::Mm1 => Ok(vec![mm1::status_frame(command)?]),
            Protocol::Mm2 => mm2::status_frames(command),
        }
    }

    /// Frame announcing a direction change, if the protocol uses one
    pub fn turn_frame(
        &self,
        address: u8,
        functions: &FunctionBits,
    ) -> Result<Option<Frame>, ProtocolError> {
        check_address(address)?;
        match self {
            Protocol::Mm1 => Ok(Some(mm1::turn_frame(address, functions)?)),
            Protocol::Mm2 => Ok(None),
        }
    }

    /// Decode the frames produced by [`status_frames`](Self::status_frames)
    pub fn decode_status(&self, frames: &[Frame]) -> Result<DecodedStatus, ParseError> {
        let (first, rest) = frames.split_first().ok_or(ParseError::Empty)?;
        match self {
            Protocol::Mm1 => {
                if !rest.is_empty() {
                    return Err(ParseError::Inconsistent(format!(
                        "Motorola I status is one frame, got {}",
                        frames.len()
                    )));
                }
                mm1::decode(first)?.ok_or_else(|| {
                    ParseError::Inconsistent("turn frame is not a status frame".into())
                })
            }
            Protocol::Mm2 => {
                let mut status = mm2::decode_velocity(first)?;
                let expected_code = match status.speed {
                    SpeedCode::Emergency => 0,
                    speed => speed.transmitted(),
                };
                for frame in rest {
                    let (address, code, function, on) = mm2::decode_function(frame)?;
                    if address != status.address || code != expected_code {
                        return Err(ParseError::Inconsistent(format!(
                            "function frame for address {address} code {code} \
                             follows velocity for address {} code {expected_code}",
                            status.address
                        )));
                    }
                    status
                        .functions
                        .set(function, on)
                        .map_err(|e| ParseError::Inconsistent(e.to_string()))?;
                }
                Ok(status)
            }
        }
    }
}

/// Frame broadcast when no locomotive is registered, keeping the track powered
pub fn idle_frame() -> Frame {
    mm2::idle_frame()
}

fn check_address(address: u8) -> Result<(), ProtocolError> {
    if address == 0 || address > MAX_ADDRESS {
        return Err(ProtocolError::InvalidAddress(address));
    }
    Ok(())
}

/// Trait for codecs that split raw line data into frames
pub trait ProtocolCodec {
    /// The item type produced by this codec
    type Command;

    /// Push raw bytes into the codec's buffer
    fn push_bytes(&mut self, data: &[u8]);

    /// Try to extract the next complete item from the buffer
    fn next_command(&mut self) -> Option<Self::Command>;

    /// Clear the internal buffer
    fn clear(&mut self);
}
