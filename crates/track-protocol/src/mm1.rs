//! Motorola I
//!
//! A single frame per locomotive: address, f0 and the speed code as four
//! binary trits. There is no direction bit; a direction change is a separate
//! frame carrying speed code 1, which also makes an emergency code impossible.

use crate::command::{FunctionBits, SpeedCode, TrainCommand};
use crate::error::{ParseError, ProtocolError};
use crate::frame::Frame;
use crate::trit::{address_trits, Trit};
use crate::DecodedStatus;

const NAME: &str = "Motorola I";

/// Speed code reserved for the turn frame
const TURN_CODE: u8 = 1;

fn speed_payload(code: u8) -> [u8; 8] {
    let mut payload = [0u8; 8];
    for i in 0..4 {
        let trit = Trit::from_bit((code >> i) & 1 == 1);
        payload[i * 2..i * 2 + 2].copy_from_slice(&trit.bytes());
    }
    payload
}

pub(crate) fn status_frame(command: &TrainCommand) -> Result<Frame, ProtocolError> {
    let code = match command.speed {
        SpeedCode::Emergency => return Err(ProtocolError::NoEmergencyCode(NAME)),
        speed => speed.transmitted(),
    };
    Ok(Frame::assemble(
        address_trits(command.address)?,
        Trit::from_bit(command.functions.f0),
        speed_payload(code),
    ))
}

pub(crate) fn turn_frame(address: u8, functions: &FunctionBits) -> Result<Frame, ProtocolError> {
    Ok(Frame::assemble(
        address_trits(address)?,
        Trit::from_bit(functions.f0),
        speed_payload(TURN_CODE),
    ))
}

/// Decode one frame; `Ok(None)` for a turn frame
pub(crate) fn decode(frame: &Frame) -> Result<Option<DecodedStatus>, ParseError> {
    let address = frame.address()?;
    let f0 = binary_trit(frame.function_trit()?)?;
    let mut code = 0u8;
    for (i, trit) in frame.payload_trits()?.iter().enumerate() {
        if binary_trit(*trit)? {
            code |= 1 << i;
        }
    }
    if code == TURN_CODE {
        return Ok(None);
    }
    let functions = FunctionBits {
        f0,
        ..FunctionBits::new()
    };
    Ok(Some(DecodedStatus {
        address,
        speed: SpeedCode::from_transmitted(code),
        reverse: None,
        functions,
    }))
}

fn binary_trit(trit: Trit) -> Result<bool, ParseError> {
    match trit {
        Trit::Zero => Ok(false),
        Trit::One => Ok(true),
        Trit::Two => {
            let [a, b] = trit.bytes();
            Err(ParseError::InvalidTrit(a, b))
        }
    }
}
