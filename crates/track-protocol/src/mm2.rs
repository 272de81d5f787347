//! Motorola II
//!
//! The payload is eight binary words instead of four trits. Speed bits
//! alternate with a 4-bit pattern that carries the absolute direction in the
//! velocity frame, or the function number and state in function frames.
//! Some function patterns collide with direction patterns for particular
//! speed codes; those cases use the alternative patterns `1010`/`0101`.

use crate::command::{FunctionBits, SpeedCode, TrainCommand};
use crate::error::{ParseError, ProtocolError};
use crate::frame::Frame;
use crate::trit::{address_trits, Trit, HIGH, LOW};
use crate::DecodedStatus;

type Pattern = [bool; 4];

const ALT_OFF: Pattern = [true, false, true, false];
const ALT_ON: Pattern = [false, true, false, true];
const EMERGENCY: Pattern = [true, false, false, false];

/// Speed codes at which a function's pattern collides, as (off, on)
const COLLISIONS: [(u8, u8); 4] = [(3, 11), (4, 12), (6, 14), (7, 15)];

fn pack(code: u8, pattern: Pattern) -> [u8; 8] {
    let bits = [
        code & 1 == 1,
        pattern[0],
        (code >> 1) & 1 == 1,
        pattern[1],
        (code >> 2) & 1 == 1,
        pattern[2],
        (code >> 3) & 1 == 1,
        pattern[3],
    ];
    bits.map(|bit| if bit { LOW } else { HIGH })
}

fn unpack(bits: [bool; 8]) -> (u8, Pattern) {
    let code = u8::from(bits[0])
        | u8::from(bits[2]) << 1
        | u8::from(bits[4]) << 2
        | u8::from(bits[6]) << 3;
    (code, [bits[1], bits[3], bits[5], bits[7]])
}

fn pattern_bits(pattern: Pattern) -> u8 {
    pattern.iter().fold(0, |acc, bit| acc << 1 | u8::from(*bit))
}

fn direction_pattern(code: u8, reverse: bool) -> Pattern {
    match (reverse, code >= 7) {
        (true, true) => [true, false, true, false],
        (true, false) => [true, false, true, true],
        (false, false) => [false, true, false, true],
        (false, true) => [false, true, false, false],
    }
}

fn base_function_pattern(function: u8) -> Option<[bool; 3]> {
    match function {
        1 => Some([true, true, false]),
        2 => Some([false, false, true]),
        3 => Some([false, true, true]),
        4 => Some([true, true, true]),
        _ => None,
    }
}

fn function_pattern(code: u8, function: u8, on: bool) -> Result<Pattern, ProtocolError> {
    let base = base_function_pattern(function).ok_or(ProtocolError::UnsupportedFunction {
        function,
        protocol: "Motorola II",
    })?;
    let (off_code, on_code) = COLLISIONS[usize::from(function - 1)];
    Ok(if !on && code == off_code {
        ALT_OFF
    } else if on && code == on_code {
        ALT_ON
    } else {
        [base[0], base[1], base[2], on]
    })
}

pub(crate) fn status_frames(command: &TrainCommand) -> Result<Vec<Frame>, ProtocolError> {
    let address = address_trits(command.address)?;
    let f0 = Trit::from_bit(command.functions.f0);
    let velocity = match command.speed {
        SpeedCode::Emergency => pack(1, EMERGENCY),
        speed => {
            let code = speed.transmitted();
            pack(code, direction_pattern(code, command.reverse))
        }
    };
    // function frames carry 0 while the velocity frame carries the emergency code
    let code = match command.speed {
        SpeedCode::Emergency => 0,
        speed => speed.transmitted(),
    };
    let mut frames = vec![Frame::assemble(address, f0, velocity)];
    for (function, on) in command.functions.defined_aux() {
        let payload = pack(code, function_pattern(code, function, on)?);
        frames.push(Frame::assemble(address, f0, payload));
    }
    Ok(frames)
}

/// Status for the idle address: step 0, forward, f0 off
pub(crate) fn idle_frame() -> Frame {
    Frame::assemble([Trit::Two; 4], Trit::Zero, pack(0, direction_pattern(0, false)))
}

pub(crate) fn decode_velocity(frame: &Frame) -> Result<DecodedStatus, ParseError> {
    let address = frame.address()?;
    let f0 = frame.function_trit()? == Trit::One;
    let (code, pattern) = unpack(frame.payload_bits());
    let (speed, reverse) = match pattern {
        [true, false, true, _] => (SpeedCode::from_transmitted(code), Some(true)),
        [false, true, false, _] => (SpeedCode::from_transmitted(code), Some(false)),
        EMERGENCY if code == 1 => (SpeedCode::Emergency, None),
        _ => {
            return Err(ParseError::UnknownPattern {
                pattern: pattern_bits(pattern),
                code,
            })
        }
    };
    let functions = FunctionBits {
        f0,
        ..FunctionBits::new()
    };
    Ok(DecodedStatus {
        address,
        speed,
        reverse,
        functions,
    })
}

/// Decode a function frame into (address, code, function, state)
pub(crate) fn decode_function(frame: &Frame) -> Result<(u8, u8, u8, bool), ParseError> {
    let address = frame.address()?;
    let (code, pattern) = unpack(frame.payload_bits());
    let unknown = ParseError::UnknownPattern {
        pattern: pattern_bits(pattern),
        code,
    };
    if pattern == ALT_OFF || pattern == ALT_ON {
        let on = pattern == ALT_ON;
        let function = COLLISIONS
            .iter()
            .position(|&(off_code, on_code)| code == if on { on_code } else { off_code })
            .ok_or(unknown)?;
        return Ok((address, code, function as u8 + 1, on));
    }
    let head = [pattern[0], pattern[1], pattern[2]];
    let function = (1..=4u8)
        .find(|f| base_function_pattern(*f) == Some(head))
        .ok_or(unknown)?;
    Ok((address, code, function, pattern[3]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bits_of(frame: &Frame) -> [bool; 8] {
        frame.payload_bits()
    }

    #[test]
    fn test_forward_low_speed_pattern() {
        // step 2 -> code 3 = 0b0011, forward & code <= 6 -> 0101
        let cmd = TrainCommand::new(3, SpeedCode::Step(2), false, FunctionBits::new());
        let frames = status_frames(&cmd).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(
            bits_of(&frames[0]),
            [true, false, true, true, false, false, false, true]
        );
    }

    #[test]
    fn test_reverse_high_speed_pattern() {
        // step 9 -> code 10 = 0b1010, reverse & code >= 7 -> 1010
        let cmd = TrainCommand::new(3, SpeedCode::Step(9), true, FunctionBits::new());
        let frames = status_frames(&cmd).unwrap();
        assert_eq!(
            bits_of(&frames[0]),
            [false, true, true, false, false, true, true, false]
        );
    }

    #[test]
    fn test_emergency_velocity() {
        let cmd = TrainCommand::new(3, SpeedCode::Emergency, true, FunctionBits::new());
        let frames = status_frames(&cmd).unwrap();
        assert_eq!(
            bits_of(&frames[0]),
            [true, true, false, false, false, false, false, false]
        );
        let decoded = decode_velocity(&frames[0]).unwrap();
        assert_eq!(decoded.speed, SpeedCode::Emergency);
        assert_eq!(decoded.reverse, None);
    }

    #[test]
    fn test_function_collision_patterns() {
        // f1 off at code 3 uses the alternative pattern
        assert_eq!(function_pattern(3, 1, false).unwrap(), ALT_OFF);
        assert_eq!(function_pattern(11, 1, true).unwrap(), ALT_ON);
        assert_eq!(
            function_pattern(5, 1, true).unwrap(),
            [true, true, false, true]
        );
        assert_eq!(function_pattern(7, 4, false).unwrap(), ALT_OFF);
        assert!(function_pattern(0, 5, true).is_err());
    }

    #[test]
    fn test_decode_function_frames() {
        for code in 0..=15u8 {
            for function in 1..=4u8 {
                for on in [false, true] {
                    let payload = pack(code, function_pattern(code, function, on).unwrap());
                    let frame = Frame::assemble(address_trits(5).unwrap(), Trit::One, payload);
                    assert_eq!(
                        decode_function(&frame).unwrap(),
                        (5, code, function, on),
                        "code {code} f{function} {on}"
                    );
                }
            }
        }
    }
}
