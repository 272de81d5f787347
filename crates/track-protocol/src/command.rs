//! Protocol-independent locomotive commands

use crate::error::ProtocolError;

/// Number of auxiliary functions (f1..f4) a frame set can carry
pub const AUX_FUNCTIONS: usize = 4;

/// Speed information of a status frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SpeedCode {
    /// Immediate stop regardless of the decoder's built-in deceleration
    Emergency,
    /// Ladder index, 0 = stop, 14 = full speed
    Step(u8),
}

impl SpeedCode {
    /// Highest ladder index
    pub const MAX_STEP: u8 = 14;

    /// Validated ladder index
    pub fn step(index: u8) -> Result<Self, ProtocolError> {
        if index > Self::MAX_STEP {
            return Err(ProtocolError::InvalidSpeed(index));
        }
        Ok(SpeedCode::Step(index))
    }

    /// Reject ladder indices a 4-bit speed field cannot carry
    pub fn validate(self) -> Result<Self, ProtocolError> {
        match self {
            SpeedCode::Step(index) => Self::step(index),
            SpeedCode::Emergency => Ok(self),
        }
    }

    /// 4-bit value put on the wire. Step 0 stays 0, step `i` becomes `i + 1`,
    /// which leaves 1 free for the emergency code. Out of range steps clamp
    /// to full speed; encoders reject them through [`validate`](Self::validate).
    pub fn transmitted(self) -> u8 {
        match self {
            SpeedCode::Emergency => 1,
            SpeedCode::Step(0) => 0,
            SpeedCode::Step(index) => index.min(Self::MAX_STEP) + 1,
        }
    }

    /// Inverse of [`transmitted`](Self::transmitted)
    pub fn from_transmitted(code: u8) -> Self {
        match code {
            0 => SpeedCode::Step(0),
            1 => SpeedCode::Emergency,
            code => SpeedCode::Step(code - 1),
        }
    }

    pub fn is_stopped(self) -> bool {
        matches!(self, SpeedCode::Emergency | SpeedCode::Step(0))
    }
}

/// Function outputs (lights, sound, ...) carried with a status command
///
/// f0 is part of every frame. f1..f4 are only sent when defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FunctionBits {
    pub f0: bool,
    pub(crate) aux: [Option<bool>; AUX_FUNCTIONS],
}

impl Default for FunctionBits {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionBits {
    /// f0 on, no auxiliary functions defined
    pub fn new() -> Self {
        Self {
            f0: true,
            aux: [None; AUX_FUNCTIONS],
        }
    }

    /// Builder-style [`set`](Self::set)
    pub fn with(mut self, function: u8, on: bool) -> Result<Self, ProtocolError> {
        self.set(function, on)?;
        Ok(self)
    }

    /// Set a function state, defining it if it was not yet defined
    pub fn set(&mut self, function: u8, on: bool) -> Result<(), ProtocolError> {
        match function {
            0 => self.f0 = on,
            1..=4 => self.aux[usize::from(function - 1)] = Some(on),
            _ => {
                return Err(ProtocolError::UnsupportedFunction {
                    function,
                    protocol: "Motorola",
                })
            }
        }
        Ok(())
    }

    /// State of a function, `None` for undefined auxiliary functions
    pub fn get(&self, function: u8) -> Option<bool> {
        match function {
            0 => Some(self.f0),
            1..=4 => self.aux[usize::from(function - 1)],
            _ => None,
        }
    }

    /// Defined auxiliary functions as `(number, state)`, ascending
    pub fn defined_aux(&self) -> impl Iterator<Item = (u8, bool)> + '_ {
        self.aux
            .iter()
            .enumerate()
            .filter_map(|(i, state)| state.map(|on| (i as u8 + 1, on)))
    }

    pub fn has_aux(&self) -> bool {
        self.aux.iter().any(Option::is_some)
    }
}

/// Everything the generator needs to broadcast one locomotive's state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrainCommand {
    pub address: u8,
    pub speed: SpeedCode,
    pub reverse: bool,
    pub functions: FunctionBits,
}

impl TrainCommand {
    pub fn new(address: u8, speed: SpeedCode, reverse: bool, functions: FunctionBits) -> Self {
        Self {
            address,
            speed,
            reverse,
            functions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transmitted_skips_emergency_slot() {
        assert_eq!(SpeedCode::Step(0).transmitted(), 0);
        assert_eq!(SpeedCode::Emergency.transmitted(), 1);
        assert_eq!(SpeedCode::Step(1).transmitted(), 2);
        assert_eq!(SpeedCode::Step(14).transmitted(), 15);
        for code in 0..=15 {
            assert_eq!(SpeedCode::from_transmitted(code).transmitted(), code);
        }
    }

    #[test]
    fn test_step_range() {
        assert!(SpeedCode::step(14).is_ok());
        assert_eq!(SpeedCode::step(15), Err(ProtocolError::InvalidSpeed(15)));
    }

    #[test]
    fn test_function_bits() {
        let bits = FunctionBits::new().with(2, true).unwrap().with(4, false).unwrap();
        assert!(bits.f0);
        assert_eq!(bits.get(1), None);
        assert_eq!(bits.get(2), Some(true));
        assert_eq!(bits.defined_aux().collect::<Vec<_>>(), vec![(2, true), (4, false)]);
        assert!(FunctionBits::new().set(5, true).is_err());
    }
}
