//! Ternary symbols and address encoding
//!
//! Each trit is sent as two 6-bit serial words. With a start bit leading each
//! word the line shows a rising edge per half-trit; the word value decides
//! whether the line stays up or drops.

use crate::error::{ParseError, ProtocolError};

/// Serial word that keeps the line high
pub const HIGH: u8 = 63;
/// Serial word that pulls the line low
pub const LOW: u8 = 0;

/// Highest address a locomotive may use
pub const MAX_ADDRESS: u8 = 79;
/// Address reserved for the idle frame
pub const IDLE_ADDRESS: u8 = 80;

/// One ternary symbol on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trit {
    Zero,
    One,
    Two,
}

impl Trit {
    /// The two serial words that make up this trit
    pub const fn bytes(self) -> [u8; 2] {
        match self {
            Trit::Zero => [HIGH, HIGH],
            Trit::One => [LOW, LOW],
            Trit::Two => [LOW, HIGH],
        }
    }

    /// Parse a pair of serial words
    pub fn from_bytes(first: u8, second: u8) -> Result<Self, ParseError> {
        match (first, second) {
            (HIGH, HIGH) => Ok(Trit::Zero),
            (LOW, LOW) => Ok(Trit::One),
            (LOW, HIGH) => Ok(Trit::Two),
            (a, b) => Err(ParseError::InvalidTrit(a, b)),
        }
    }

    /// Binary trit: `One` when set, `Zero` otherwise
    pub const fn from_bit(bit: bool) -> Self {
        if bit {
            Trit::One
        } else {
            Trit::Zero
        }
    }

    pub const fn value(self) -> u8 {
        match self {
            Trit::Zero => 0,
            Trit::One => 1,
            Trit::Two => 2,
        }
    }

    fn from_digit(digit: u8) -> Self {
        match digit {
            0 => Trit::Zero,
            1 => Trit::One,
            _ => Trit::Two,
        }
    }
}

/// Base-3 digits of an address, least significant digit first
pub fn address_trits(address: u8) -> Result<[Trit; 4], ProtocolError> {
    if address > IDLE_ADDRESS {
        return Err(ProtocolError::InvalidAddress(address));
    }
    Ok([
        Trit::from_digit(address % 3),
        Trit::from_digit((address / 3) % 3),
        Trit::from_digit((address / 9) % 3),
        Trit::from_digit(address / 27),
    ])
}

/// Inverse of [`address_trits`]
pub fn address_from_trits(trits: [Trit; 4]) -> u8 {
    trits
        .iter()
        .rev()
        .fold(0u8, |acc, trit| acc * 3 + trit.value())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trit_bytes_roundtrip() {
        for trit in [Trit::Zero, Trit::One, Trit::Two] {
            let [a, b] = trit.bytes();
            assert_eq!(Trit::from_bytes(a, b).unwrap(), trit);
        }
    }

    #[test]
    fn test_high_low_is_not_a_trit() {
        assert_eq!(
            Trit::from_bytes(HIGH, LOW),
            Err(ParseError::InvalidTrit(HIGH, LOW))
        );
    }

    #[test]
    fn test_address_digits_lsb_first() {
        // 24 = 0 + 2*3 + 2*9 + 0*27
        assert_eq!(
            address_trits(24).unwrap(),
            [Trit::Zero, Trit::Two, Trit::Two, Trit::Zero]
        );
        assert_eq!(
            address_trits(IDLE_ADDRESS).unwrap(),
            [Trit::Two, Trit::Two, Trit::Two, Trit::Two]
        );
    }

    #[test]
    fn test_every_address_roundtrips() {
        for address in 0..=IDLE_ADDRESS {
            let trits = address_trits(address).unwrap();
            assert_eq!(address_from_trits(trits), address);
        }
    }

    #[test]
    fn test_address_out_of_range() {
        assert!(address_trits(81).is_err());
    }
}
