//! Fixed-length line frames

use std::fmt;

use crate::error::ParseError;
use crate::trit::{address_from_trits, Trit, HIGH, IDLE_ADDRESS, LOW};
use crate::ProtocolCodec;

/// Serial words per frame: 4 address trits, 1 function trit, 8 payload words
pub const FRAME_LEN: usize = 18;

/// Offset of the 8-word payload (speed/direction/function bits)
const PAYLOAD_START: usize = 10;

/// One frame as written to the serial line
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Frame([u8; FRAME_LEN]);

impl Frame {
    pub(crate) fn assemble(address: [Trit; 4], f0: Trit, payload: [u8; 8]) -> Self {
        let mut bytes = [0u8; FRAME_LEN];
        for (i, trit) in address.iter().enumerate() {
            bytes[i * 2..i * 2 + 2].copy_from_slice(&trit.bytes());
        }
        bytes[8..PAYLOAD_START].copy_from_slice(&f0.bytes());
        bytes[PAYLOAD_START..].copy_from_slice(&payload);
        Frame(bytes)
    }

    /// Validate raw line bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let array: [u8; FRAME_LEN] =
            bytes
                .try_into()
                .map_err(|_| ParseError::InvalidLength {
                    expected: FRAME_LEN,
                    actual: bytes.len(),
                })?;
        if let Some(&bad) = array.iter().find(|&&b| b != HIGH && b != LOW) {
            return Err(ParseError::InvalidByte(bad));
        }
        Ok(Frame(array))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn address(&self) -> Result<u8, ParseError> {
        let mut trits = [Trit::Zero; 4];
        for (i, trit) in trits.iter_mut().enumerate() {
            *trit = self.trit_at(i * 2)?;
        }
        let address = address_from_trits(trits);
        if address > IDLE_ADDRESS {
            return Err(ParseError::InvalidAddress(address));
        }
        Ok(address)
    }

    pub fn function_trit(&self) -> Result<Trit, ParseError> {
        self.trit_at(8)
    }

    /// Payload words as bits (low word = bit set)
    pub fn payload_bits(&self) -> [bool; 8] {
        let mut bits = [false; 8];
        for (bit, byte) in bits.iter_mut().zip(&self.0[PAYLOAD_START..]) {
            *bit = *byte == LOW;
        }
        bits
    }

    /// Payload read as four trits
    pub fn payload_trits(&self) -> Result<[Trit; 4], ParseError> {
        let mut trits = [Trit::Zero; 4];
        for (i, trit) in trits.iter_mut().enumerate() {
            *trit = self.trit_at(PAYLOAD_START + i * 2)?;
        }
        Ok(trits)
    }

    fn trit_at(&self, offset: usize) -> Result<Trit, ParseError> {
        Trit::from_bytes(self.0[offset], self.0[offset + 1])
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame(")?;
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 && i % 2 == 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", if *byte == LOW { '_' } else { '^' })?;
        }
        write!(f, ")")
    }
}

/// Splits a recorded line byte stream back into frames
///
/// Bytes that do not form a valid frame are skipped one at a time until the
/// stream lines up again.
#[derive(Debug, Default)]
pub struct FrameCodec {
    buffer: Vec<u8>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(FRAME_LEN * 4),
        }
    }
}

impl ProtocolCodec for FrameCodec {
    type Command = Frame;

    fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    fn next_command(&mut self) -> Option<Frame> {
        while self.buffer.len() >= FRAME_LEN {
            match Frame::from_bytes(&self.buffer[..FRAME_LEN]) {
                Ok(frame) => {
                    self.buffer.drain(..FRAME_LEN);
                    return Some(frame);
                }
                Err(e) => {
                    tracing::trace!("Skipping byte while resyncing: {}", e);
                    self.buffer.remove(0);
                }
            }
        }
        None
    }

    fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trit::address_trits;

    fn sample() -> Frame {
        Frame::assemble(address_trits(24).unwrap(), Trit::One, [LOW; 8])
    }

    #[test]
    fn test_assemble_layout() {
        let frame = sample();
        assert_eq!(frame.as_bytes().len(), FRAME_LEN);
        assert_eq!(frame.address().unwrap(), 24);
        assert_eq!(frame.function_trit().unwrap(), Trit::One);
        assert_eq!(frame.payload_bits(), [true; 8]);
    }

    #[test]
    fn test_from_bytes_rejects_bad_input() {
        assert!(matches!(
            Frame::from_bytes(&[LOW; 17]),
            Err(ParseError::InvalidLength { actual: 17, .. })
        ));
        let mut bytes = [LOW; FRAME_LEN];
        bytes[3] = 7;
        assert_eq!(Frame::from_bytes(&bytes), Err(ParseError::InvalidByte(7)));
    }

    #[test]
    fn test_codec_splits_stream() {
        let frame = sample();
        let mut codec = FrameCodec::new();
        codec.push_bytes(frame.as_bytes());
        codec.push_bytes(&frame.as_bytes()[..5]);
        assert_eq!(codec.next_command(), Some(frame));
        assert_eq!(codec.next_command(), None);
        codec.push_bytes(&frame.as_bytes()[5..]);
        assert_eq!(codec.next_command(), Some(frame));
    }

    #[test]
    fn test_codec_resyncs_after_garbage() {
        let frame = sample();
        let mut codec = FrameCodec::new();
        codec.push_bytes(&[0x11, 0x22]);
        codec.push_bytes(frame.as_bytes());
        assert_eq!(codec.next_command(), Some(frame));
    }
}
