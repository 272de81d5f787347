//! Virtual serial line

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use tokio::io::AsyncWrite;
use track_protocol::{Frame, FrameCodec, ProtocolCodec, FRAME_LEN};
use track_signal::{ContactLevels, ContactPin, LineOpener, SignalError, TrackLine};

/// Recorded output is trimmed to this many frames
const MAX_RECORDED_FRAMES: usize = 4096;

#[derive(Debug)]
struct LineState {
    written: Vec<u8>,
    contacts: ContactLevels,
    power_fault: bool,
    broken: bool,
}

/// A simulated track line shared between the generator task and a test
///
/// Contacts idle high, matching contacts that pull their line low when a
/// wheel closes them.
#[derive(Debug, Clone)]
pub struct VirtualLine {
    state: Arc<Mutex<LineState>>,
}

impl Default for VirtualLine {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualLine {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LineState {
                written: Vec::new(),
                contacts: [true; 3],
                power_fault: false,
                broken: false,
            })),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_contact(&self, pin: ContactPin, level: bool) {
        let index = ContactPin::ALL
            .iter()
            .position(|p| *p == pin)
            .unwrap_or_default();
        self.state().contacts[index] = level;
    }

    pub fn contact(&self, pin: ContactPin) -> bool {
        let index = ContactPin::ALL
            .iter()
            .position(|p| *p == pin)
            .unwrap_or_default();
        self.state().contacts[index]
    }

    /// Raise or clear the power-sense input
    pub fn set_power_fault(&self, fault: bool) {
        self.state().power_fault = fault;
    }

    /// Make every read and write fail, as if the adapter was unplugged
    pub fn set_broken(&self, broken: bool) {
        self.state().broken = broken;
    }

    /// Every complete frame written so far, repeats included
    pub fn frames(&self) -> Vec<Frame> {
        let mut codec = FrameCodec::new();
        codec.push_bytes(&self.state().written);
        let mut frames = Vec::new();
        while let Some(frame) = codec.next_command() {
            frames.push(frame);
        }
        frames
    }

    /// Frames written for one address
    pub fn frames_for(&self, address: u8) -> Vec<Frame> {
        self.frames()
            .into_iter()
            .filter(|f| f.address().ok() == Some(address))
            .collect()
    }

    pub fn clear(&self) {
        self.state().written.clear();
    }

    pub fn bytes_written(&self) -> usize {
        self.state().written.len()
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "virtual line unplugged")
}

impl AsyncWrite for VirtualLine {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut state = self.state();
        if state.broken {
            return Poll::Ready(Err(broken_pipe()));
        }
        state.written.extend_from_slice(buf);
        let limit = MAX_RECORDED_FRAMES * FRAME_LEN;
        if state.written.len() > limit {
            let excess = state.written.len() - limit;
            // keep frame alignment
            let cut = excess.div_ceil(FRAME_LEN) * FRAME_LEN;
            let len = state.written.len();
            state.written.drain(..cut.min(len));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl TrackLine for VirtualLine {
    fn read_contacts(&mut self) -> Result<ContactLevels, SignalError> {
        let state = self.state();
        if state.broken {
            return Err(SignalError::Io {
                port: "virtual".to_string(),
                reason: broken_pipe().to_string(),
            });
        }
        Ok(state.contacts)
    }

    fn power_fault(&mut self) -> Result<bool, SignalError> {
        Ok(self.state().power_fault)
    }
}

/// Hands out a [`VirtualLine`], optionally failing the first few attempts
#[derive(Debug)]
pub struct VirtualLineOpener {
    port: String,
    line: VirtualLine,
    failures_left: AtomicU32,
}

impl VirtualLineOpener {
    pub fn new(port: impl Into<String>, line: VirtualLine) -> Self {
        Self {
            port: port.into(),
            line,
            failures_left: AtomicU32::new(0),
        }
    }

    /// Fail the next `count` open attempts with `PortUnavailable`
    pub fn failing(self, count: u32) -> Self {
        self.failures_left.store(count, Ordering::SeqCst);
        self
    }
}

impl LineOpener for VirtualLineOpener {
    fn port_name(&self) -> &str {
        &self.port
    }

    fn open(&self) -> Result<Box<dyn TrackLine>, SignalError> {
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(SignalError::PortUnavailable {
                port: self.port.clone(),
                reason: "virtual port busy".to_string(),
            });
        }
        if self.line.state().broken {
            return Err(SignalError::PortUnavailable {
                port: self.port.clone(),
                reason: "virtual line unplugged".to_string(),
            });
        }
        Ok(Box::new(self.line.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use track_protocol::{FunctionBits, Protocol, SpeedCode, TrainCommand};

    #[tokio::test]
    async fn test_records_frames() {
        let mut line = VirtualLine::new();
        let cmd = TrainCommand::new(3, SpeedCode::Step(2), false, FunctionBits::new());
        let frame = Protocol::Mm2.status_frames(&cmd).unwrap()[0];
        line.write_all(frame.as_bytes()).await.unwrap();
        line.write_all(frame.as_bytes()).await.unwrap();
        assert_eq!(line.frames_for(3), vec![frame, frame]);
        assert!(line.frames_for(4).is_empty());
    }

    #[tokio::test]
    async fn test_broken_line_fails() {
        let mut line = VirtualLine::new();
        line.set_broken(true);
        assert!(line.write_all(&[0u8; FRAME_LEN]).await.is_err());
        assert!(line.read_contacts().is_err());
    }

    #[test]
    fn test_opener_fails_then_opens() {
        let opener = VirtualLineOpener::new("virtual0", VirtualLine::new()).failing(1);
        assert!(matches!(
            opener.open(),
            Err(SignalError::PortUnavailable { .. })
        ));
        assert!(opener.open().is_ok());
    }

    #[test]
    fn test_contacts_idle_high() {
        let mut line = VirtualLine::new();
        line.set_contact(ContactPin::Dsr, false);
        assert_eq!(line.read_contacts().unwrap(), [true, false, true]);
    }
}
