//! Integration tests for the signal generator
//!
//! These tests run the generator task against a virtual line:
//! - Frame repetition and idle frames
//! - Short-circuit latching and port failures
//! - Contact waits: success, timeout, any pin and superseded listeners

use std::time::Duration;

use tokio::time::sleep;
use track_protocol::{idle_frame, FunctionBits, Protocol, SpeedCode, TrainCommand};
use track_signal::{ContactPin, GeneratorConfig, SignalError, SignalEvent, SignalGenerator};
use track_sim::{VirtualLine, VirtualLineOpener};

// ============================================================================
// Helper Functions
// ============================================================================

mod helpers {
    use super::*;

    pub fn spawn(line: &VirtualLine) -> SignalGenerator {
        SignalGenerator::spawn(
            Box::new(VirtualLineOpener::new("virtual0", line.clone())),
            GeneratorConfig::default(),
        )
    }

    pub fn command(address: u8, step: u8) -> TrainCommand {
        TrainCommand::new(address, SpeedCode::Step(step), false, FunctionBits::new())
    }

    pub async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..5000 {
            if condition() {
                return;
            }
            sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached");
    }

    /// Let the generator read the line at least once
    pub async fn settle() {
        sleep(Duration::from_millis(50)).await;
    }
}

use helpers::*;

// ============================================================================
// Broadcasting
// ============================================================================

mod broadcast_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_every_frame_is_sent_twice() {
        let line = VirtualLine::new();
        let generator = spawn(&line);
        generator.set(command(24, 5), Protocol::Mm2).unwrap();
        generator.start();

        let probe = line.clone();
        wait_until(move || probe.frames_for(24).len() >= 4).await;
        let frames = line.frames();
        // the last pair may be half written
        for pair in frames.chunks_exact(2) {
            assert_eq!(pair[0], pair[1]);
        }
        let expected = Protocol::Mm2.status_frames(&command(24, 5)).unwrap()[0];
        assert!(line.frames_for(24).contains(&expected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_frame_when_nothing_registered() {
        let line = VirtualLine::new();
        let generator = spawn(&line);
        generator.start();

        let probe = line.clone();
        wait_until(move || probe.frames().len() >= 2).await;
        assert!(generator.is_sending());
        assert!(line.frames().iter().all(|f| *f == idle_frame()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_sent_until_started() {
        let line = VirtualLine::new();
        let generator = spawn(&line);
        generator.set(command(3, 2), Protocol::Mm2).unwrap();
        settle().await;
        assert_eq!(line.bytes_written(), 0);
        assert!(!generator.is_sending());
        assert!(!generator.is_start_requested());

        generator.start();
        let probe = generator.clone();
        wait_until(move || probe.is_sending()).await;
        generator.stop();
        let probe = generator.clone();
        wait_until(move || !probe.is_sending()).await;
        assert!(generator.time_since_last_stopped().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_address_is_dropped() {
        let line = VirtualLine::new();
        let generator = spawn(&line);
        generator.set(command(7, 1), Protocol::Mm1).unwrap();
        assert_eq!(generator.is_in_reverse(7), Some(false));
        assert!(generator.remove(7));
        assert!(!generator.remove(7));
        assert_eq!(generator.is_in_reverse(7), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_address_rejected() {
        let line = VirtualLine::new();
        let generator = spawn(&line);
        let err = generator.set(command(90, 1), Protocol::Mm2).unwrap_err();
        assert!(matches!(err, SignalError::Protocol(_)));
    }
}

// ============================================================================
// Faults
// ============================================================================

mod fault_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_short_circuit_latches() {
        let line = VirtualLine::new();
        let generator = spawn(&line);
        let mut rx = generator.subscribe();
        line.set_power_fault(true);
        generator.start();

        let probe = generator.clone();
        wait_until(move || probe.is_short_circuited()).await;
        assert!(!generator.is_sending());
        assert!(!generator.is_start_requested());
        assert!(generator.error().is_some());

        let mut saw_short = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SignalEvent::ShortCircuit { ref port } if port == "virtual0") {
                saw_short = true;
            }
        }
        assert!(saw_short);

        // stays latched even once the fault is gone
        line.set_power_fault(false);
        sleep(Duration::from_millis(500)).await;
        assert!(generator.is_short_circuited());
        assert!(!generator.is_sending());

        generator.start();
        let probe = generator.clone();
        wait_until(move || probe.is_sending()).await;
        assert!(!generator.is_short_circuited());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_port_is_retried() {
        let line = VirtualLine::new();
        let generator = SignalGenerator::spawn(
            Box::new(VirtualLineOpener::new("virtual0", line.clone()).failing(1)),
            GeneratorConfig::default(),
        );
        let mut rx = generator.subscribe();
        generator.start();

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SignalEvent::PortUnavailable { .. }));
        assert!(generator.error().is_some());

        let probe = generator.clone();
        wait_until(move || probe.is_sending()).await;
        assert_eq!(generator.error(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unplugged_line_recovers() {
        let line = VirtualLine::new();
        let generator = spawn(&line);
        generator.start();
        let probe = generator.clone();
        wait_until(move || probe.is_sending()).await;

        let mut rx = generator.subscribe();
        line.set_broken(true);
        let probe = generator.clone();
        wait_until(move || !probe.is_sending()).await;
        let mut saw_unavailable = false;
        while let Ok(event) = rx.try_recv() {
            saw_unavailable |= matches!(event, SignalEvent::PortUnavailable { .. });
        }
        assert!(saw_unavailable);

        line.set_broken(false);
        let probe = generator.clone();
        wait_until(move || probe.is_sending()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_sending() {
        let line = VirtualLine::new();
        let generator = spawn(&line);
        generator.start();
        settle().await;
        generator.shutdown();
        settle().await;
        assert!(!generator.is_sending());
        assert!(!generator.is_start_requested());
    }
}

// ============================================================================
// Contacts
// ============================================================================

mod contact_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_await_event_returns_transition() {
        let line = VirtualLine::new();
        let generator = spawn(&line);
        settle().await;
        assert_eq!(generator.contact_status().level(ContactPin::Ri), Some(true));

        let waiter = generator.clone();
        let wait = tokio::spawn(async move {
            waiter
                .await_event(&[ContactPin::Ri], &[false], Duration::from_secs(5), "test")
                .await
        });
        settle().await;
        line.set_contact(ContactPin::Ri, false);

        let event = wait.await.unwrap().unwrap();
        assert_eq!(event.pin, ContactPin::Ri);
        assert!(!event.level);
        let status = generator.contact_status();
        assert_eq!(status.level(ContactPin::Ri), Some(false));
        assert_eq!(status.last_change(ContactPin::Ri), Some(event.at));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_event_times_out() {
        let line = VirtualLine::new();
        let generator = spawn(&line);
        let err = generator
            .await_event(&[ContactPin::Ri], &[false], Duration::from_secs(1), "test")
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_event_ignores_other_pins_and_levels() {
        let line = VirtualLine::new();
        let generator = spawn(&line);
        settle().await;

        let waiter = generator.clone();
        let wait = tokio::spawn(async move {
            waiter
                .await_event(&[ContactPin::Dsr], &[false], Duration::from_secs(1), "test")
                .await
        });
        settle().await;
        line.set_contact(ContactPin::Ri, false);
        settle().await;
        line.set_contact(ContactPin::Ri, true);

        assert!(wait.await.unwrap().unwrap_err().is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_pin_list_matches_any_pin() {
        let line = VirtualLine::new();
        let generator = spawn(&line);
        settle().await;

        let waiter = generator.clone();
        let wait = tokio::spawn(async move {
            waiter
                .await_event(&[], &[false], Duration::from_secs(5), "test")
                .await
        });
        settle().await;
        line.set_contact(ContactPin::Cd, false);

        let event = wait.await.unwrap().unwrap();
        assert_eq!(event.pin, ContactPin::Cd);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_wait_supersedes_older() {
        let line = VirtualLine::new();
        let generator = spawn(&line);
        settle().await;

        let waiter = generator.clone();
        let first = tokio::spawn(async move {
            waiter
                .await_event(&[ContactPin::Ri], &[false], Duration::from_secs(5), "tracker")
                .await
        });
        settle().await;
        let waiter = generator.clone();
        let second = tokio::spawn(async move {
            waiter
                .await_event(&[ContactPin::Ri], &[false], Duration::from_secs(5), "tracker")
                .await
        });
        settle().await;
        line.set_contact(ContactPin::Ri, false);

        assert!(matches!(
            first.await.unwrap(),
            Err(SignalError::Superseded(name)) if name == "tracker"
        ));
        assert_eq!(second.await.unwrap().unwrap().pin, ContactPin::Ri);
    }
}
