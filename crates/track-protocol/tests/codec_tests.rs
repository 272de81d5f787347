//! Integration tests for the Motorola frame codecs

use track_protocol::{
    idle_frame, Frame, FrameCodec, FunctionBits, Protocol, ProtocolCodec, ProtocolError,
    SpeedCode, TrainCommand, FRAME_LEN, IDLE_ADDRESS,
};

// ============================================================================
// Encoding
// ============================================================================

mod encoding_tests {
    use super::*;

    #[test]
    fn test_mm2_emits_one_frame_per_defined_function() {
        let functions = FunctionBits::new()
            .with(1, true)
            .unwrap()
            .with(3, false)
            .unwrap();
        let cmd = TrainCommand::new(48, SpeedCode::Step(5), true, functions);
        let frames = Protocol::Mm2.status_frames(&cmd).unwrap();
        assert_eq!(frames.len(), 3);
        for frame in &frames {
            assert_eq!(frame.address().unwrap(), 48);
        }
    }

    #[test]
    fn test_mm1_ignores_aux_functions() {
        let functions = FunctionBits::new().with(2, true).unwrap();
        let cmd = TrainCommand::new(24, SpeedCode::Step(5), false, functions);
        assert_eq!(Protocol::Mm1.status_frames(&cmd).unwrap().len(), 1);
    }

    #[test]
    fn test_turn_frame_only_on_mm1() {
        let functions = FunctionBits::new();
        assert!(Protocol::Mm1.turn_frame(24, &functions).unwrap().is_some());
        assert!(Protocol::Mm2.turn_frame(24, &functions).unwrap().is_none());
    }

    #[test]
    fn test_invalid_addresses_rejected() {
        for address in [0, IDLE_ADDRESS, 200] {
            let cmd = TrainCommand::new(address, SpeedCode::Step(0), false, FunctionBits::new());
            assert_eq!(
                Protocol::Mm2.status_frames(&cmd),
                Err(ProtocolError::InvalidAddress(address))
            );
        }
    }

    #[test]
    fn test_out_of_range_steps_rejected() {
        for step in [15, 200, 255] {
            let cmd = TrainCommand::new(24, SpeedCode::Step(step), false, FunctionBits::new());
            assert_eq!(
                Protocol::Mm2.status_frames(&cmd),
                Err(ProtocolError::InvalidSpeed(step))
            );
            assert_eq!(
                Protocol::Mm1.status_frames(&cmd),
                Err(ProtocolError::InvalidSpeed(step))
            );
        }
        let top = TrainCommand::new(24, SpeedCode::Step(14), false, FunctionBits::new());
        assert!(Protocol::Mm2.status_frames(&top).is_ok());
    }

    #[test]
    fn test_idle_frame() {
        let frame = idle_frame();
        assert_eq!(frame.as_bytes().len(), FRAME_LEN);
        let status = Protocol::Mm2.decode_status(&[frame]).unwrap();
        assert_eq!(status.address, IDLE_ADDRESS);
        assert_eq!(status.speed, SpeedCode::Step(0));
        assert_eq!(status.reverse, Some(false));
        assert!(!status.functions.f0);
    }
}

// ============================================================================
// Decoding
// ============================================================================

mod decoding_tests {
    use super::*;

    #[test]
    fn test_decode_recorded_stream() {
        let cmd = TrainCommand::new(
            3,
            SpeedCode::Step(12),
            false,
            FunctionBits::new().with(4, true).unwrap(),
        );
        let frames = Protocol::Mm2.status_frames(&cmd).unwrap();

        // every frame goes out twice
        let mut codec = FrameCodec::new();
        for frame in &frames {
            codec.push_bytes(frame.as_bytes());
            codec.push_bytes(frame.as_bytes());
        }
        let mut received = Vec::new();
        while let Some(frame) = codec.next_command() {
            received.push(frame);
        }
        received.dedup();
        assert_eq!(received, frames);

        let status = Protocol::Mm2.decode_status(&received).unwrap();
        assert_eq!(status.functions.get(4), Some(true));
    }

    #[test]
    fn test_mismatched_function_frame() {
        let a = TrainCommand::new(3, SpeedCode::Step(2), false, FunctionBits::new());
        let b = TrainCommand::new(
            3,
            SpeedCode::Step(3),
            false,
            FunctionBits::new().with(1, true).unwrap(),
        );
        let mut frames = Protocol::Mm2.status_frames(&a).unwrap();
        frames.push(Protocol::Mm2.status_frames(&b).unwrap()[1]);
        assert!(Protocol::Mm2.decode_status(&frames).is_err());
    }

    #[test]
    fn test_decode_empty() {
        assert!(Protocol::Mm1.decode_status(&[]).is_err());
    }

    #[test]
    fn test_mm1_turn_frame_is_not_status() {
        let turn = Protocol::Mm1
            .turn_frame(24, &FunctionBits::new())
            .unwrap()
            .unwrap();
        assert!(Protocol::Mm1.decode_status(&[turn]).is_err());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(Frame::from_bytes(&[1u8; FRAME_LEN]).is_err());
    }
}

// ============================================================================
// Property-Based Tests
// ============================================================================

mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    fn function_bits() -> impl Strategy<Value = FunctionBits> {
        (
            any::<bool>(),
            proptest::collection::vec(proptest::option::of(any::<bool>()), 4),
        )
            .prop_map(|(f0, aux)| {
                let mut bits = FunctionBits::new();
                bits.f0 = f0;
                for (i, state) in aux.into_iter().enumerate() {
                    if let Some(on) = state {
                        bits.set(i as u8 + 1, on).unwrap();
                    }
                }
                bits
            })
    }

    proptest! {
        #[test]
        fn mm2_roundtrip(
            address in 1u8..=79,
            step in 0u8..=14,
            reverse in any::<bool>(),
            functions in function_bits(),
        ) {
            let cmd = TrainCommand::new(address, SpeedCode::Step(step), reverse, functions);
            let frames = Protocol::Mm2.status_frames(&cmd).unwrap();
            let status = Protocol::Mm2.decode_status(&frames).unwrap();
            prop_assert_eq!(status.address, address);
            prop_assert_eq!(status.speed, SpeedCode::Step(step));
            prop_assert_eq!(status.reverse, Some(reverse));
            prop_assert_eq!(status.functions, functions);
        }

        #[test]
        fn mm2_emergency_roundtrip(address in 1u8..=79, functions in function_bits()) {
            let cmd = TrainCommand::new(address, SpeedCode::Emergency, false, functions);
            let frames = Protocol::Mm2.status_frames(&cmd).unwrap();
            let status = Protocol::Mm2.decode_status(&frames).unwrap();
            prop_assert_eq!(status.speed, SpeedCode::Emergency);
            prop_assert_eq!(status.functions, functions);
        }

        #[test]
        fn mm1_roundtrip(address in 1u8..=79, step in 0u8..=14, f0 in any::<bool>()) {
            let mut functions = FunctionBits::new();
            functions.f0 = f0;
            let cmd = TrainCommand::new(address, SpeedCode::Step(step), false, functions);
            let frames = Protocol::Mm1.status_frames(&cmd).unwrap();
            let status = Protocol::Mm1.decode_status(&frames).unwrap();
            prop_assert_eq!(status.address, address);
            prop_assert_eq!(status.speed, SpeedCode::Step(step));
            prop_assert_eq!(status.reverse, None);
            prop_assert_eq!(status.functions.f0, f0);
        }

        #[test]
        fn codec_never_panics(data in proptest::collection::vec(any::<u8>(), 0..200)) {
            let mut codec = FrameCodec::new();
            codec.push_bytes(&data);
            while codec.next_command().is_some() {}
        }
    }
}
