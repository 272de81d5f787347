//! The set of frames currently on air

use std::collections::{BTreeMap, VecDeque};

use track_protocol::{idle_frame, Frame, Protocol, ProtocolError, TrainCommand};

#[derive(Debug, Clone)]
struct Entry {
    command: TrainCommand,
    protocol: Protocol,
    frames: Vec<Frame>,
}

/// Round-robin frame scheduler shared between the generator handle and its task
///
/// Frames of a changed command jump the queue so a new speed reaches the
/// decoder within one frame slot instead of one full cycle.
#[derive(Debug)]
pub(crate) struct BroadcastTable {
    entries: BTreeMap<u8, Entry>,
    priority: VecDeque<Frame>,
    cycle: VecDeque<Frame>,
    idle: Frame,
}

impl BroadcastTable {
    pub(crate) fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            priority: VecDeque::new(),
            cycle: VecDeque::new(),
            idle: idle_frame(),
        }
    }

    /// Replace the command for an address. Returns `false` if nothing changed.
    pub(crate) fn set(
        &mut self,
        command: TrainCommand,
        protocol: Protocol,
    ) -> Result<bool, ProtocolError> {
        let frames = protocol.status_frames(&command)?;
        if let Some(previous) = self.entries.get(&command.address) {
            if previous.command == command && previous.protocol == protocol {
                return Ok(false);
            }
            // frames of the replaced command must not follow the new ones
            let address = command.address;
            self.priority.retain(|f| f.address().ok() != Some(address));
            self.cycle.retain(|f| f.address().ok() != Some(address));
            if previous.command.reverse != command.reverse {
                if let Some(turn) = protocol.turn_frame(command.address, &command.functions)? {
                    self.priority.push_back(turn);
                }
            }
        }
        self.priority.extend(frames.iter().copied());
        self.entries.insert(
            command.address,
            Entry {
                command,
                protocol,
                frames,
            },
        );
        Ok(true)
    }

    pub(crate) fn remove(&mut self, address: u8) -> bool {
        self.priority.retain(|f| f.address().ok() != Some(address));
        self.cycle.clear();
        self.entries.remove(&address).is_some()
    }

    pub(crate) fn command(&self, address: u8) -> Option<TrainCommand> {
        self.entries.get(&address).map(|e| e.command)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Next frame to put on the line
    pub(crate) fn next_frame(&mut self) -> Frame {
        if let Some(frame) = self.priority.pop_front() {
            return frame;
        }
        if self.cycle.is_empty() {
            self.cycle
                .extend(self.entries.values().flat_map(|e| e.frames.iter().copied()));
        }
        self.cycle.pop_front().unwrap_or(self.idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use track_protocol::{FunctionBits, SpeedCode};

    fn cmd(address: u8, step: u8, reverse: bool) -> TrainCommand {
        TrainCommand::new(address, SpeedCode::Step(step), reverse, FunctionBits::new())
    }

    #[test]
    fn test_idle_when_empty() {
        let mut table = BroadcastTable::new();
        assert_eq!(table.next_frame(), idle_frame());
        assert!(table.is_empty());
    }

    #[test]
    fn test_unchanged_set_is_ignored() {
        let mut table = BroadcastTable::new();
        assert!(table.set(cmd(3, 4, false), Protocol::Mm2).unwrap());
        assert!(!table.set(cmd(3, 4, false), Protocol::Mm2).unwrap());
    }

    #[test]
    fn test_changed_frames_go_first() {
        let mut table = BroadcastTable::new();
        table.set(cmd(3, 4, false), Protocol::Mm2).unwrap();
        table.set(cmd(5, 4, false), Protocol::Mm2).unwrap();
        // drain priority queue
        table.next_frame();
        table.next_frame();
        // start a cycle, then change address 5
        let _ = table.next_frame();
        table.set(cmd(5, 9, false), Protocol::Mm2).unwrap();
        let next = table.next_frame();
        let expected = Protocol::Mm2.status_frames(&cmd(5, 9, false)).unwrap()[0];
        assert_eq!(next, expected);
    }

    #[test]
    fn test_replaced_command_is_not_resent() {
        let mut table = BroadcastTable::new();
        table.set(cmd(3, 4, false), Protocol::Mm2).unwrap();
        table.set(cmd(5, 9, false), Protocol::Mm2).unwrap();
        table.next_frame();
        table.next_frame();
        // start a cycle, leaving the old frame for address 5 queued
        let _ = table.next_frame();
        let emergency = TrainCommand::new(5, SpeedCode::Emergency, false, FunctionBits::new());
        table.set(emergency, Protocol::Mm2).unwrap();

        let stale = Protocol::Mm2.status_frames(&cmd(5, 9, false)).unwrap()[0];
        let fresh = Protocol::Mm2.status_frames(&emergency).unwrap()[0];
        let sent: Vec<Frame> = (0..8).map(|_| table.next_frame()).collect();
        assert_eq!(sent[0], fresh);
        assert!(!sent.contains(&stale));
    }

    #[test]
    fn test_mm1_direction_change_sends_turn_first() {
        let mut table = BroadcastTable::new();
        table.set(cmd(24, 0, false), Protocol::Mm1).unwrap();
        table.next_frame();
        table.set(cmd(24, 0, true), Protocol::Mm1).unwrap();
        let turn = Protocol::Mm1
            .turn_frame(24, &FunctionBits::new())
            .unwrap()
            .unwrap();
        assert_eq!(table.next_frame(), turn);
        assert_eq!(table.command(24).map(|c| c.reverse), Some(true));
    }

    #[test]
    fn test_round_robin_covers_all_trains() {
        let mut table = BroadcastTable::new();
        table.set(cmd(3, 1, false), Protocol::Mm2).unwrap();
        table.set(cmd(5, 1, false), Protocol::Mm2).unwrap();
        table.next_frame();
        table.next_frame();
        let mut seen: Vec<u8> = (0..4).map(|_| table.next_frame().address().unwrap()).collect();
        seen.sort();
        assert_eq!(seen, vec![3, 3, 5, 5]);
    }

    proptest! {
        #[test]
        fn prop_only_latest_command_is_sent(
            updates in prop::collection::vec((prop::sample::select(vec![3u8, 5, 7]), 0u8..=14, 0usize..3), 1..30),
        ) {
            let mut table = BroadcastTable::new();
            for (address, step, pops) in updates {
                table.set(cmd(address, step, false), Protocol::Mm2).unwrap();
                for _ in 0..pops {
                    table.next_frame();
                }
            }
            for _ in 0..12 {
                let frame = table.next_frame();
                let Ok(address) = frame.address() else { continue };
                if let Some(current) = table.command(address) {
                    let expected = Protocol::Mm2.status_frames(&current).unwrap();
                    prop_assert!(expected.contains(&frame));
                }
            }
        }
    }
}
