//! Position log files
//!
//! Each run appends to a fresh `pos_<n>.txt`. A line holds the positions of
//! all tracked trains separated by commas; the last line of the newest file
//! is where the trains stood when the previous run ended.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{ControlError, Result};
use crate::topology::PositionState;

const PREFIX: &str = "pos_";
const SUFFIX: &str = ".txt";

/// Highest log number in `dir`, 0 if there is none
pub fn last_log_index(dir: &Path) -> u32 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name();
            let name = name.to_str()?;
            name.strip_prefix(PREFIX)?
                .strip_suffix(SUFFIX)?
                .parse::<u32>()
                .ok()
        })
        .max()
        .unwrap_or(0)
}

fn log_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("{PREFIX}{index}{SUFFIX}"))
}

/// Positions from the last line of the newest log.
///
/// Always returns `count` states; trains without a usable record are unknown.
pub fn read_last_positions(dir: &Path, count: usize) -> Vec<PositionState> {
    let mut states = vec![PositionState::unknown(); count];
    let index = last_log_index(dir);
    if index == 0 {
        return states;
    }
    let path = log_path(dir, index);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) => {
            warn!("Cannot read {}: {}", path.display(), e);
            return states;
        }
    };
    let Some(line) = content.lines().rev().find(|l| !l.trim().is_empty()) else {
        return states;
    };
    for (slot, field) in states.iter_mut().zip(line.split(',')) {
        match field.parse::<PositionState>() {
            Ok(state) => *slot = state,
            Err(e) => warn!("Ignoring position '{}' in {}: {}", field, path.display(), e),
        }
    }
    info!("Restored positions from {}: {}", path.display(), line.trim());
    states
}

/// Append-only position log of the current run
#[derive(Debug)]
pub struct PositionLog {
    path: PathBuf,
    writer: BufWriter<File>,
    last_line: Option<String>,
}

impl PositionLog {
    /// Start the next numbered log file in `dir`
    pub fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| ControlError::persistence(dir, e))?;
        let path = log_path(dir, last_log_index(dir) + 1);
        let file = File::create(&path).map_err(|e| ControlError::persistence(&path, e))?;
        info!("Logging positions to {}", path.display());
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            last_line: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one line. Unchanged lines are skipped.
    pub fn append(&mut self, states: &[PositionState]) -> Result<()> {
        let line = states
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        if self.last_line.as_deref() == Some(line.as_str()) {
            return Ok(());
        }
        writeln!(self.writer, "{line}")
            .and_then(|_| self.writer.flush())
            .map_err(|e| ControlError::persistence(&self.path, e))?;
        self.last_line = Some(line);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::TrackLoop;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "trackside-poslog-{}-{}",
            name,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_missing_dir_gives_unknown() {
        let dir = temp_dir("missing");
        let states = read_last_positions(&dir, 2);
        assert_eq!(states.len(), 2);
        assert!(states.iter().all(|s| !s.is_known()));
    }

    #[test]
    fn test_last_line_of_newest_file_wins() {
        let dir = temp_dir("newest");
        {
            let mut log = PositionLog::create(&dir).unwrap();
            log.append(&[PositionState::new(TrackLoop::Outer, 10.0, true)])
                .unwrap();
        }
        let mut log = PositionLog::create(&dir).unwrap();
        assert!(log.path().ends_with("pos_2.txt"));
        let a = PositionState::new(TrackLoop::Inner, -300.5, false);
        let b = PositionState::new(TrackLoop::Outer, 2700.0, true);
        log.append(&[a, b]).unwrap();
        log.append(&[b, PositionState::unknown()]).unwrap();
        drop(log);

        assert_eq!(last_log_index(&dir), 2);
        let states = read_last_positions(&dir, 2);
        assert_eq!(states[0], b);
        assert!(!states[1].is_known());
        let _ = fs::remove_dir_all(&dir);
    }
}
