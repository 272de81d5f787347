//! Application settings

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;
use track_control::{default_roster, LayoutConfig, TrainSpec};

/// A serial port carrying a track signal
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortSettings {
    /// Serial port path
    pub port: String,
    /// Trains broadcast on this port, all trains when absent
    #[serde(default)]
    pub trains: Option<Vec<String>>,
    /// Run a virtual line instead of opening the port
    #[serde(default)]
    pub simulated: bool,
}

/// Terminus station wiring
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TerminusSettings {
    /// Port whose contact inputs carry the entry sensor
    pub sensor_port: String,
    /// Channels on the relay board
    #[serde(default = "default_relay_channels")]
    pub relay_channels: u8,
}

fn default_relay_channels() -> u8 {
    8
}

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Configured signal ports
    #[serde(default)]
    pub ports: Vec<PortSettings>,
    /// Scan for ports when none are configured
    #[serde(default = "default_true")]
    pub auto_detect: bool,
    /// Only use scanned ports whose USB product contains this text
    #[serde(default)]
    pub product_filter: Option<String>,
    /// Port whose contacts drive position tracking, the first port when absent
    #[serde(default)]
    pub contact_port: Option<String>,
    #[serde(default)]
    pub terminus: Option<TerminusSettings>,
    /// Switch track power on at startup
    #[serde(default)]
    pub power_on_start: bool,
    /// Trains on the layout, the built-in roster when empty
    #[serde(default)]
    pub roster: Vec<TrainSpec>,
    #[serde(default)]
    pub layout: LayoutConfig,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            auto_detect: true,
            product_filter: None,
            contact_port: None,
            terminus: None,
            power_on_start: false,
            roster: Vec::new(),
            layout: LayoutConfig::default(),
        }
    }
}

impl Settings {
    /// Get the XDG config directory for trackside
    /// Uses $XDG_CONFIG_HOME/trackside, falls back to ~/.config/trackside
    fn config_dir() -> Option<PathBuf> {
        if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
            let path = PathBuf::from(xdg_config);
            if path.is_absolute() {
                return Some(path.join("trackside"));
            }
        }

        dirs::home_dir().map(|h| h.join(".config").join("trackside"))
    }

    /// Get the settings file path
    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("settings.json"))
    }

    /// Where position logs and terminus state go unless the layout names a directory
    pub fn default_data_dir() -> Option<PathBuf> {
        dirs::data_local_dir().map(|d| d.join("trackside"))
    }

    /// Load settings from disk, defaults if the file is missing or invalid
    pub fn load() -> Self {
        let Some(path) = Self::settings_path() else {
            return Self::default();
        };
        let Ok(json) = std::fs::read_to_string(&path) else {
            return Self::default();
        };
        serde_json::from_str(&json).unwrap_or_else(|e| {
            warn!("Ignoring {}: {}", path.display(), e);
            Self::default()
        })
    }

    /// Configured roster, or the built-in one
    pub fn roster_specs(&self) -> Vec<TrainSpec> {
        if self.roster.is_empty() {
            default_roster()
        } else {
            self.roster.clone()
        }
    }

    /// Layout config with the data directory filled in
    pub fn layout(&self) -> LayoutConfig {
        let mut layout = self.layout.clone();
        if layout.data_dir.is_none() {
            layout.data_dir = Self::default_data_dir();
        }
        layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, Settings::default());
        assert!(settings.auto_detect);
        assert!(!settings.roster_specs().is_empty());
    }

    #[test]
    fn test_partial_port_entry() {
        let settings: Settings = serde_json::from_str(
            r#"{"ports": [{"port": "/dev/ttyUSB0", "trains": ["ICE"]}],
                "terminus": {"sensor_port": "/dev/ttyUSB0"}}"#,
        )
        .unwrap();
        assert_eq!(settings.ports.len(), 1);
        assert!(!settings.ports[0].simulated);
        assert_eq!(settings.ports[0].trains, Some(vec!["ICE".to_string()]));
        assert_eq!(settings.terminus.unwrap().relay_channels, 8);
    }

    #[test]
    fn test_round_trip() {
        let mut settings = Settings::default();
        settings.ports.push(PortSettings {
            port: "virtual0".to_string(),
            trains: None,
            simulated: true,
        });
        settings.layout.tracked = vec!["ICE".to_string()];
        let json = serde_json::to_string(&settings).unwrap();
        let restored: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, settings);
    }

    #[test]
    fn test_routine_crew() {
        let settings: Settings = serde_json::from_str(
            r#"{"layout": {"tracked": ["ICE", "S-Bahn"],
                "routines": {"outer_train": "ICE", "shuttle_train": "S-Bahn", "pause_ms": 500}}}"#,
        )
        .unwrap();
        let routines = settings.layout().routines;
        assert_eq!(routines.outer_train.as_deref(), Some("ICE"));
        assert_eq!(routines.shuttle_train.as_deref(), Some("S-Bahn"));
        assert_eq!(routines.pause_ms, 500);
        assert_eq!(routines.regular_rounds, 2);
    }

    #[test]
    fn test_layout_keeps_explicit_data_dir() {
        let mut settings = Settings::default();
        settings.layout.data_dir = Some(PathBuf::from("/srv/layout"));
        assert_eq!(settings.layout().data_dir, Some(PathBuf::from("/srv/layout")));
    }
}
