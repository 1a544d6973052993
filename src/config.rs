//! Layered application settings.
//!
//! Settings are loaded from `config/default.toml` (optional), an explicit
//! override file, and `BLOOM__`-prefixed environment variables, in that
//! order. Every field carries a serde default so the orchestrator runs with
//! no configuration file at all. After deserialization the settings are
//! validated; semantic problems surface as
//! [`ScanError::Configuration`](crate::error::ScanError::Configuration)
//! rather than panics at first use.

use crate::error::{ScanError, ScanResult};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level settings for the scan orchestrator.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub transport: TransportSettings,
    pub scan: ScanSettings,
    pub storage: StorageSettings,
}

/// Hardware subprocess settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Path to the hardware-control executable.
    pub executable: PathBuf,
    /// Arguments passed to the executable. `--ipc` selects the line-delimited
    /// stdio protocol on the Bloom hardware backend.
    pub args: Vec<String>,
    /// How long to wait for the ready banner after spawn.
    #[serde(with = "humantime_serde")]
    pub spawn_timeout: Duration,
    /// Capacity of the bounded line channel between the reader task and the
    /// orchestrator. When full, the reader stops consuming stdout until the
    /// orchestrator drains (backpressure).
    pub line_channel_capacity: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("bloom-hardware"),
            args: vec!["--ipc".to_string()],
            spawn_timeout: Duration::from_secs(10),
            line_channel_capacity: 64,
        }
    }
}

/// Capture state machine settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// Multiplier applied to the expected per-frame interval when deriving
    /// the inactivity window for a scan.
    pub inactivity_margin: f64,
    /// Lower bound on the inactivity window, whatever the rotation speed.
    #[serde(with = "humantime_serde")]
    pub min_inactivity_window: Duration,
    /// How long to wait for the subprocess to acknowledge a cancel before
    /// killing it and declaring the scan cancelled.
    #[serde(with = "humantime_serde")]
    pub cancel_grace: Duration,
    /// Window for the hardware-availability check during `Configuring`.
    #[serde(with = "humantime_serde")]
    pub configure_timeout: Duration,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            inactivity_margin: 5.0,
            min_inactivity_window: Duration::from_secs(10),
            cancel_grace: Duration::from_secs(5),
            configure_timeout: Duration::from_secs(15),
        }
    }
}

/// Persistence settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Root directory under which one directory per scan is created.
    pub scan_root: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            scan_root: PathBuf::from("./scans"),
        }
    }
}

impl Settings {
    /// Loads settings from the default file, an optional override file, and
    /// the environment, then validates them.
    pub fn new(override_file: Option<&Path>) -> ScanResult<Self> {
        let mut builder =
            Config::builder().add_source(File::with_name("config/default").required(false));

        if let Some(path) = override_file {
            builder = builder.add_source(File::from(path));
        }

        let settings: Settings = builder
            .add_source(Environment::with_prefix("BLOOM").separator("__"))
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Semantic validation beyond what deserialization catches.
    pub fn validate(&self) -> ScanResult<()> {
        if self.transport.line_channel_capacity == 0 {
            return Err(ScanError::Configuration(
                "transport.line_channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.scan.inactivity_margin < 1.0 {
            return Err(ScanError::Configuration(format!(
                "scan.inactivity_margin must be >= 1.0, got {}",
                self.scan.inactivity_margin
            )));
        }
        if self.scan.cancel_grace.is_zero() {
            return Err(ScanError::Configuration(
                "scan.cancel_grace must be non-zero".to_string(),
            ));
        }
        if self.storage.scan_root.as_os_str().is_empty() {
            return Err(ScanError::Configuration(
                "storage.scan_root cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.transport.args, vec!["--ipc".to_string()]);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut settings = Settings::default();
        settings.transport.line_channel_capacity = 0;
        assert!(matches!(
            settings.validate(),
            Err(ScanError::Configuration(_))
        ));
    }

    #[test]
    fn test_margin_below_one_rejected() {
        let mut settings = Settings::default();
        settings.scan.inactivity_margin = 0.5;
        assert!(settings.validate().is_err());
    }

    // Settings::new reads the process environment; keep these serialized.

    #[test]
    #[serial_test::serial]
    fn test_override_file_layers_over_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("override.toml");
        std::fs::write(&path, "[scan]\ncancel_grace = \"2s\"\n").expect("write override");

        let settings = Settings::new(Some(&path)).expect("load settings");
        assert_eq!(settings.scan.cancel_grace, Duration::from_secs(2));
        // Untouched sections keep their defaults.
        assert_eq!(settings.transport.line_channel_capacity, 64);
    }

    #[test]
    #[serial_test::serial]
    fn test_environment_overrides_files() {
        std::env::set_var("BLOOM__STORAGE__SCAN_ROOT", "/srv/bloom/scans");
        let settings = Settings::new(None);
        std::env::remove_var("BLOOM__STORAGE__SCAN_ROOT");

        let settings = settings.expect("load settings");
        assert_eq!(
            settings.storage.scan_root,
            PathBuf::from("/srv/bloom/scans")
        );
    }

    #[test]
    fn test_toml_round_trip() {
        let settings = Settings::default();
        let text = toml::to_string(&settings).expect("serialize settings");
        let parsed: Settings = toml::from_str(&text).expect("parse settings");
        assert_eq!(
            parsed.scan.cancel_grace, settings.scan.cancel_grace,
            "humantime durations survive the round trip"
        );
    }
}
