//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `bridge.toml`.
//!     loads configuration from file or falls back to defaults.
//!     command line flags are applied on top by main.rs.
//!
//! structure:
//!     - SerialConfig: Which port, how fast, and whether to keep reconnecting.
//!     - FirebaseConfig: Database URL, credentials file, document paths.
//!     - PollingConfig: Upload / control poll / mirror cadence.
//!     - CommandConfig: How long to wait for a device ack.
//!     - LinkConfig: When a failing serial link gets reset.
//!     - LoggingConfig: Log level and sensor echo.
//!
//! every section and every field has a default, so a partial file is fine.
//!
//! ==============================================================================

use crate::channel::AckTiming;
use crate::reconciler::ReconcileTiming;
use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct BridgeConfig {
    pub serial: SerialConfig,
    pub firebase: FirebaseConfig,
    pub polling: PollingConfig,
    pub command: CommandConfig,
    pub link: LinkConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SerialConfig {
    /// empty until set by file or `--port`
    pub port: String,
    pub baud_rate: u32,
    pub reconnect: bool,
    /// wait after opening while the board auto-resets
    pub settle_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FirebaseConfig {
    /// required; there is no sensible default database
    pub database_url: String,
    pub credentials_path: PathBuf,
    pub sensor_path: String,
    pub control_path: String,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PollingConfig {
    pub upload_interval_seconds: u64,
    pub control_poll_seconds: u64,
    /// 0 turns confirmed-state mirroring off
    pub mirror_interval_seconds: u64,
    pub error_backoff_seconds: u64,
    pub read_tick_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CommandConfig {
    pub ack_timeout_ms: u64,
    pub ack_settle_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LinkConfig {
    pub error_threshold: u32,
    pub reset_cooldown_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_sensor_data: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 9600,
            reconnect: false,
            settle_ms: 2000,
        }
    }
}

impl Default for FirebaseConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            credentials_path: PathBuf::from("firebase_credentials.json"),
            sensor_path: "/tetracycle_sensor_data".to_string(),
            control_path: "/tetracycle_control".to_string(),
            request_timeout_seconds: 10,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            upload_interval_seconds: 1,
            control_poll_seconds: 2,
            mirror_interval_seconds: 5,
            error_backoff_seconds: 5,
            read_tick_ms: 50,
        }
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self { ack_timeout_ms: 2000, ack_settle_ms: 500 }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self { error_threshold: 100, reset_cooldown_seconds: 60 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), show_sensor_data: true }
    }
}

impl BridgeConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: BridgeConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load with default fallback
    ///
    /// runs before the subscriber is installed, so it reports on stdout.
    pub fn load_or_default() -> Self {
        let paths = [
            PathBuf::from("config").join("bridge.toml"),
            PathBuf::from("..").join("config").join("bridge.toml"),
        ];

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        println!("[CONFIG] Loaded from {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        println!("[CONFIG] Warning: Failed to load {}: {:#}", path.display(), e);
                    }
                }
            }
        }

        println!("[CONFIG] No config file found - using defaults");
        Self::default()
    }

    /// reject values that would make a loop spin or never run
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.serial.baud_rate == 0 {
            anyhow::bail!("serial.baud_rate must be positive");
        }
        if self.polling.upload_interval_seconds == 0 {
            anyhow::bail!("polling.upload_interval_seconds must be positive");
        }
        if self.polling.control_poll_seconds == 0 {
            anyhow::bail!("polling.control_poll_seconds must be positive");
        }
        if self.polling.error_backoff_seconds == 0 {
            anyhow::bail!("polling.error_backoff_seconds must be positive");
        }
        if self.polling.read_tick_ms == 0 {
            anyhow::bail!("polling.read_tick_ms must be positive");
        }
        if self.command.ack_timeout_ms == 0 {
            anyhow::bail!("command.ack_timeout_ms must be positive");
        }
        Ok(())
    }

    pub fn ack_timing(&self) -> AckTiming {
        AckTiming {
            timeout: Duration::from_millis(self.command.ack_timeout_ms),
            settle: Duration::from_millis(self.command.ack_settle_ms),
            ..AckTiming::default()
        }
    }

    pub fn reconcile_timing(&self) -> ReconcileTiming {
        let mirror = self.polling.mirror_interval_seconds;
        ReconcileTiming {
            poll_interval: Duration::from_secs(self.polling.control_poll_seconds),
            mirror_interval: (mirror > 0).then(|| Duration::from_secs(mirror)),
            error_backoff: Duration::from_secs(self.polling.error_backoff_seconds),
        }
    }

    /// Log configuration summary
    pub fn log_summary(&self) {
        tracing::info!("serial port: {} @ {} baud", self.serial.port, self.serial.baud_rate);
        tracing::info!("reconnect on failed reset: {}", self.serial.reconnect);
        tracing::info!("firebase: {}", self.firebase.database_url);
        tracing::info!(
            "paths: sensors={} control={}",
            self.firebase.sensor_path,
            self.firebase.control_path
        );
        tracing::info!(
            "intervals: upload={}s control={}s mirror={}s",
            self.polling.upload_interval_seconds,
            self.polling.control_poll_seconds,
            self.polling.mirror_interval_seconds
        );
        tracing::info!(
            "link reset: >{} errors, {}s cooldown",
            self.link.error_threshold,
            self.link.reset_cooldown_seconds
        );
    }
}
