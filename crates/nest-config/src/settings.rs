// ABOUTME: Settings for the nest runner, CLI, and transports.
// ABOUTME: Loaded from TOML file with sensible defaults, then layered with NEST_* env overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Connection mode selected on the command line.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Udp,
    Radio,
    Swarm,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Udp => write!(f, "udp"),
            Mode::Radio => write!(f, "radio"),
            Mode::Swarm => write!(f, "swarm"),
        }
    }
}

impl FromStr for Mode {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Mode::Udp),
            "radio" => Ok(Mode::Radio),
            "swarm" => Ok(Mode::Swarm),
            other => Err(SettingsError::InvalidMode(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Invalid mode: {0} (expected udp, radio, or swarm)")]
    InvalidMode(String),

    #[error("Unknown radio channel: {0} (no device mapped in device_by_channel)")]
    UnknownChannel(String),

    #[error("Mode {0} requires at least one radio device")]
    MissingRadioDevice(Mode),

    #[error("Invalid value for {key}: {value}")]
    InvalidOverride { key: String, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Connection mode: udp, radio, or swarm (udp + radio links combined)
    #[serde(default)]
    pub mode: Mode,

    /// Local bind address for the UDP transport
    #[serde(default = "default_udp_bind_address")]
    pub udp_bind_address: String,

    /// Local bind port for the UDP transport (0 = ephemeral)
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,

    /// Resolved radio device paths (radio mode uses the first entry)
    #[serde(default)]
    pub radio_device_paths: Vec<String>,

    /// Baud rate the radio devices are provisioned at (informational)
    #[serde(default = "default_radio_baud_rate")]
    pub radio_baud_rate: u32,

    /// Maximum radio frame size in bytes (header + payload)
    #[serde(default = "default_radio_max_frame_bytes")]
    pub radio_max_frame_bytes: usize,

    /// Map of channel key (e.g. "7") to radio device path
    #[serde(default)]
    pub device_by_channel: HashMap<String, String>,

    /// Agents silent longer than this are expired from the registry
    #[serde(default = "default_agent_silence_timeout_secs")]
    pub agent_silence_timeout_secs: u64,

    /// Retries after the first failed send attempt of a command
    #[serde(default = "default_command_retry_limit")]
    pub command_retry_limit: u32,

    /// Base delay for exponential retry backoff
    #[serde(default = "default_command_backoff_base_ms")]
    pub command_backoff_base_ms: u64,

    /// Upper bound on retry backoff delay
    #[serde(default = "default_command_backoff_cap_ms")]
    pub command_backoff_cap_ms: u64,

    /// Number of delivery worker tasks shared across all agents
    #[serde(default = "default_delivery_worker_pool_size")]
    pub delivery_worker_pool_size: usize,

    /// Allow more than one in-flight command per agent
    #[serde(default)]
    pub pipelining_enabled: bool,

    /// Per-agent outbound queue capacity; exceeding it is backpressure
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    /// Create registry entries for unknown agents on unicast
    #[serde(default)]
    pub auto_register_on_unicast: bool,

    /// Grace period for draining in-flight deliveries on stop
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Timeout for acquiring the underlying medium on transport open
    #[serde(default = "default_transport_open_timeout_ms")]
    pub transport_open_timeout_ms: u64,

    /// Directory for run artifacts (settings snapshot)
    #[serde(default = "default_logs_dir")]
    pub logs_dir: String,

    /// Log level for the process (overridable with --log-level / RUST_LOG)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Load and validate settings without touching hardware
    #[serde(default)]
    pub dry_run: bool,
}

fn default_udp_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_udp_port() -> u16 {
    14550
}

fn default_radio_baud_rate() -> u32 {
    57600
}

fn default_radio_max_frame_bytes() -> usize {
    1024
}

fn default_agent_silence_timeout_secs() -> u64 {
    30
}

fn default_command_retry_limit() -> u32 {
    3
}

fn default_command_backoff_base_ms() -> u64 {
    100
}

fn default_command_backoff_cap_ms() -> u64 {
    5000
}

fn default_delivery_worker_pool_size() -> usize {
    8
}

fn default_outbound_queue_capacity() -> usize {
    64
}

fn default_stop_grace_ms() -> u64 {
    1000
}

fn default_transport_open_timeout_ms() -> u64 {
    5000
}

fn default_logs_dir() -> String {
    "~/.local/state/nest".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        // serde defaults and Default must agree; an empty TOML table is the baseline
        toml::from_str("").expect("empty settings table must deserialize")
    }
}

impl Settings {
    /// Load settings from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse settings from {}", path.display()))?;
        Ok(settings)
    }

    /// Save settings to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize settings")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create settings directory {}", parent.display())
            })?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write settings to {}", path.display()))?;
        Ok(())
    }

    /// Get the default settings file path (~/.config/nest/nest.toml)
    pub fn default_path() -> PathBuf {
        std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|h| h.join(".config"))
                    .unwrap_or_else(|| PathBuf::from("."))
            })
            .join("nest")
            .join("nest.toml")
    }

    /// Expand ~ in the logs directory path
    pub fn logs_dir_expanded(&self) -> PathBuf {
        shellexpand::tilde(&self.logs_dir).into_owned().into()
    }

    /// Resolve a channel key (e.g. "7") to a radio device path
    pub fn resolve_channel(&self, key: &str) -> Result<String, SettingsError> {
        self.device_by_channel
            .get(key)
            .cloned()
            .ok_or_else(|| SettingsError::UnknownChannel(key.to_string()))
    }

    /// Check cross-field constraints before the runner consumes us
    pub fn validate(&self) -> Result<(), SettingsError> {
        match self.mode {
            Mode::Udp => Ok(()),
            Mode::Radio | Mode::Swarm => {
                if self.radio_device_paths.is_empty() {
                    Err(SettingsError::MissingRadioDevice(self.mode))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Layer NEST_* environment variables over the file-loaded values
    pub fn apply_env_overrides(&mut self) -> Result<(), SettingsError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, get: F) -> Result<(), SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: FromStr>(key: &str, value: String) -> Result<T, SettingsError> {
            value.parse().map_err(|_| SettingsError::InvalidOverride {
                key: key.to_string(),
                value,
            })
        }

        if let Some(v) = get("NEST_MODE") {
            self.mode = v.parse()?;
        }
        if let Some(v) = get("NEST_UDP_BIND_ADDRESS") {
            self.udp_bind_address = v;
        }
        if let Some(v) = get("NEST_UDP_PORT") {
            self.udp_port = parsed("NEST_UDP_PORT", v)?;
        }
        if let Some(v) = get("NEST_RADIO_DEVICE") {
            self.radio_device_paths = vec![v];
        }
        if let Some(v) = get("NEST_RADIO_BAUD") {
            self.radio_baud_rate = parsed("NEST_RADIO_BAUD", v)?;
        }
        if let Some(v) = get("NEST_SILENCE_TIMEOUT_SECS") {
            self.agent_silence_timeout_secs = parsed("NEST_SILENCE_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = get("NEST_RETRY_LIMIT") {
            self.command_retry_limit = parsed("NEST_RETRY_LIMIT", v)?;
        }
        if let Some(v) = get("NEST_BACKOFF_BASE_MS") {
            self.command_backoff_base_ms = parsed("NEST_BACKOFF_BASE_MS", v)?;
        }
        if let Some(v) = get("NEST_BACKOFF_CAP_MS") {
            self.command_backoff_cap_ms = parsed("NEST_BACKOFF_CAP_MS", v)?;
        }
        if let Some(v) = get("NEST_WORKER_POOL_SIZE") {
            self.delivery_worker_pool_size = parsed("NEST_WORKER_POOL_SIZE", v)?;
        }
        if let Some(v) = get("NEST_PIPELINING") {
            self.pipelining_enabled = parsed("NEST_PIPELINING", v)?;
        }
        if let Some(v) = get("NEST_QUEUE_CAPACITY") {
            self.outbound_queue_capacity = parsed("NEST_QUEUE_CAPACITY", v)?;
        }
        if let Some(v) = get("NEST_LOG_LEVEL") {
            self.log_level = v;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_settings_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            mode = "radio"
            radio_device_paths = ["/dev/ttyUSB0"]
            udp_port = 14551
            command_retry_limit = 5

            [device_by_channel]
            "7" = "/dev/ttyUSB0"
            "8" = "/dev/ttyUSB1"
        "#
        )
        .unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.mode, Mode::Radio);
        assert_eq!(settings.udp_port, 14551);
        assert_eq!(settings.command_retry_limit, 5);
        assert_eq!(settings.resolve_channel("8").unwrap(), "/dev/ttyUSB1");
    }

    #[test]
    fn test_defaults_from_empty_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "").unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.mode, Mode::Udp);
        assert_eq!(settings.udp_bind_address, "0.0.0.0");
        assert_eq!(settings.command_retry_limit, 3);
        assert!(!settings.pipelining_enabled);
        assert_eq!(settings.outbound_queue_capacity, 64);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nest.toml");

        let mut settings = Settings::default();
        settings.mode = Mode::Swarm;
        settings.radio_device_paths = vec!["/dev/ttyUSB0".to_string(), "/dev/ttyUSB1".to_string()];
        settings.pipelining_enabled = true;

        settings.save(&path).unwrap();
        let loaded = Settings::load(&path).unwrap();

        assert_eq!(loaded.mode, Mode::Swarm);
        assert_eq!(loaded.radio_device_paths.len(), 2);
        assert!(loaded.pipelining_enabled);
    }

    #[test]
    fn test_validate_radio_requires_device() {
        let mut settings = Settings::default();
        settings.mode = Mode::Radio;
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::MissingRadioDevice(Mode::Radio))
        ));

        settings.radio_device_paths = vec!["/dev/ttyUSB0".to_string()];
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_udp_needs_no_device() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_resolve_unknown_channel() {
        let settings = Settings::default();
        assert!(matches!(
            settings.resolve_channel("9"),
            Err(SettingsError::UnknownChannel(_))
        ));
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("udp".parse::<Mode>().unwrap(), Mode::Udp);
        assert_eq!("RADIO".parse::<Mode>().unwrap(), Mode::Radio);
        assert_eq!("swarm".parse::<Mode>().unwrap(), Mode::Swarm);
        assert!(matches!(
            "serial".parse::<Mode>(),
            Err(SettingsError::InvalidMode(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut settings = Settings::default();
        settings
            .apply_overrides(|key| match key {
                "NEST_MODE" => Some("radio".to_string()),
                "NEST_UDP_PORT" => Some("9000".to_string()),
                "NEST_RADIO_DEVICE" => Some("/dev/ttyACM0".to_string()),
                "NEST_PIPELINING" => Some("true".to_string()),
                _ => None,
            })
            .unwrap();

        assert_eq!(settings.mode, Mode::Radio);
        assert_eq!(settings.udp_port, 9000);
        assert_eq!(settings.radio_device_paths, vec!["/dev/ttyACM0".to_string()]);
        assert!(settings.pipelining_enabled);
    }

    #[test]
    fn test_env_override_rejects_bad_value() {
        let mut settings = Settings::default();
        let err = settings
            .apply_overrides(|key| match key {
                "NEST_UDP_PORT" => Some("not-a-port".to_string()),
                _ => None,
            })
            .unwrap_err();
        assert!(matches!(err, SettingsError::InvalidOverride { .. }));
    }
}
