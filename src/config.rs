//! # Simulation Configuration
//!
//! Every key is optional; a missing file section falls back to the defaults
//! below.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [simulation]
//! machines = 3
//! duration_secs = 60
//! seed = 42
//!
//! [simulation.clock_rate]
//! min = 1
//! max = 6
//!
//! [network]
//! host = "127.0.0.1"
//! base_port = 5000
//!
//! [logging]
//! dir = "logs"
//! level = "info"
//! ```
//!
//! `base_port = 0` makes every machine bind an OS-assigned port instead of
//! `base_port + id`.

// src/config.rs - Single configuration file
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration for one simulation run.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Machine count, run length and randomness.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulationConfig {
    #[serde(default = "default_machines")]
    pub machines: u32,
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
    #[serde(default)]
    pub clock_rate: ClockRateConfig,
    /// Fixed seed for rate and event draws. Absent means OS entropy.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            machines: default_machines(),
            duration_secs: default_duration_secs(),
            clock_rate: ClockRateConfig::default(),
            seed: None,
        }
    }
}

/// Inclusive bounds for per-machine tick rates, in ticks per second.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct ClockRateConfig {
    #[serde(default = "default_min_rate")]
    pub min: u32,
    #[serde(default = "default_max_rate")]
    pub max: u32,
}

impl Default for ClockRateConfig {
    fn default() -> Self {
        Self {
            min: default_min_rate(),
            max: default_max_rate(),
        }
    }
}

/// Listener addresses and connection behaviour.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_setup_timeout_ms")]
    pub setup_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            base_port: default_base_port(),
            connect_attempts: default_connect_attempts(),
            connect_backoff_ms: default_connect_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            setup_timeout_ms: default_setup_timeout_ms(),
        }
    }
}

impl NetworkConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }
}

/// Where event logs go and how chatty the process log is.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.simulation.duration_secs)
    }

    /// Reject configurations the controller cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sim = &self.simulation;
        if sim.machines < 2 {
            return Err(ConfigError::Invalid(format!(
                "simulation.machines must be >= 2, got {}",
                sim.machines
            )));
        }
        if sim.duration_secs == 0 {
            return Err(ConfigError::Invalid("simulation.duration_secs must be > 0".to_string()));
        }
        if sim.clock_rate.min < 1 {
            return Err(ConfigError::Invalid("simulation.clock_rate.min must be >= 1".to_string()));
        }
        if sim.clock_rate.max < sim.clock_rate.min {
            return Err(ConfigError::Invalid(format!(
                "simulation.clock_rate.max ({}) must be >= min ({})",
                sim.clock_rate.max, sim.clock_rate.min
            )));
        }
        let net = &self.network;
        if net.host.trim().is_empty() {
            return Err(ConfigError::Invalid("network.host cannot be empty".to_string()));
        }
        if net.connect_attempts == 0 {
            return Err(ConfigError::Invalid("network.connect_attempts must be >= 1".to_string()));
        }
        let last_port = u64::from(net.base_port) + u64::from(sim.machines) - 1;
        if net.base_port != 0 && last_port > u64::from(u16::MAX) {
            return Err(ConfigError::Invalid(format!(
                "port range {}..={} exceeds 65535",
                net.base_port, last_port
            )));
        }
        Ok(())
    }
}

// Default value functions
fn default_machines() -> u32 { 3 }
fn default_duration_secs() -> u64 { 60 }
fn default_min_rate() -> u32 { 1 }
fn default_max_rate() -> u32 { 6 }
fn default_host() -> String { "127.0.0.1".to_string() }
fn default_base_port() -> u16 { 5000 }
fn default_connect_attempts() -> u32 { 5 }
fn default_connect_backoff_ms() -> u64 { 100 }
fn default_max_backoff_ms() -> u64 { 2000 }
fn default_write_timeout_ms() -> u64 { 1000 }
fn default_setup_timeout_ms() -> u64 { 5000 }
fn default_log_dir() -> PathBuf { PathBuf::from("logs") }
fn default_log_level() -> String { "info".to_string() }

pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                Err(ConfigError::Toml(e))
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            Err(ConfigError::Io(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.simulation.machines, 3);
        assert_eq!(config.simulation.duration_secs, 60);
        assert_eq!(config.simulation.clock_rate, ClockRateConfig { min: 1, max: 6 });
        assert_eq!(config.simulation.seed, None);
        assert_eq!(config.network.host, "127.0.0.1");
        assert_eq!(config.network.base_port, 5000);
        assert_eq!(config.logging.dir, PathBuf::from("logs"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_success() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("test_config.toml");
        let mut file = File::create(&file_path).unwrap();
        writeln!(file, "[simulation]\nmachines = 5\nseed = 7\n[network]\nbase_port = 6000").unwrap();
        file.flush().unwrap();
        let config = load_config(file_path.to_str().unwrap()).unwrap();
        assert_eq!(config.simulation.machines, 5);
        assert_eq!(config.simulation.seed, Some(7));
        assert_eq!(config.network.base_port, 6000);
        // Defaults for missing fields
        assert_eq!(config.simulation.duration_secs, 60);
        assert_eq!(config.network.write_timeout_ms, 1000);
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config("nonexistent_file.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("bad.toml");
        let mut file = File::create(&file_path).unwrap();
        writeln!(file, "not a valid toml").unwrap();
        file.flush().unwrap();
        let result = load_config(file_path.to_str().unwrap());
        assert!(matches!(result, Err(ConfigError::Toml(_))));
    }

    #[test]
    fn test_port_range_checks_do_not_overflow() {
        let mut config = Config::default();
        config.simulation.machines = u32::MAX;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.simulation.machines = 3;
        config.network.base_port = 65533;
        assert!(config.validate().is_ok());
        config.network.base_port = 65534;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        // Ephemeral ports never run out of range
        config.simulation.machines = u32::MAX;
        config.network.base_port = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_clock_rate_table_parsing() {
        let toml = r#"
        [simulation.clock_rate]
        min = 2
        max = 4
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.simulation.clock_rate.min, 2);
        assert_eq!(config.simulation.clock_rate.max, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.simulation.machines = 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.simulation.duration_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.simulation.clock_rate = ClockRateConfig { min: 0, max: 3 };
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.simulation.clock_rate = ClockRateConfig { min: 5, max: 2 };
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.network.base_port = 65535;
        assert!(config.validate().is_err());

        // Ephemeral ports never overflow
        config.network.base_port = 0;
        assert!(config.validate().is_ok());
    }
}
