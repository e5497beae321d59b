//! Configuration management
//!
//! Optional TOML file; every section and key falls back to its default,
//! so an empty or partial file is valid.
//!
//! ```toml
//! [broker]
//! connect_timeout_ms = 10000   # 0 = wait forever
//! cancel_grace_ms = 500
//!
//! [tcp]
//! nodelay = true
//! connect_timeout_ms = 0       # 0 = OS default
//!
//! [tty]
//! default_baud = 115200
//! read_timeout_ms = 10
//! ```

use crate::constants::{DEFAULT_CANCEL_GRACE_MS, DEFAULT_TTY_BAUD, SERIAL_READ_TIMEOUT_MS};
use crate::error::{Result, StreamError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Default config file name, looked up in the working directory
pub const CONFIG_FILE_NAME: &str = "devstreams.toml";

// =============================================================================
// Application Configuration
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub tcp: TcpConfig,
    pub tty: TtyConfig,
}

// =============================================================================
// Broker
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Deadline for one connection attempt (0 = no timeout)
    pub connect_timeout_ms: u64,

    /// How long a cancelled connector may take to release its resources
    pub cancel_grace_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 0,
            cancel_grace_ms: DEFAULT_CANCEL_GRACE_MS,
        }
    }
}

impl BrokerConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

// =============================================================================
// Transports
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Disable Nagle's algorithm on connected sockets
    pub nodelay: bool,

    /// Socket-level connect bound (0 = OS default)
    pub connect_timeout_ms: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            connect_timeout_ms: 0,
        }
    }
}

impl TcpConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtyConfig {
    /// Rate used to open the device when the target names none
    pub default_baud: u32,

    /// Reader thread poll interval
    pub read_timeout_ms: u64,
}

impl Default for TtyConfig {
    fn default() -> Self {
        Self {
            default_baud: DEFAULT_TTY_BAUD,
            read_timeout_ms: SERIAL_READ_TIMEOUT_MS,
        }
    }
}

// =============================================================================
// Load / Save
// =============================================================================

/// Default config location (`devstreams.toml` in the working directory)
pub fn default_path() -> PathBuf {
    PathBuf::from(CONFIG_FILE_NAME)
}

/// Load and validate a config file
pub fn load_from(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path).map_err(|e| StreamError::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    let config: Config = toml::from_str(&content).map_err(|e| StreamError::ConfigValidation {
        field: "config",
        reason: format!("{}: {}", path.display(), e),
    })?;
    validate(&config)?;
    Ok(config)
}

/// Load config, falling back to defaults on any problem
///
/// A missing file is silent; unreadable or invalid files are logged.
pub fn load(path: &Path) -> Config {
    if !path.exists() {
        return Config::default();
    }
    match load_from(path) {
        Ok(config) => config,
        Err(e) => {
            warn!("{}, using defaults", e);
            Config::default()
        }
    }
}

/// Save config to file
pub fn save(config: &Config, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config).map_err(|e| StreamError::ConfigValidation {
        field: "config",
        reason: e.to_string(),
    })?;
    fs::write(path, content).map_err(|e| StreamError::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })
}

fn validate(config: &Config) -> Result<()> {
    if config.tty.default_baud == 0 {
        return Err(StreamError::ConfigValidation {
            field: "tty.default_baud",
            reason: "must be non-zero".into(),
        });
    }
    if config.tty.read_timeout_ms == 0 {
        return Err(StreamError::ConfigValidation {
            field: "tty.read_timeout_ms",
            reason: "must be non-zero".into(),
        });
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("devstreams-{}-{}.toml", name, std::process::id()))
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();

        assert_eq!(config.broker.connect_timeout(), None);
        assert_eq!(
            config.broker.cancel_grace(),
            Duration::from_millis(DEFAULT_CANCEL_GRACE_MS)
        );
        assert!(config.tcp.nodelay);
        assert_eq!(config.tcp.connect_timeout(), None);
        assert_eq!(config.tty.default_baud, DEFAULT_TTY_BAUD);
        assert_eq!(config.tty.read_timeout_ms, SERIAL_READ_TIMEOUT_MS);
    }

    #[test]
    fn test_config_empty_file() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.broker.connect_timeout_ms, 0);
        assert_eq!(config.tty.default_baud, DEFAULT_TTY_BAUD);
    }

    #[test]
    fn test_config_partial_section() {
        let partial = r#"
[broker]
connect_timeout_ms = 2000

[tty]
default_baud = 9600
"#;
        let config: Config = toml::from_str(partial).unwrap();

        assert_eq!(
            config.broker.connect_timeout(),
            Some(Duration::from_secs(2))
        );
        assert_eq!(config.broker.cancel_grace_ms, DEFAULT_CANCEL_GRACE_MS);
        assert_eq!(config.tty.default_baud, 9600);
        assert_eq!(config.tty.read_timeout_ms, SERIAL_READ_TIMEOUT_MS);
        assert!(config.tcp.nodelay);
    }

    #[test]
    fn test_save_then_load_from() {
        let path = temp_path("roundtrip");
        let mut config = Config::default();
        config.broker.connect_timeout_ms = 1500;
        config.tcp.nodelay = false;

        save(&config, &path).unwrap();
        let restored = load_from(&path).unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(restored.broker.connect_timeout_ms, 1500);
        assert!(!restored.tcp.nodelay);
    }

    #[test]
    fn test_load_from_rejects_zero_baud() {
        let path = temp_path("zero-baud");
        fs::write(&path, "[tty]\ndefault_baud = 0\n").unwrap();
        let result = load_from(&path);
        let _ = fs::remove_file(&path);

        assert!(matches!(
            result,
            Err(StreamError::ConfigValidation {
                field: "tty.default_baud",
                ..
            })
        ));
    }

    #[test]
    fn test_load_falls_back_on_invalid_file() {
        let path = temp_path("invalid");
        fs::write(&path, "[broker\nthis is not toml").unwrap();
        let config = load(&path);
        let _ = fs::remove_file(&path);

        assert_eq!(config.broker.connect_timeout_ms, 0);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = load(Path::new("/nonexistent/devstreams.toml"));
        assert_eq!(config.tty.default_baud, DEFAULT_TTY_BAUD);
    }

    #[test]
    fn test_load_from_missing_file_is_error() {
        assert!(matches!(
            load_from(Path::new("/nonexistent/devstreams.toml")),
            Err(StreamError::ConfigRead { .. })
        ));
    }
}
