//! Configuration file parser for ~/.config/pressy/config.toml.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are ignored by serde (with `deny_unknown_fields` off),
//! though we log a warning when the file contains potential typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::feed::RefreshOptions;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// Missing keys fall back to `Default::default()`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where the feed collection is persisted. Defaults to
    /// `~/.config/pressy/feeds.json` when unset.
    pub feeds_file: Option<PathBuf>,

    /// Seconds to wait for background updates at shutdown. 0 = wait forever.
    pub shutdown_timeout_secs: u64,

    /// Maximum number of feeds refreshed concurrently.
    pub refresh_concurrency: usize,

    /// Per-request timeout for feed refresh, in seconds.
    pub request_timeout_secs: u64,

    /// Pending request capacity of the serving worker.
    pub worker_queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            feeds_file: None,
            shutdown_timeout_secs: 0,
            refresh_concurrency: 10,
            request_timeout_secs: 30,
            worker_queue_depth: 64,
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 5] = [
        "feeds_file",
        "shutdown_timeout_secs",
        "refresh_concurrency",
        "request_timeout_secs",
        "worker_queue_depth",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → silently accepted (serde default behavior), logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check size before reading so a corrupted file can't exhaust memory
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Resolve the feeds file, falling back to `feeds.json` in `config_dir`.
    pub fn feeds_path(&self, config_dir: &Path) -> PathBuf {
        self.feeds_file
            .clone()
            .unwrap_or_else(|| config_dir.join("feeds.json"))
    }

    pub fn shutdown_timeout(&self) -> Option<Duration> {
        match self.shutdown_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn refresh_options(&self) -> RefreshOptions {
        RefreshOptions {
            concurrency: self.refresh_concurrency.max(1),
            request_timeout: Duration::from_secs(self.request_timeout_secs.max(1)),
            ..RefreshOptions::default()
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(name: &str, content: &str) -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.feeds_file.is_none());
        assert_eq!(config.shutdown_timeout_secs, 0);
        assert_eq!(config.refresh_concurrency, 10);
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.worker_queue_depth, 64);
    }

    #[test]
    fn test_missing_file_returns_default() {
        let path = Path::new("/tmp/pressy_test_nonexistent_config.toml");
        let config = Config::load(path).unwrap();
        assert_eq!(config.refresh_concurrency, 10);
    }

    #[test]
    fn test_whitespace_only_file_returns_default() {
        let (dir, path) = write_config("pressy_config_test_whitespace", "   \n  \n  ");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.worker_queue_depth, 64);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let (dir, path) = write_config("pressy_config_test_partial", "shutdown_timeout_secs = 15\n");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.shutdown_timeout_secs, 15);
        assert_eq!(config.refresh_concurrency, 10); // default
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_full_config() {
        let content = r#"
feeds_file = "/var/lib/pressy/feeds.json"
shutdown_timeout_secs = 20
refresh_concurrency = 3
request_timeout_secs = 5
worker_queue_depth = 8
"#;
        let (dir, path) = write_config("pressy_config_test_full", content);
        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.feeds_file.as_deref(),
            Some(Path::new("/var/lib/pressy/feeds.json"))
        );
        assert_eq!(config.shutdown_timeout(), Some(Duration::from_secs(20)));
        let options = config.refresh_options();
        assert_eq!(options.concurrency, 3);
        assert_eq!(options.request_timeout, Duration::from_secs(5));
        assert_eq!(config.worker_queue_depth, 8);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_zero_timeout_means_wait_forever() {
        assert_eq!(Config::default().shutdown_timeout(), None);
    }

    #[test]
    fn test_feeds_path_fallback() {
        let config = Config::default();
        assert_eq!(
            config.feeds_path(Path::new("/home/u/.config/pressy")),
            PathBuf::from("/home/u/.config/pressy/feeds.json")
        );
    }

    #[test]
    fn test_zero_concurrency_clamped() {
        let config = Config {
            refresh_concurrency: 0,
            request_timeout_secs: 0,
            ..Config::default()
        };
        let options = config.refresh_options();
        assert_eq!(options.concurrency, 1);
        assert_eq!(options.request_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let (dir, path) = write_config("pressy_config_test_invalid", "this is not [valid toml");
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let content = r#"
refresh_concurrency = 4
totally_fake_key = "should not fail"
"#;
        let (dir, path) = write_config("pressy_config_test_unknown", content);
        let config = Config::load(&path).unwrap();
        assert_eq!(config.refresh_concurrency, 4);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_wrong_type_returns_error() {
        let (dir, path) = write_config("pressy_config_test_wrongtype", "refresh_concurrency = \"many\"\n");
        assert!(Config::load(&path).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_too_large_file_rejected() {
        let (dir, path) = write_config("pressy_config_test_too_large", &"a".repeat(1_048_577));
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
        assert!(err.to_string().contains("too large"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
