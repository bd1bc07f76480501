//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/classync/config.toml)
//! 3. Environment variables (CLASSYNC_* prefix)
//!
//! Environment variables take precedence over config file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable prefix
const ENV_PREFIX: &str = "CLASSYNC";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for the local cache database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Base URL of the backend REST API
    #[serde(default)]
    pub api_url: Option<String>,

    /// Bearer token used when no external credential store is wired in
    #[serde(default)]
    pub api_token: Option<String>,

    /// Whether the background scheduler should run
    #[serde(default = "default_true")]
    pub sync_enabled: bool,

    /// Seconds between scheduler ticks
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Upper bound for a single backend request
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// First retry delay after a retryable upload failure
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Retry delay ceiling
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,

    /// Attempts before a retryable failure is demoted to failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// How long an in-flight request may finish after shutdown
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Page size requested from list endpoints
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Log file path (defaults to stderr when unset)
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            api_url: None,
            api_token: None,
            sync_enabled: true,
            sync_interval_secs: default_sync_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_secs: default_backoff_cap_secs(),
            max_attempts: default_max_attempts(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            page_size: default_page_size(),
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (CLASSYNC_DATA_DIR, CLASSYNC_API_URL, ...)
    /// 2. Config file (~/.config/classync/config.toml or CLASSYNC_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration, preferring an explicit path from the command line
    pub fn load_with_cli_override(path: Option<&PathBuf>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var(format!("{}_API_URL", ENV_PREFIX)) {
            self.api_url = if val.is_empty() { None } else { Some(val) };
        }

        if let Ok(val) = std::env::var(format!("{}_TOKEN", ENV_PREFIX)) {
            self.api_token = if val.is_empty() { None } else { Some(val) };
        }

        if let Ok(val) = std::env::var(format!("{}_SYNC_ENABLED", ENV_PREFIX)) {
            self.sync_enabled = val.eq_ignore_ascii_case("true") || val == "1";
        }

        if let Ok(val) = std::env::var(format!("{}_SYNC_INTERVAL", ENV_PREFIX)) {
            if let Ok(secs) = val.parse() {
                self.sync_interval_secs = secs;
            }
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to a file
    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Set a single value by key, as used by `classync config set`
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        fn optional(value: &str) -> Option<String> {
            if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            }
        }

        match key {
            "data_dir" => self.data_dir = PathBuf::from(value),
            "api_url" => self.api_url = optional(value),
            "api_token" => self.api_token = optional(value),
            "sync_enabled" => {
                self.sync_enabled = value.eq_ignore_ascii_case("true") || value == "1"
            }
            "sync_interval_secs" => self.sync_interval_secs = parse_number(key, value)?,
            "request_timeout_secs" => self.request_timeout_secs = parse_number(key, value)?,
            "backoff_base_ms" => self.backoff_base_ms = parse_number(key, value)?,
            "backoff_cap_secs" => self.backoff_cap_secs = parse_number(key, value)?,
            "max_attempts" => self.max_attempts = parse_number(key, value)?,
            "shutdown_grace_secs" => self.shutdown_grace_secs = parse_number(key, value)?,
            "page_size" => self.page_size = parse_number(key, value)?,
            "log_file" => self.log_file = optional(value).map(PathBuf::from),
            _ => anyhow::bail!("Unknown configuration key: {}", key),
        }
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with CLASSYNC_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("classync")
            .join("config.toml")
    }

    /// Get the path to the SQLite database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("classync.db")
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid value for {}: {}", key, value))
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("classync")
}

fn default_true() -> bool {
    true
}

fn default_sync_interval_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_secs() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    6
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_page_size() -> u32 {
    100
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Serializes tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "CLASSYNC_DATA_DIR",
        "CLASSYNC_API_URL",
        "CLASSYNC_TOKEN",
        "CLASSYNC_SYNC_ENABLED",
        "CLASSYNC_SYNC_INTERVAL",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.sync_enabled);
        assert!(config.api_url.is_none());
        assert!(config.data_dir.ends_with("classync"));
        assert_eq!(config.max_attempts, 6);
        assert_eq!(config.sync_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_sqlite_path() {
        let config = Config::default();
        assert!(config.sqlite_path().ends_with("classync.db"));
    }

    #[test]
    fn test_env_override_data_dir() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("CLASSYNC_DATA_DIR", "/tmp/classync-test");
        config.apply_env_overrides();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/classync-test"));
    }

    #[test]
    fn test_env_override_api_url() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("CLASSYNC_API_URL", "https://school.example.com/api");
        config.apply_env_overrides();
        assert_eq!(
            config.api_url.as_deref(),
            Some("https://school.example.com/api")
        );

        // Empty string clears it
        env::set_var("CLASSYNC_API_URL", "");
        config.apply_env_overrides();
        assert!(config.api_url.is_none());
    }

    #[test]
    fn test_env_override_sync_settings() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("CLASSYNC_SYNC_ENABLED", "false");
        env::set_var("CLASSYNC_SYNC_INTERVAL", "15");
        config.apply_env_overrides();
        assert!(!config.sync_enabled);
        assert_eq!(config.sync_interval_secs, 15);

        // Unparseable interval keeps the previous value
        env::set_var("CLASSYNC_SYNC_INTERVAL", "soon");
        config.apply_env_overrides();
        assert_eq!(config.sync_interval_secs, 15);
    }

    #[test]
    fn test_load_from_str_fills_defaults() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            data_dir = "/custom/data"
            api_url = "http://localhost:5000/api"
            max_attempts = 3
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.api_url.as_deref(), Some("http://localhost:5000/api"));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.page_size, 100);
        assert!(config.sync_enabled);
    }

    #[test]
    fn test_set_value() {
        let mut config = Config::default();
        config.set_value("api_url", "http://x").unwrap();
        config.set_value("max_attempts", "4").unwrap();
        config.set_value("sync_enabled", "0").unwrap();

        assert_eq!(config.api_url.as_deref(), Some("http://x"));
        assert_eq!(config.max_attempts, 4);
        assert!(!config.sync_enabled);

        assert!(config.set_value("max_attempts", "many").is_err());
        assert!(config.set_value("favorite_color", "blue").is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let _guard = EnvGuard::new(ENV_VARS);
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.data_dir = dir.path().join("data");
        config.api_url = Some("http://localhost:5000/api".to_string());
        config.save_to(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded.api_url, config.api_url);
        assert_eq!(loaded.data_dir, config.data_dir);
        assert!(loaded.data_dir.exists());
    }
}
