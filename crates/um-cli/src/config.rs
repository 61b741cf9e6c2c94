//! Configuration loading and management.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use um_core::UserId;

/// Application configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the database file.
    pub database_path: PathBuf,
    /// Base URL of the remote collector.
    #[serde(default)]
    pub collector_url: Option<String>,
    /// Bearer credential for the collector.
    #[serde(default)]
    pub api_key: Option<String>,
    /// User identifier reported with every batch.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Seconds between accounting ticks.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Seconds between reconciliation passes.
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    /// Upper bound on a single collector request, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Everything needed to reach the collector.
#[derive(Clone, PartialEq, Eq)]
pub struct CollectorSettings {
    pub url: String,
    pub api_key: String,
    pub user_id: UserId,
}

impl fmt::Debug for CollectorSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectorSettings")
            .field("url", &self.url)
            .field("api_key", &"[REDACTED]")
            .field("user_id", &self.user_id)
            .finish()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_path", &self.database_path)
            .field("collector_url", &self.collector_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("user_id", &self.user_id)
            .field("tick_interval_secs", &self.tick_interval_secs)
            .field("flush_interval_secs", &self.flush_interval_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

const fn default_tick_interval_secs() -> u64 {
    15
}

const fn default_flush_interval_secs() -> u64 {
    60
}

const fn default_request_timeout_secs() -> u64 {
    um_core::DEFAULT_FLUSH_TIMEOUT.as_secs()
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: data_dir.join("usage.db"),
            collector_url: None,
            api_key: None,
            user_id: None,
            tick_interval_secs: default_tick_interval_secs(),
            flush_interval_secs: default_flush_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Config {
    /// Loads configuration, optionally from a specific file.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        // Load from default config location
        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        // Load from specified config file
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Load from environment variables (UM_*)
        figment = figment.merge(Env::prefixed("UM_"));

        figment.extract()
    }

    /// Collector settings, if all three values are present and non-blank.
    ///
    /// A blank or invalid user ID counts as absent.
    #[must_use]
    pub fn collector(&self) -> Option<CollectorSettings> {
        let url = non_blank(self.collector_url.as_deref())?;
        let api_key = non_blank(self.api_key.as_deref())?;
        let user_id = UserId::new(non_blank(self.user_id.as_deref())?).ok()?;
        Some(CollectorSettings {
            url: url.to_string(),
            api_key: api_key.to_string(),
            user_id,
        })
    }

    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Returns the platform-specific config directory for um.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("um"))
}

/// Returns the platform-specific data directory for um.
///
/// On Linux: `~/.local/share/um`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("um"))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    #[test]
    fn test_dirs_data_path_ends_with_um() {
        let path = dirs_data_path().unwrap();
        assert_eq!(path.file_name().unwrap(), "um");
    }

    #[test]
    fn test_default_config_uses_data_dir_for_db() {
        let config = Config::default();
        let data_dir = dirs_data_path().unwrap();
        assert_eq!(config.database_path, data_dir.join("usage.db"));
        assert_eq!(config.tick_interval(), Duration::from_secs(15));
        assert_eq!(config.flush_interval(), Duration::from_secs(60));
        assert!(config.collector().is_none());
    }

    #[test]
    fn test_config_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
database_path = "/tmp/um-test.db"
collector_url = "http://127.0.0.1:8000"
api_key = "secret"
user_id = "u1"
flush_interval_secs = 120
"#
        )
        .unwrap();

        let config = Config::load_from(Some(file.path())).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/um-test.db"));
        assert_eq!(config.flush_interval(), Duration::from_secs(120));
        assert_eq!(config.tick_interval(), Duration::from_secs(15));

        let collector = config.collector().unwrap();
        assert_eq!(collector.url, "http://127.0.0.1:8000");
        assert_eq!(collector.user_id.as_str(), "u1");
    }

    fn with_collector(url: Option<&str>, api_key: Option<&str>, user_id: Option<&str>) -> Config {
        Config {
            collector_url: url.map(String::from),
            api_key: api_key.map(String::from),
            user_id: user_id.map(String::from),
            ..Config::default()
        }
    }

    #[test]
    fn test_collector_requires_all_settings() {
        let url = Some("http://127.0.0.1:8000");
        assert!(with_collector(url, Some("k"), Some("u1")).collector().is_some());
        assert!(with_collector(None, Some("k"), Some("u1")).collector().is_none());
        assert!(with_collector(url, None, Some("u1")).collector().is_none());
        assert!(with_collector(url, Some("k"), None).collector().is_none());
        assert!(with_collector(url, Some("  "), Some("u1")).collector().is_none());
        assert!(with_collector(url, Some("k"), Some("")).collector().is_none());
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let config = with_collector(Some("http://127.0.0.1:8000"), Some("secret-key"), Some("u1"));
        let debug = format!("{config:?}");
        assert!(!debug.contains("secret-key"));
        assert!(debug.contains("[REDACTED]"));

        let collector = format!("{:?}", config.collector().unwrap());
        assert!(!collector.contains("secret-key"));
    }

    #[test]
    fn test_zero_intervals_are_clamped() {
        let config = Config {
            tick_interval_secs: 0,
            flush_interval_secs: 0,
            request_timeout_secs: 0,
            ..Config::default()
        };
        assert_eq!(config.tick_interval(), Duration::from_secs(1));
        assert_eq!(config.flush_interval(), Duration::from_secs(1));
        assert_eq!(config.request_timeout(), Duration::from_secs(1));
    }
}
