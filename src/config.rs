//! Configuration file parser (`feedsync.toml`).
//!
//! The file is optional. A missing or empty file yields `Config::default()`.
//! Unknown keys are accepted but logged as a warning, since they are
//! usually typos.
use reqwest::redirect::Policy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::feed::fetcher::MAX_RETRIES;
use crate::feed::FetchSettings;
use crate::service::SyncSettings;
use crate::util::HostPolicy;

const MAX_REDIRECTS: usize = 5;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration
// ============================================================================

/// Top-level configuration. Every key is optional.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite file. `None` means the platform default chosen by the CLI.
    pub database_path: Option<PathBuf>,

    /// Per-request timeout, applied to the response headers and the body separately.
    pub request_timeout_secs: u64,

    pub max_feed_size_bytes: usize,

    /// Retries for 429, 5xx and truncated responses (at most 10).
    pub max_retries: u32,

    /// First backoff delay; doubles on each retry.
    pub retry_base_delay_ms: u64,

    pub max_concurrent_fetches: usize,

    /// Look up a feed image in the background after a sync.
    pub resolve_icons: bool,

    pub user_agent: String,

    /// Accept feed URIs on loopback and private networks.
    pub allow_private_hosts: bool,
}

impl Default for Config {
    fn default() -> Self {
        let fetch = FetchSettings::default();
        let sync = SyncSettings::default();
        Self {
            database_path: None,
            request_timeout_secs: fetch.timeout.as_secs(),
            max_feed_size_bytes: fetch.max_size,
            max_retries: fetch.max_retries,
            retry_base_delay_ms: fetch.retry_base_delay.as_millis() as u64,
            max_concurrent_fetches: sync.max_concurrent_fetches,
            resolve_icons: sync.resolve_icons,
            user_agent: format!("feedsync/{}", env!("CARGO_PKG_VERSION")),
            allow_private_hosts: false,
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 9] = [
        "database_path",
        "request_timeout_secs",
        "max_feed_size_bytes",
        "max_retries",
        "retry_base_delay_ms",
        "max_concurrent_fetches",
        "resolve_icons",
        "user_agent",
        "allow_private_hosts",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
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
                // Deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        Self::from_toml(&content)
    }

    /// Parse configuration text. Blank text yields the defaults.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        tracing::debug!(?config, "Loaded configuration");
        Ok(config)
    }

    pub fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            timeout: Duration::from_secs(self.request_timeout_secs.max(1)),
            max_size: self.max_feed_size_bytes,
            max_retries: self.max_retries.min(MAX_RETRIES),
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            max_concurrent_fetches: self.max_concurrent_fetches.max(1),
            resolve_icons: self.resolve_icons,
        }
    }

    pub fn host_policy(&self) -> HostPolicy {
        if self.allow_private_hosts {
            HostPolicy::AllowPrivate
        } else {
            HostPolicy::PublicOnly
        }
    }

    /// HTTP client shared by every fetch: configured user agent, bounded
    /// redirects with loop detection, keepalive.
    pub fn build_client(&self) -> Result<reqwest::Client, reqwest::Error> {
        reqwest::Client::builder()
            .user_agent(&self.user_agent)
            .redirect(redirect_policy())
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
    }
}

fn redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error(format!("Too many redirects (max {MAX_REDIRECTS})"));
        }

        let url = attempt.url();
        if attempt.previous().iter().any(|prev| prev.as_str() == url.as_str()) {
            return attempt.error("Redirect loop detected");
        }

        tracing::debug!(
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );
        attempt.follow()
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn temp_config(name: &str, content: &str) -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!("feedsync_config_test_{name}"));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("feedsync.toml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.database_path, None);
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.max_feed_size_bytes, 10 * 1024 * 1024);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_base_delay_ms, 1000);
        assert_eq!(config.max_concurrent_fetches, 4);
        assert!(config.resolve_icons);
        assert!(config.user_agent.starts_with("feedsync/"));
        assert!(!config.allow_private_hosts);
    }

    #[test]
    fn test_missing_file_returns_default() {
        let config = Config::load(Path::new("/tmp/feedsync_nonexistent_config.toml")).unwrap();
        assert_eq!(config.request_timeout_secs, 30);
    }

    #[test]
    fn test_whitespace_only_returns_default() {
        let (dir, path) = temp_config("whitespace", "   \n  \n  ");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.max_retries, 3);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let config = Config::from_toml("max_retries = 0\n").unwrap();
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.request_timeout_secs, 30);
        assert!(config.resolve_icons);
    }

    #[test]
    fn test_full_config() {
        let content = r#"
database_path = "/var/lib/feedsync/feeds.db"
request_timeout_secs = 10
max_feed_size_bytes = 2048
max_retries = 1
retry_base_delay_ms = 250
max_concurrent_fetches = 8
resolve_icons = false
user_agent = "test-agent/1.0"
allow_private_hosts = true
"#;
        let (dir, path) = temp_config("full", content);
        let config = Config::load(&path).unwrap();

        assert_eq!(
            config.database_path.as_deref(),
            Some(Path::new("/var/lib/feedsync/feeds.db"))
        );
        assert_eq!(config.user_agent, "test-agent/1.0");
        assert_eq!(config.host_policy(), HostPolicy::AllowPrivate);

        let fetch = config.fetch_settings();
        assert_eq!(fetch.timeout, Duration::from_secs(10));
        assert_eq!(fetch.max_size, 2048);
        assert_eq!(fetch.max_retries, 1);
        assert_eq!(fetch.retry_base_delay, Duration::from_millis(250));

        let sync = config.sync_settings();
        assert_eq!(sync.max_concurrent_fetches, 8);
        assert!(!sync.resolve_icons);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_zero_values_are_clamped() {
        let config =
            Config::from_toml("request_timeout_secs = 0\nmax_concurrent_fetches = 0\n").unwrap();
        assert_eq!(config.fetch_settings().timeout, Duration::from_secs(1));
        assert_eq!(config.sync_settings().max_concurrent_fetches, 1);
    }

    #[test]
    fn test_retry_count_is_capped() {
        let config = Config::from_toml("max_retries = 4000000000\nretry_base_delay_ms = 0\n").unwrap();
        assert_eq!(config.fetch_settings().max_retries, 10);
        assert_eq!(config.fetch_settings().retry_base_delay, Duration::ZERO);
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let err = Config::from_toml("this is not [valid toml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let config = Config::from_toml("max_retries = 2\ntotally_fake_key = 42\n").unwrap();
        assert_eq!(config.max_retries, 2);
    }

    #[test]
    fn test_wrong_type_returns_error() {
        assert!(Config::from_toml("resolve_icons = \"yes\"\n").is_err());
    }

    #[test]
    fn test_too_large_file_rejected() {
        let (dir, path) = temp_config("too_large", &"a".repeat(1_048_577));
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
        assert!(err.to_string().contains("too large"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_build_client() {
        assert!(Config::default().build_client().is_ok());
    }
}
