//! Configuration for the fetch pipeline.
//!
//! [`FetchConfig`] is plain data: it deserializes from JSON with every field
//! optional (missing fields take their defaults) and is checked once by
//! [`FetchConfig::validate`] when a fetcher is built.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::user_agent;

/// Default MIME type used when nothing better is known.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Default in-memory threshold before a body spills to disk (1 MiB).
pub const DEFAULT_MAX_CACHED_CONTENT_SIZE: usize = 1024 * 1024;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A numeric setting is outside its allowed range.
    #[error("invalid config value for `{field}`: {value} (expected {expected})")]
    OutOfRange {
        /// Setting name.
        field: &'static str,
        /// Rejected value.
        value: u64,
        /// Human readable allowed range.
        expected: &'static str,
    },

    /// The configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Config file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for [`FetchConfig`].
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A header sent with every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    /// Header name.
    pub name: String,
    /// Header value.
    pub value: String,
}

impl RequestHeader {
    /// Creates a header entry.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// A header is usable only with a non-blank name.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.name.trim().is_empty()
    }
}

/// Basic-auth credentials scoped to a host (and optionally a port).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Host the credentials apply to.
    pub host: String,
    /// Port restriction; `None` matches any port.
    #[serde(default)]
    pub port: Option<u16>,
    /// User name.
    pub username: String,
    /// Password.
    #[serde(default)]
    pub password: Option<String>,
}

impl Credential {
    /// Returns true if these credentials apply to `host`:`port`.
    #[must_use]
    pub fn matches(&self, host: &str, port: u16) -> bool {
        self.host.eq_ignore_ascii_case(host) && self.port.is_none_or(|p| p == port)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A cookie pre-seeded into the shared cookie store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieEntry {
    /// URL the cookie belongs to.
    pub url: String,
    /// `Set-Cookie` style value, e.g. `session=abc; Path=/`.
    pub value: String,
}

/// Forward proxy settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy host name.
    pub host: String,
    /// Proxy port.
    pub port: u16,
}

/// Robots.txt handling switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotsConfig {
    /// Fetch and honour robots.txt at all.
    pub enabled: bool,
    /// Register `Disallow` rules as URL filter excludes.
    pub use_disallows: bool,
    /// Register `Allow` rules as URL filter includes.
    pub use_allows: bool,
}

impl Default for RobotsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            use_disallows: true,
            use_allows: true,
        }
    }
}

/// Connection pool limits and reaper timings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum open connections across all routes.
    pub max_total: usize,
    /// Maximum open connections per route.
    pub max_per_route: usize,
    /// Maximum lifetime of a connection in milliseconds.
    pub time_to_live_ms: u64,
    /// Idle connections older than this (milliseconds) are closed by the reaper.
    pub idle_timeout_ms: u64,
    /// Reaper sweep interval in milliseconds.
    pub sweep_interval_ms: u64,
    /// How long `acquire` waits for a free slot, in milliseconds.
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: 200,
            max_per_route: 20,
            time_to_live_ms: 5 * 60 * 1000,
            idle_timeout_ms: 60 * 1000,
            sweep_interval_ms: 5 * 1000,
            acquire_timeout_ms: 30 * 1000,
        }
    }
}

impl PoolConfig {
    /// Connection time-to-live.
    #[must_use]
    pub fn time_to_live(&self) -> Duration {
        Duration::from_millis(self.time_to_live_ms)
    }

    /// Idle timeout.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Reaper sweep interval.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Maximum wait for a pooled connection.
    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// User-Agent sent with every request and used for robots.txt matching.
    pub user_agent: String,
    /// Headers added to every request, in order.
    pub request_headers: Vec<RequestHeader>,
    /// Basic-auth credentials per host.
    pub credentials: Vec<Credential>,
    /// Cookies seeded into the shared cookie store.
    pub cookies: Vec<CookieEntry>,
    /// Optional forward proxy.
    pub proxy: Option<ProxyConfig>,
    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: Option<u64>,
    /// Socket read timeout in milliseconds.
    pub read_timeout_ms: Option<u64>,
    /// Whole-call deadline in milliseconds; `None` disables the deadline guard.
    pub access_timeout_ms: Option<u64>,
    /// MIME type used when neither headers nor sniffing yield one.
    pub default_mime_type: String,
    /// Bodies larger than this many bytes are spooled to a temp file.
    pub max_cached_content_size: usize,
    /// Directory for spool files; defaults to the system temp dir.
    pub temp_dir: Option<PathBuf>,
    /// Robots.txt handling.
    pub robots: RobotsConfig,
    /// Connection pool settings.
    pub pool: PoolConfig,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: user_agent::default_fetch_user_agent(),
            request_headers: Vec::new(),
            credentials: Vec::new(),
            cookies: Vec::new(),
            proxy: None,
            connect_timeout_ms: Some(30 * 1000),
            read_timeout_ms: Some(5 * 60 * 1000),
            access_timeout_ms: None,
            default_mime_type: DEFAULT_MIME_TYPE.to_string(),
            max_cached_content_size: DEFAULT_MAX_CACHED_CONTENT_SIZE,
            temp_dir: None,
            robots: RobotsConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl FetchConfig {
    /// Parses a configuration from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfRange`] for the first invalid setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_nonzero("pool.max_total", self.pool.max_total as u64)?;
        check_nonzero("pool.max_per_route", self.pool.max_per_route as u64)?;
        check_nonzero("pool.sweep_interval_ms", self.pool.sweep_interval_ms)?;
        check_nonzero("pool.time_to_live_ms", self.pool.time_to_live_ms)?;
        if let Some(timeout) = self.access_timeout_ms {
            check_nonzero("access_timeout_ms", timeout)?;
        }
        Ok(())
    }

    /// Headers with a usable name, in configured order.
    pub fn valid_request_headers(&self) -> impl Iterator<Item = &RequestHeader> {
        self.request_headers.iter().filter(|h| h.is_valid())
    }

    /// The per-call deadline, if configured.
    #[must_use]
    pub fn access_timeout(&self) -> Option<Duration> {
        self.access_timeout_ms.map(Duration::from_millis)
    }

    /// Directory used for spool files.
    #[must_use]
    pub fn spool_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Credentials matching `host`:`port`, if any.
    #[must_use]
    pub fn credential_for(&self, host: &str, port: u16) -> Option<&Credential> {
        self.credentials.iter().find(|c| c.matches(host, port))
    }
}

fn check_nonzero(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::OutOfRange {
            field,
            value,
            expected: ">= 1",
        });
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = FetchConfig::default();
        assert_eq!(config.pool.max_total, 200);
        assert_eq!(config.pool.max_per_route, 20);
        assert_eq!(config.pool.time_to_live(), Duration::from_secs(300));
        assert_eq!(config.pool.idle_timeout(), Duration::from_secs(60));
        assert_eq!(config.pool.sweep_interval(), Duration::from_secs(5));
        assert_eq!(config.default_mime_type, "application/octet-stream");
        assert!(config.robots.enabled);
        assert!(config.access_timeout().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = FetchConfig::from_json_str(
            r#"{"access_timeout_ms": 1500, "pool": {"max_per_route": 2}, "robots": {"use_allows": false}}"#,
        )
        .unwrap();
        assert_eq!(config.access_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.pool.max_per_route, 2);
        assert_eq!(config.pool.max_total, 200);
        assert!(config.robots.enabled);
        assert!(!config.robots.use_allows);
    }

    #[test]
    fn test_validate_rejects_zero_pool_size() {
        let mut config = FetchConfig::default();
        config.pool.max_per_route = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("pool.max_per_route"), "{err}");
    }

    #[test]
    fn test_invalid_headers_are_skipped() {
        let config = FetchConfig {
            request_headers: vec![
                RequestHeader::new("X-Crawler", "yes"),
                RequestHeader::new("  ", "ignored"),
            ],
            ..FetchConfig::default()
        };
        let names: Vec<_> = config.valid_request_headers().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["X-Crawler"]);
    }

    #[test]
    fn test_credential_matching_and_redaction() {
        let credential = Credential {
            host: "Example.com".to_string(),
            port: Some(8080),
            username: "alice".to_string(),
            password: Some("secret".to_string()),
        };
        assert!(credential.matches("example.com", 8080));
        assert!(!credential.matches("example.com", 80));
        assert!(!format!("{credential:?}").contains("secret"));
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        assert!(matches!(
            FetchConfig::from_json_str("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
