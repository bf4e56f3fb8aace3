use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

use crate::executor::ExecutionMode;
use crate::result::DEFAULT_ARRAYSIZE;

pub const DEFAULT_PORT: u16 = 27017;

/// Connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    /// Database named in the connection string, if any
    pub database: Option<String>,
    pub mode: ExecutionMode,
    /// Rows per `getMore` and default `fetch_many` size
    pub arraysize: usize,
    /// First-batch size sent with `find`; the store default when unset
    pub batch_size: Option<u32>,
    /// Raise untranslatable WHERE clauses instead of degrading them
    pub strict_translation: bool,
    pub plan_cache_size: u64,
    pub plan_cache_ttl_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            database: None,
            mode: ExecutionMode::Standard,
            arraysize: DEFAULT_ARRAYSIZE,
            batch_size: None,
            strict_translation: false,
            plan_cache_size: 1000,
            plan_cache_ttl_secs: 300,
        }
    }
}

fn uri_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^mongodb(?:\+([\w-]+))?://(?:[^@/]*@)?([^/:?,]+)(?::([^/?,]*))?(?:,[^/?]*)?(?:/([^?]*))?(?:\?.*)?$")
            .expect("valid connection string regex")
    })
}

impl ConnectionConfig {
    /// Parse `mongodb[+suffix]://[user@]host[:port][/database][?options]`.
    /// The suffixes `superset`, `twostage` and `two-stage` select two-stage mode.
    pub fn from_uri(uri: &str) -> Result<Self, ConfigError> {
        let caps = uri_re()
            .captures(uri.trim())
            .ok_or_else(|| ConfigError::InvalidUri(uri.to_string()))?;

        let mode = match caps.get(1).map(|m| m.as_str().to_ascii_lowercase()) {
            Some(suffix) if matches!(suffix.as_str(), "superset" | "twostage" | "two-stage") => {
                ExecutionMode::TwoStage
            }
            _ => ExecutionMode::Standard,
        };
        let port = match caps.get(3).map(|m| m.as_str()) {
            None | Some("") => DEFAULT_PORT,
            Some(text) => text
                .parse()
                .map_err(|_| ConfigError::InvalidPort(text.to_string()))?,
        };
        let database = caps
            .get(4)
            .map(|m| m.as_str())
            .filter(|db| !db.is_empty())
            .map(String::from);

        Ok(Self {
            host: caps[2].to_string(),
            port,
            database,
            mode,
            ..Self::default()
        })
    }

    /// Create a config from environment variables
    /// DOCSQL_URI=mongodb+superset://localhost:27017/shop
    /// DOCSQL_MODE=twostage
    /// DOCSQL_ARRAYSIZE=500
    /// DOCSQL_BATCH_SIZE=101
    /// DOCSQL_STRICT=true
    /// DOCSQL_PLAN_CACHE_SIZE=1000
    /// DOCSQL_PLAN_CACHE_TTL_SECS=300
    pub fn from_env() -> Self {
        let mut config = match std::env::var("DOCSQL_URI") {
            Ok(uri) => Self::from_uri(&uri).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "ignoring DOCSQL_URI");
                Self::default()
            }),
            Err(_) => Self::default(),
        };

        if let Some(mode) = std::env::var("DOCSQL_MODE").ok().and_then(|m| ExecutionMode::parse(&m)) {
            config.mode = mode;
        }
        if let Some(size) = env_number::<usize>("DOCSQL_ARRAYSIZE").filter(|s| *s > 0) {
            config.arraysize = size;
        }
        if let Some(size) = env_number::<u32>("DOCSQL_BATCH_SIZE") {
            config.batch_size = Some(size);
        }
        if let Ok(strict) = std::env::var("DOCSQL_STRICT") {
            config.strict_translation = strict == "true" || strict == "1";
        }
        if let Some(size) = env_number("DOCSQL_PLAN_CACHE_SIZE") {
            config.plan_cache_size = size;
        }
        if let Some(ttl) = env_number("DOCSQL_PLAN_CACHE_TTL_SECS") {
            config.plan_cache_ttl_secs = ttl;
        }
        config
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_arraysize(mut self, arraysize: usize) -> Self {
        self.arraysize = arraysize.max(1);
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_strict_translation(mut self, strict: bool) -> Self {
        self.strict_translation = strict;
        self
    }

    pub fn with_plan_cache(mut self, size: u64, ttl: Duration) -> Self {
        self.plan_cache_size = size;
        self.plan_cache_ttl_secs = ttl.as_secs();
        self
    }

    pub fn plan_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.plan_cache_ttl_secs)
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring non-numeric setting");
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid connection string: {0}")]
    InvalidUri(String),

    #[error("Invalid port: {0}")]
    InvalidPort(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_superset_scheme() {
        let config = ConnectionConfig::from_uri("mongodb+superset://db.local:28000/shop").unwrap();
        assert_eq!(config.mode, ExecutionMode::TwoStage);
        assert_eq!(config.host, "db.local");
        assert_eq!(config.port, 28000);
        assert_eq!(config.database.as_deref(), Some("shop"));
    }

    #[test]
    fn test_plain_scheme_defaults() {
        let config = ConnectionConfig::from_uri("mongodb://localhost").unwrap();
        assert_eq!(config.mode, ExecutionMode::Standard);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.database, None);
        assert_eq!(config.address(), "localhost:27017");
    }

    #[test]
    fn test_other_suffixes() {
        let twostage = ConnectionConfig::from_uri("mongodb+two-stage://user:pw@h/db?retryWrites=true").unwrap();
        assert_eq!(twostage.mode, ExecutionMode::TwoStage);
        assert_eq!(twostage.host, "h");
        let srv = ConnectionConfig::from_uri("mongodb+srv://cluster0.example.net/app").unwrap();
        assert_eq!(srv.mode, ExecutionMode::Standard);
    }

    #[test]
    fn test_invalid_uris() {
        assert!(matches!(
            ConnectionConfig::from_uri("postgres://localhost"),
            Err(ConfigError::InvalidUri(_))
        ));
        assert!(matches!(
            ConnectionConfig::from_uri("mongodb://localhost:port/db"),
            Err(ConfigError::InvalidPort(_))
        ));
    }

    #[test]
    fn test_builders() {
        let config = ConnectionConfig::default()
            .with_mode(ExecutionMode::TwoStage)
            .with_arraysize(0)
            .with_batch_size(10)
            .with_strict_translation(true)
            .with_plan_cache(10, Duration::from_secs(5));
        assert_eq!(config.arraysize, 1);
        assert_eq!(config.batch_size, Some(10));
        assert!(config.strict_translation);
        assert_eq!(config.plan_cache_ttl(), Duration::from_secs(5));
    }

    #[test]
    fn test_serde_defaults() {
        let config: ConnectionConfig = serde_json::from_str(r#"{"mode": "twostage", "port": 1}"#).unwrap();
        assert_eq!(config.mode, ExecutionMode::TwoStage);
        assert_eq!(config.port, 1);
        assert_eq!(config.host, "localhost");
    }
}
