//! Client configuration.
//!
//! A `Config` is built with `Config::new` and chained `with_*` calls, or by
//! applying a list of [`ConfigOption`]s in order. It can also be loaded from
//! a TOML file:
//!
//! ```toml
//! endpoint = "grpcs://ydb.example.net:2135"
//! database = "/ru-central1/b1g/etn"
//! dial_timeout = "5s"
//! connection_ttl = "2m"
//! discovery_interval = "60s"
//! max_retries = 10
//! ```

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;
use crate::trace::{Observer, Observers};

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_RETRIES: u32 = 10;

const SECURE_SCHEME: &str = "grpcs://";
const INSECURE_SCHEME: &str = "grpc://";

#[derive(Debug, Clone)]
pub struct Config {
    endpoint: String,
    database: String,
    secure: bool,
    dial_timeout: Duration,
    connection_ttl: Duration,
    discovery_interval: Duration,
    max_retries: u32,
    observers: Observers,
}

/// One named option. Options are applied in order, later ones win.
#[derive(Clone)]
pub enum ConfigOption {
    Endpoint(String),
    Database(String),
    Secure(bool),
    DialTimeout(Duration),
    /// Idle time after which an unused connection is parked. Zero disables.
    ConnectionTtl(Duration),
    /// Topology refresh interval. Zero disables periodic discovery.
    DiscoveryInterval(Duration),
    MaxRetries(u32),
    Observer(Arc<dyn Observer>),
}

impl fmt::Debug for ConfigOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigOption::Endpoint(v) => f.debug_tuple("Endpoint").field(v).finish(),
            ConfigOption::Database(v) => f.debug_tuple("Database").field(v).finish(),
            ConfigOption::Secure(v) => f.debug_tuple("Secure").field(v).finish(),
            ConfigOption::DialTimeout(v) => f.debug_tuple("DialTimeout").field(v).finish(),
            ConfigOption::ConnectionTtl(v) => f.debug_tuple("ConnectionTtl").field(v).finish(),
            ConfigOption::DiscoveryInterval(v) => {
                f.debug_tuple("DiscoveryInterval").field(v).finish()
            }
            ConfigOption::MaxRetries(v) => f.debug_tuple("MaxRetries").field(v).finish(),
            ConfigOption::Observer(_) => f.write_str("Observer(..)"),
        }
    }
}

impl Config {
    /// `endpoint` may carry a `grpc://` or `grpcs://` scheme; `grpcs`
    /// turns on TLS.
    pub fn new(endpoint: impl Into<String>, database: impl Into<String>) -> Self {
        let mut config = Self {
            endpoint: String::new(),
            database: database.into(),
            secure: false,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            connection_ttl: Duration::ZERO,
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            observers: Observers::default(),
        };
        config.set_endpoint(endpoint.into());
        config
    }

    /// Parse a DSN such as `grpcs://host:2135/?database=/local` or
    /// `grpc://host:2136/local`.
    pub fn from_connection_string(dsn: &str) -> Result<Self, Error> {
        let (scheme, rest) = if let Some(rest) = dsn.strip_prefix(SECURE_SCHEME) {
            (SECURE_SCHEME, rest)
        } else if let Some(rest) = dsn.strip_prefix(INSECURE_SCHEME) {
            (INSECURE_SCHEME, rest)
        } else {
            return Err(Error::Config(format!(
                "connection string {dsn:?} must start with grpc:// or grpcs://"
            )));
        };

        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };
        let (host, path) = match location.split_once('/') {
            Some((host, path)) => (host, path),
            None => (location, ""),
        };
        if host.is_empty() {
            return Err(Error::Config(format!("connection string {dsn:?} has no host")));
        }

        let mut database = if path.is_empty() {
            String::new()
        } else {
            format!("/{}", path.trim_end_matches('/'))
        };
        if let Some(query) = query {
            for pair in query.split('&') {
                if let Some(value) = pair.strip_prefix("database=") {
                    database = value.to_string();
                }
            }
        }
        if database.is_empty() || database == "/" {
            return Err(Error::Config(format!(
                "connection string {dsn:?} has no database"
            )));
        }

        Ok(Self::new(format!("{scheme}{host}"), database))
    }

    pub fn from_toml_str(content: &str) -> Result<Self, Error> {
        let file: FileConfig =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        file.into_config()
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    fn set_endpoint(&mut self, endpoint: String) {
        if let Some(addr) = endpoint.strip_prefix(SECURE_SCHEME) {
            self.endpoint = addr.to_string();
            self.secure = true;
        } else if let Some(addr) = endpoint.strip_prefix(INSECURE_SCHEME) {
            self.endpoint = addr.to_string();
            self.secure = false;
        } else {
            self.endpoint = endpoint;
        }
    }

    pub fn apply(&mut self, option: ConfigOption) {
        match option {
            ConfigOption::Endpoint(v) => self.set_endpoint(v),
            ConfigOption::Database(v) => self.database = v,
            ConfigOption::Secure(v) => self.secure = v,
            ConfigOption::DialTimeout(v) => self.dial_timeout = v,
            ConfigOption::ConnectionTtl(v) => self.connection_ttl = v,
            ConfigOption::DiscoveryInterval(v) => self.discovery_interval = v,
            ConfigOption::MaxRetries(v) => self.max_retries = v,
            ConfigOption::Observer(v) => self.observers.push(v),
        }
    }

    pub fn with_options(mut self, options: impl IntoIterator<Item = ConfigOption>) -> Self {
        for option in options {
            self.apply(option);
        }
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_connection_ttl(mut self, ttl: Duration) -> Self {
        self.connection_ttl = ttl;
        self
    }

    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    /// `host:port` of the bootstrap node, without scheme.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    pub fn dial_timeout(&self) -> Duration {
        self.dial_timeout
    }

    pub fn connection_ttl(&self) -> Duration {
        self.connection_ttl
    }

    pub fn discovery_interval(&self) -> Duration {
        self.discovery_interval
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn observers(&self) -> &Observers {
        &self.observers
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.endpoint.is_empty() {
            return Err(Error::Config("endpoint is empty".into()));
        }
        if !self.endpoint.contains(':') {
            return Err(Error::Config(format!(
                "endpoint {:?} must be host:port",
                self.endpoint
            )));
        }
        if self.database.is_empty() {
            return Err(Error::Config("database is empty".into()));
        }
        Ok(())
    }
}

// ── File format ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct FileConfig {
    endpoint: String,
    database: String,
    secure: Option<bool>,
    dial_timeout: Option<String>,
    connection_ttl: Option<String>,
    discovery_interval: Option<String>,
    max_retries: Option<u32>,
}

impl FileConfig {
    fn into_config(self) -> Result<Config, Error> {
        let mut config = Config::new(self.endpoint, self.database);
        if let Some(secure) = self.secure {
            config.secure = secure;
        }
        if let Some(s) = &self.dial_timeout {
            config.dial_timeout = parse_duration("dial_timeout", s)?;
        }
        if let Some(s) = &self.connection_ttl {
            config.connection_ttl = parse_duration("connection_ttl", s)?;
        }
        if let Some(s) = &self.discovery_interval {
            config.discovery_interval = parse_duration("discovery_interval", s)?;
        }
        if let Some(n) = self.max_retries {
            config.max_retries = n;
        }
        Ok(config)
    }
}

/// Parse a config duration: `"500ms"`, `"5s"`, `"2m"`, `"1h"` or a bare
/// number of seconds. Errors name the offending `field`.
pub fn parse_duration(field: &str, value: &str) -> Result<Duration, Error> {
    let trimmed = value.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);

    let duration = digits.parse::<u64>().ok().and_then(|n| match unit {
        "ms" => Some(Duration::from_millis(n)),
        "" | "s" => Some(Duration::from_secs(n)),
        "m" => n.checked_mul(60).map(Duration::from_secs),
        "h" => n.checked_mul(3600).map(Duration::from_secs),
        _ => None,
    });
    duration.ok_or_else(|| Error::Config(format!("{field}: invalid duration {value:?}")))
}
