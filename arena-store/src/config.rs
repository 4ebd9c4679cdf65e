//! Store configuration.
//!
//! Read once when a store is constructed. Changing any option means building
//! a new [`DocumentStore`](crate::DocumentStore).

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::StoreError;

/// Which backend persists the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// One JSON file on local disk
    Local,
    /// Networked document database
    Remote,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Local => f.write_str("local"),
            BackendKind::Remote => f.write_str("remote"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "file" => Ok(BackendKind::Local),
            "remote" | "redis" => Ok(BackendKind::Remote),
            other => Err(StoreError::UnknownBackend(other.to_string())),
        }
    }
}

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Backend selection (default: local)
    pub backend: BackendKind,
    /// Remote connection string (default: redis://127.0.0.1:6379)
    pub remote_url: String,
    /// Remote database namespace, used as key prefix (default: arena)
    pub namespace: String,
    /// Bound on establishing the remote connection (default: 5s)
    pub connect_timeout: Duration,
    /// Cache time-to-live; zero disables caching (default: 2s)
    pub cache_ttl: Duration,
    /// Local backend file (default: data/db.json)
    pub data_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Local,
            remote_url: "redis://127.0.0.1:6379".to_string(),
            namespace: "arena".to_string(),
            connect_timeout: Duration::from_millis(5000),
            cache_ttl: Duration::from_millis(2000),
            data_path: PathBuf::from("data/db.json"),
        }
    }
}

impl StoreConfig {
    /// Config for testing: local file at `path`, short cache window.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: path.into(),
            cache_ttl: Duration::from_millis(100),
            connect_timeout: Duration::from_millis(500),
            ..Self::default()
        }
    }

    /// Build from `ARENA_*` environment variables.
    ///
    /// Unset or unparsable variables fall back to the default with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            backend: parse_or(&lookup, "ARENA_STORE_BACKEND", defaults.backend),
            remote_url: lookup("ARENA_REMOTE_URL").unwrap_or(defaults.remote_url),
            namespace: lookup("ARENA_NAMESPACE").unwrap_or(defaults.namespace),
            connect_timeout: Duration::from_millis(parse_or(
                &lookup,
                "ARENA_CONNECT_TIMEOUT_MS",
                defaults.connect_timeout.as_millis() as u64,
            )),
            cache_ttl: Duration::from_millis(parse_or(
                &lookup,
                "ARENA_CACHE_TTL_MS",
                defaults.cache_ttl.as_millis() as u64,
            )),
            data_path: lookup("ARENA_DATA_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_path),
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + fmt::Display,
    T::Err: fmt::Display,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|e| {
            log::warn!("Invalid {key} value {raw:?} ({e}), using default: {default}");
            default
        }),
    }
}
