use std::path::PathBuf;
use std::str::FromStr;

/// Server settings, read once from `CONCIERGE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: parse_or("CONCIERGE_PORT", &lookup, defaults.port),
            bind: lookup("CONCIERGE_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("CONCIERGE_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            max_connections: parse_or("CONCIERGE_MAX_CONNECTIONS", &lookup, defaults.max_connections).max(1),
            compact_threshold: parse_or("CONCIERGE_COMPACT_THRESHOLD", &lookup, defaults.compact_threshold),
            metrics_port: lookup("CONCIERGE_METRICS_PORT").and_then(|raw| match raw.parse() {
                Ok(port) => Some(port),
                Err(_) => {
                    tracing::warn!("ignoring CONCIERGE_METRICS_PORT={raw:?}: not a port number");
                    None
                }
            }),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("concierge.wal")
    }
}

fn parse_or<T: FromStr + std::fmt::Display>(key: &str, lookup: &impl Fn(&str) -> Option<String>, default: T) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("ignoring {key}={raw:?}, using default {default}");
            default
        }),
    }
}
