use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::auth::Credentials;
use crate::engine::EngineSettings;
use crate::limits::{CACHE_TTL_MS, DEFAULT_SOURCE_TIMEOUT_MS};
use crate::model::Ms;

/// Process configuration, read from `SLOTWARD_*` environment variables.
/// Values that fail to parse fall back to their defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub public: Credentials,
    pub admin: Credentials,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub source_timeout: Duration,
    pub request_timeout: Duration,
    pub cache_ttl_ms: Ms,
    pub metrics_port: Option<u16>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(&format!("SLOTWARD_{name}"));
        let parsed = |name: &str| var(name).and_then(|s| s.trim().parse::<u64>().ok());
        fn or<T: FromStr>(raw: Option<String>, default: T) -> T {
            raw.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
        }

        Self {
            port: or(var("PORT"), 5433),
            bind: var("BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: var("DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            public: Credentials {
                user: var("PUBLIC_USER").unwrap_or_else(|| "booking".into()),
                password: var("PUBLIC_PASSWORD").unwrap_or_else(|| "booking".into()),
            },
            admin: Credentials {
                user: var("ADMIN_USER").unwrap_or_else(|| "slotward".into()),
                password: var("ADMIN_PASSWORD").unwrap_or_else(|| "slotward".into()),
            },
            max_connections: or(var("MAX_CONNECTIONS"), 256),
            compact_threshold: or(var("COMPACT_THRESHOLD"), 1000),
            source_timeout: Duration::from_millis(
                parsed("SOURCE_TIMEOUT_MS").unwrap_or(DEFAULT_SOURCE_TIMEOUT_MS),
            ),
            request_timeout: Duration::from_millis(parsed("REQUEST_TIMEOUT_MS").unwrap_or(10_000)),
            cache_ttl_ms: or(var("CACHE_TTL_MS"), CACHE_TTL_MS),
            metrics_port: var("METRICS_PORT").and_then(|s| s.trim().parse().ok()),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotward.wal")
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            source_timeout: self.source_timeout,
            cache_ttl_ms: self.cache_ttl_ms,
            ..EngineSettings::default()
        }
    }
}
