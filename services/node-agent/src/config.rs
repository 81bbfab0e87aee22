//! Configuration for the node agent.

use std::time::Duration;

use anyhow::{bail, Result};
use plinth_constraint::FlatMap;

use crate::kv::BackendConfig;

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this node.
    pub agent_id: String,

    /// Operator-supplied node metadata.
    pub meta: FlatMap,

    /// Address other agents reach this one on.
    pub advertise: String,

    /// Public namespace (KV backend) settings.
    pub kv: BackendConfig,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let agent_id = lookup("PLINTH_AGENT_ID")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "localhost".to_string());

        let meta = match lookup("PLINTH_META") {
            Some(raw) => parse_meta(&raw)?,
            None => FlatMap::new(),
        };

        let advertise =
            lookup("PLINTH_ADVERTISE").unwrap_or_else(|| "127.0.0.1:7654".to_string());

        let defaults = BackendConfig::default();
        let secs = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };
        let kv = BackendConfig {
            enabled: lookup("PLINTH_PUBLIC")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.enabled),
            url: lookup("PLINTH_KV_URL").unwrap_or(defaults.url),
            timeout: secs("PLINTH_KV_TIMEOUT", defaults.timeout),
            retry_interval: secs("PLINTH_KV_RETRY_INTERVAL", defaults.retry_interval),
            ttl: secs("PLINTH_KV_TTL", defaults.ttl),
            retry: lookup("PLINTH_KV_RETRY")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.retry),
        };

        let log_level = lookup("PLINTH_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            agent_id,
            meta,
            advertise,
            kv,
            log_level,
        })
    }
}

/// Parse `k=v,k=v` node metadata.
fn parse_meta(raw: &str) -> Result<FlatMap> {
    let mut meta = FlatMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((key, value)) = entry.split_once('=') else {
            bail!("invalid PLINTH_META entry {entry:?}: expected key=value");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("invalid PLINTH_META entry {entry:?}: empty key");
        }
        meta.insert(key.to_string(), value.trim().to_string());
    }
    Ok(meta)
}
