//! Store seam between the KV backend and concrete stores.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use super::endpoint::Endpoint;

/// One entry of a watched subtree.
///
/// `value` is `None` when the store reported the key without a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Option<String>,
}

impl KvPair {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }
}

/// Errors reported by a store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Key does not exist.
    #[error("key not found: {0}")]
    NotFound(String),

    /// HTTP transport failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Store answered with something unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// A connected key/value store.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Watch every key under `prefix`.
    ///
    /// Each item is the full subtree. The channel closes when the watch is
    /// lost; dropping the receiver cancels it.
    async fn watch_tree(&self, prefix: &str) -> Result<mpsc::Receiver<Vec<KvPair>>, StoreError>;

    /// Write `value` at `key`. With a TTL the key expires unless rewritten.
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Remove `key`.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Opens stores for the schemes it supports.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Whether this connector handles `scheme`.
    fn supports(&self, scheme: &str) -> bool;

    /// Open a store. Called repeatedly until it succeeds.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Store>, StoreError>;
}
