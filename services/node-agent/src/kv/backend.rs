//! Distributed KV backend.
//!
//! Owns the store connection and exposes the public namespace to the rest of
//! the agent:
//! - a connect loop publishing [`ConnectionState`] on a watch gate
//! - one watch loop per registered consumer, mirroring a subtree as messages
//! - a [`KvWriter`] actor replaying writes against the store

use std::sync::Arc;
use std::time::Duration;

use plinth_constraint::{content_hash, FlatMap};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use super::endpoint::{join_key, Endpoint};
use super::store::{Connector, KvPair, Store};
use super::writer::{KvOp, KvWriter, WriterMessage, WRITER_MAILBOX};
use crate::actors::{stop_requested, ActorHandle, Supervisor};
use crate::bus::{Consumer, Message, Publisher};

/// Errors that disable the backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    /// Public namespace switched off by configuration.
    #[error("public namespace is disabled")]
    Disabled,

    /// Store URL could not be parsed.
    #[error("invalid KV url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// No connector handles the URL scheme.
    #[error("unsupported KV backend: {0}")]
    UnsupportedScheme(String),

    /// Connect retry budget spent.
    #[error("KV store unreachable after {0} attempts")]
    RetriesExhausted(u32),
}

/// KV backend settings.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Whether the public namespace is enabled at all.
    pub enabled: bool,

    /// `scheme://host1,host2/chroot`.
    pub url: String,

    /// Bound on each connection attempt.
    pub timeout: Duration,

    /// Pause between connection and watch attempts.
    pub retry_interval: Duration,

    /// TTL of announced keys.
    pub ttl: Duration,

    /// Retry budget for connects and watches. 0 retries forever.
    pub retry: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "consul://127.0.0.1:8500/plinth".to_string(),
            timeout: Duration::from_secs(60),
            retry_interval: Duration::from_secs(30),
            ttl: Duration::from_secs(180),
            retry: 0,
        }
    }
}

impl BackendConfig {
    fn budget_spent(&self, attempts: u32) -> bool {
        self.retry > 0 && attempts > self.retry
    }
}

/// An established store connection.
#[derive(Clone)]
pub struct Connection {
    pub store: Arc<dyn Store>,
    pub chroot: String,
}

/// Connection gate shared by the backend loops.
#[derive(Clone)]
pub enum ConnectionState {
    /// Still trying.
    Connecting,
    /// Connected for good.
    Connected(Connection),
    /// Never going to connect.
    Disabled(KvError),
}

impl ConnectionState {
    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionState::Connecting)
    }
}

/// KV backend handle.
pub struct Backend {
    config: BackendConfig,
    state: watch::Receiver<ConnectionState>,
    writer: Option<ActorHandle<WriterMessage>>,
    shutdown: watch::Receiver<bool>,
}

impl Backend {
    /// Producer prefix of the backend.
    pub const PREFIX: &'static str = "kv";

    /// Start connecting and spawn the writer under `supervisor`.
    pub fn start(
        config: BackendConfig,
        connector: Arc<dyn Connector>,
        supervisor: &mut Supervisor,
    ) -> Arc<Self> {
        let shutdown = supervisor.shutdown_signal();

        if !config.enabled {
            info!("KV backend disabled");
            let (_, state) = watch::channel(ConnectionState::Disabled(KvError::Disabled));
            return Arc::new(Self {
                config,
                state,
                writer: None,
                shutdown,
            });
        }

        let (state_tx, state) = watch::channel(ConnectionState::Connecting);
        tokio::spawn(connect_loop(
            config.clone(),
            connector,
            state_tx,
            shutdown.clone(),
        ));

        let writer = supervisor.spawn(KvWriter::new(state.clone(), config.ttl), WRITER_MAILBOX);
        tokio::spawn(tick_loop(
            writer.clone(),
            state.clone(),
            config.ttl,
            shutdown.clone(),
        ));

        Arc::new(Self {
            config,
            state,
            writer: Some(writer),
            shutdown,
        })
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Wait until the connection is established or abandoned.
    pub async fn settled(&self) -> ConnectionState {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| !s.is_connecting()).await;
        let settled = state.borrow().clone();
        settled
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }

    /// Write `data` under the chroot. TTL keys are refreshed until deleted.
    pub async fn set(&self, data: FlatMap, with_ttl: bool) {
        let ops = data
            .into_iter()
            .map(|(key, value)| {
                if with_ttl {
                    KvOp::SetTtl { key, value }
                } else {
                    KvOp::Set { key, value }
                }
            })
            .collect();
        self.submit(ops).await;
    }

    /// Delete `keys` under the chroot.
    pub async fn delete<I, K>(&self, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let ops = keys
            .into_iter()
            .map(|key| KvOp::Delete { key: key.into() })
            .collect();
        self.submit(ops).await;
    }

    async fn submit(&self, ops: Vec<KvOp>) {
        let Some(writer) = &self.writer else {
            return;
        };
        if writer.send(WriterMessage::Submit(ops)).await.is_err() {
            debug!("KV writer stopped, dropping operations");
        }
    }
}

impl Publisher for Backend {
    /// Mirror the `name` subtree into `consumer`.
    fn register_consumer(&self, name: &str, consumer: Arc<dyn Consumer>) {
        info!(prefix = %name, "Consumer registered");
        tokio::spawn(watch_loop(
            name.to_string(),
            consumer,
            self.state.clone(),
            self.config.clone(),
            self.shutdown.clone(),
        ));
    }
}

async fn connect_loop(
    config: BackendConfig,
    connector: Arc<dyn Connector>,
    state: watch::Sender<ConnectionState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let endpoint = match Endpoint::parse(&config.url) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            error!(error = %e, "KV backend disabled");
            state.send_replace(ConnectionState::Disabled(e));
            return;
        }
    };
    if !connector.supports(endpoint.scheme()) {
        let e = KvError::UnsupportedScheme(endpoint.scheme().to_string());
        error!(error = %e, "KV backend disabled");
        state.send_replace(ConnectionState::Disabled(e));
        return;
    }

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        info!(url = %config.url, attempt, "Connecting to KV store");

        let connected = tokio::select! {
            res = tokio::time::timeout(config.timeout, connector.connect(&endpoint)) => res,
            () = stop_requested(&mut shutdown) => return,
        };
        match connected {
            Ok(Ok(store)) => {
                info!(url = %config.url, chroot = %endpoint.chroot(), "Connected to KV store");
                state.send_replace(ConnectionState::Connected(Connection {
                    store,
                    chroot: endpoint.chroot().to_string(),
                }));
                return;
            }
            Ok(Err(e)) => {
                error!(url = %config.url, attempt, error = %e, "Failed to connect to KV store");
            }
            Err(_) => {
                error!(url = %config.url, attempt, timeout = ?config.timeout, "KV connect timed out");
            }
        }

        if config.budget_spent(attempt) {
            let e = KvError::RetriesExhausted(attempt);
            error!(error = %e, "KV backend disabled");
            state.send_replace(ConnectionState::Disabled(e));
            return;
        }

        tokio::select! {
            () = tokio::time::sleep(config.retry_interval) => {}
            () = stop_requested(&mut shutdown) => return,
        }
    }
}

/// Feed the writer a refresh every `ttl / 2`, starting on connect.
async fn tick_loop(
    writer: ActorHandle<WriterMessage>,
    mut state: watch::Receiver<ConnectionState>,
    ttl: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let connected = tokio::select! {
        res = state.wait_for(|s| !s.is_connecting()) => {
            matches!(res.as_deref(), Ok(ConnectionState::Connected(_)))
        }
        () = stop_requested(&mut shutdown) => return,
    };
    if !connected {
        return;
    }

    let period = (ttl / 2).max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                trace!("KV refresh tick");
                if writer.send(WriterMessage::Refresh).await.is_err() {
                    return;
                }
            }
            () = stop_requested(&mut shutdown) => return,
        }
    }
}

async fn watch_loop(
    prefix: String,
    consumer: Arc<dyn Consumer>,
    mut state: watch::Receiver<ConnectionState>,
    config: BackendConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    consumer.consume(Message::dirty(&prefix));

    let gate = tokio::select! {
        res = state.wait_for(|s| !s.is_connecting()) => match res {
            Ok(settled) => settled.clone(),
            Err(_) => return,
        },
        () = stop_requested(&mut shutdown) => return,
    };
    let connection = match gate {
        ConnectionState::Connected(connection) => connection,
        ConnectionState::Disabled(e) => {
            warn!(prefix = %prefix, error = %e, "Disabling consumer");
            consumer.consume(Message::clean(&prefix, FlatMap::new()));
            return;
        }
        ConnectionState::Connecting => return,
    };

    let root = join_key(&connection.chroot, &prefix);
    let mut cache = FlatMap::new();
    let mut last_hash: Option<u64> = None;
    let mut retry = 0u32;
    info!(prefix = %prefix, root = %root, "Watch open");

    loop {
        debug!(prefix = %prefix, retry, "Watching");
        let watched = tokio::select! {
            res = connection.store.watch_tree(&root) => res,
            () = stop_requested(&mut shutdown) => return,
        };

        match watched {
            Ok(mut changes) => loop {
                let pairs = tokio::select! {
                    pairs = changes.recv() => pairs,
                    () = stop_requested(&mut shutdown) => return,
                };
                let Some(pairs) = pairs else {
                    debug!(prefix = %prefix, "Watch lost");
                    break;
                };
                retry = 0;
                trace!(prefix = %prefix, count = pairs.len(), "Pairs received");

                let data = collect_pairs(&root, pairs, &cache);
                let hash = content_hash(&data);
                if last_hash == Some(hash) {
                    trace!(prefix = %prefix, "Skipping update: data is equal");
                    continue;
                }
                last_hash = Some(hash);
                cache = data.clone();
                debug!(prefix = %prefix, keys = data.len(), "Consumer updated");
                consumer.consume(Message::clean(&prefix, data));
            },
            Err(e) => {
                error!(prefix = %prefix, error = %e, "Watch failed");
            }
        }

        retry += 1;
        last_hash = None;
        if retry == 1 {
            consumer.consume(Message::dirty(&prefix));
        }
        if config.budget_spent(retry) {
            warn!(prefix = %prefix, retry, "Retry budget spent, disabling consumer");
            consumer.consume(Message::clean(&prefix, FlatMap::new()));
            return;
        }

        info!(prefix = %prefix, retry, interval = ?config.retry_interval, "Sleeping before rewatch");
        tokio::select! {
            () = tokio::time::sleep(config.retry_interval) => {}
            () = stop_requested(&mut shutdown) => return,
        }
    }
}

/// Strip `root/` from keys; valueless keys keep their cached value. Keys
/// outside the subtree are dropped.
fn collect_pairs(root: &str, pairs: Vec<KvPair>, cache: &FlatMap) -> FlatMap {
    let dir = format!("{}/", root.trim_end_matches('/'));
    let mut data = FlatMap::new();
    for pair in pairs {
        let Some(key) = pair.key.strip_prefix(&dir) else {
            trace!(key = %pair.key, "Ignoring key outside the subtree");
            continue;
        };
        if key.is_empty() {
            continue;
        }
        match pair.value {
            Some(value) => {
                data.insert(key.to_string(), value);
            }
            None => {
                if let Some(old) = cache.get(key) {
                    trace!(key = %key, "Using cached value");
                    data.insert(key.to_string(), old.clone());
                }
            }
        }
    }
    data
}
