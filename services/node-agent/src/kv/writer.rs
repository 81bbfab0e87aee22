//! KV write actor.
//!
//! Keeps every submitted operation in a pending map keyed by KV key (last op
//! for a key wins) and replays the map against the store whenever it gets a
//! submission or a refresh tick while connected.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, trace};

use super::backend::{Connection, ConnectionState};
use super::endpoint::join_key;
use super::store::StoreError;
use crate::actors::{Actor, ActorContext, ActorError};

/// Writer mailbox capacity.
pub const WRITER_MAILBOX: usize = 500;

/// One pending write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    /// Write refreshed on every tick until replaced.
    SetTtl { key: String, value: String },
    /// One-shot write.
    Set { key: String, value: String },
    /// One-shot delete.
    Delete { key: String },
}

impl KvOp {
    pub fn key(&self) -> &str {
        match self {
            KvOp::SetTtl { key, .. } | KvOp::Set { key, .. } | KvOp::Delete { key } => key,
        }
    }

    /// Finite ops leave the pending map once applied.
    fn is_finite(&self) -> bool {
        !matches!(self, KvOp::SetTtl { .. })
    }
}

/// Messages handled by [`KvWriter`].
#[derive(Debug)]
pub enum WriterMessage {
    /// New operations, in order.
    Submit(Vec<KvOp>),
    /// Replay pending operations.
    Refresh,
}

/// Actor applying [`KvOp`]s to the connected store.
pub struct KvWriter {
    state: watch::Receiver<ConnectionState>,
    ttl: Duration,
    pending: BTreeMap<String, KvOp>,
}

impl KvWriter {
    pub fn new(state: watch::Receiver<ConnectionState>, ttl: Duration) -> Self {
        Self {
            state,
            ttl,
            pending: BTreeMap::new(),
        }
    }

    async fn flush(&mut self, connection: &Connection) {
        let mut applied = Vec::new();
        for (key, op) in &self.pending {
            trace!(op = ?op, "Executing");
            let path = join_key(&connection.chroot, key);
            let res = match op {
                KvOp::SetTtl { value, .. } => {
                    connection.store.put(&path, value, Some(self.ttl)).await
                }
                KvOp::Set { value, .. } => connection.store.put(&path, value, None).await,
                KvOp::Delete { .. } => match connection.store.delete(&path).await {
                    Err(StoreError::NotFound(_)) => Ok(()),
                    other => other,
                },
            };
            match res {
                Ok(()) => {
                    trace!(key = %key, "Operation applied");
                    if op.is_finite() {
                        applied.push(key.clone());
                    }
                }
                Err(e) => error!(key = %key, error = %e, "KV operation failed"),
            }
        }
        for key in applied {
            self.pending.remove(&key);
        }
    }
}

#[async_trait]
impl Actor for KvWriter {
    type Message = WriterMessage;

    fn name(&self) -> &str {
        "kv_writer"
    }

    async fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorError> {
        info!(ttl = ?self.ttl, "KV writer open");
        Ok(())
    }

    async fn handle(
        &mut self,
        msg: Self::Message,
        _ctx: &mut ActorContext,
    ) -> Result<bool, ActorError> {
        if let WriterMessage::Submit(ops) = msg {
            debug!(count = ops.len(), "Operations received");
            for op in ops {
                self.pending.insert(op.key().to_string(), op);
            }
        }

        let state = self.state.borrow().clone();
        match state {
            ConnectionState::Connected(connection) => self.flush(&connection).await,
            ConnectionState::Connecting => {
                info!(pending = self.pending.len(), "Connection is not established");
            }
            ConnectionState::Disabled(e) => {
                debug!(error = %e, pending = self.pending.len(), "Dropping operations");
                self.pending.clear();
            }
        }
        Ok(true)
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext) {
        info!(pending = self.pending.len(), "KV writer closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryStore;
    use std::sync::Arc;

    fn connected(store: &Arc<MemoryStore>) -> watch::Receiver<ConnectionState> {
        let (_, rx) = watch::channel(ConnectionState::Connected(Connection {
            store: store.clone(),
            chroot: "plinth".to_string(),
        }));
        rx
    }

    fn ctx() -> ActorContext {
        let (_, shutdown) = watch::channel(false);
        ActorContext::new("kv_writer_test".to_string(), shutdown)
    }

    fn set_ttl(key: &str, value: &str) -> KvOp {
        KvOp::SetTtl {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    #[tokio::test]
    async fn test_last_op_for_key_wins() {
        let store = MemoryStore::new();
        let mut writer = KvWriter::new(connected(&store), Duration::from_secs(60));
        let mut ctx = ctx();

        writer
            .handle(
                WriterMessage::Submit(vec![
                    KvOp::Set {
                        key: "a".to_string(),
                        value: "1".to_string(),
                    },
                    KvOp::Delete {
                        key: "a".to_string(),
                    },
                    KvOp::Set {
                        key: "b".to_string(),
                        value: "2".to_string(),
                    },
                ]),
                &mut ctx,
            )
            .await
            .unwrap();

        // Deleting the absent "a" counts as applied.
        assert_eq!(store.get("plinth/a"), None);
        assert_eq!(store.get("plinth/b"), Some("2".to_string()));
        assert!(writer.pending.is_empty());
    }

    #[tokio::test]
    async fn test_ttl_ops_stay_pending_and_refresh() {
        let store = MemoryStore::new();
        let mut writer = KvWriter::new(connected(&store), Duration::from_secs(60));
        let mut ctx = ctx();

        writer
            .handle(WriterMessage::Submit(vec![set_ttl("nodes/a", "{}")]), &mut ctx)
            .await
            .unwrap();
        writer.handle(WriterMessage::Refresh, &mut ctx).await.unwrap();

        assert_eq!(store.ttl("plinth/nodes/a"), Some(Duration::from_secs(60)));
        assert_eq!(store.writes("plinth/nodes/a"), 2);
        assert_eq!(writer.pending.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_ops_stay_pending() {
        let store = MemoryStore::new();
        store.fail_writes(true);
        let mut writer = KvWriter::new(connected(&store), Duration::from_secs(60));
        let mut ctx = ctx();

        writer
            .handle(
                WriterMessage::Submit(vec![KvOp::Set {
                    key: "a".to_string(),
                    value: "1".to_string(),
                }]),
                &mut ctx,
            )
            .await
            .unwrap();
        assert_eq!(writer.pending.len(), 1);

        store.fail_writes(false);
        writer.handle(WriterMessage::Refresh, &mut ctx).await.unwrap();
        assert!(writer.pending.is_empty());
        assert_eq!(store.get("plinth/a"), Some("1".to_string()));
    }

    #[tokio::test]
    async fn test_ops_accumulate_while_connecting() {
        let store = MemoryStore::new();
        let (state_tx, state) = watch::channel(ConnectionState::Connecting);
        let mut writer = KvWriter::new(state, Duration::from_secs(60));
        let mut ctx = ctx();

        writer
            .handle(WriterMessage::Submit(vec![set_ttl("a", "1")]), &mut ctx)
            .await
            .unwrap();
        writer
            .handle(WriterMessage::Submit(vec![set_ttl("a", "2")]), &mut ctx)
            .await
            .unwrap();
        assert!(store.keys().is_empty());

        state_tx.send_replace(ConnectionState::Connected(Connection {
            store: store.clone(),
            chroot: String::new(),
        }));
        writer.handle(WriterMessage::Refresh, &mut ctx).await.unwrap();
        assert_eq!(store.get("a"), Some("2".to_string()));
        assert_eq!(store.writes("a"), 1);
    }
}
