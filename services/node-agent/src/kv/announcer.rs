//! Publishes a producer's snapshot into the KV store.

use std::sync::Arc;

use plinth_constraint::FlatMap;
use tokio::sync::watch;
use tracing::{debug, error};

use super::backend::Backend;
use crate::actors::stop_requested;
use crate::bus::{Consumer, Message};

/// Consumer writing every clean snapshot as one JSON document at `key`
/// with TTL.
///
/// Snapshots are handed to a background task; only the latest one is
/// written if several arrive while a write is in flight.
pub struct Announcer {
    key: String,
    latest: watch::Sender<Option<FlatMap>>,
}

impl Announcer {
    pub fn start(backend: Arc<Backend>, key: impl Into<String>) -> Arc<Self> {
        let key = key.into();
        let (latest, rx) = watch::channel(None);
        tokio::spawn(announce_loop(
            backend.clone(),
            key.clone(),
            rx,
            backend.shutdown_signal(),
        ));
        Arc::new(Self { key, latest })
    }

    /// KV key written by this announcer.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Consumer for Announcer {
    fn consume(&self, message: Message) {
        if !message.clean {
            return;
        }
        self.latest.send_replace(Some(message.data));
    }
}

async fn announce_loop(
    backend: Arc<Backend>,
    key: String,
    mut latest: watch::Receiver<Option<FlatMap>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = latest.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            () = stop_requested(&mut shutdown) => return,
        }

        let Some(data) = latest.borrow_and_update().clone() else {
            continue;
        };
        match serde_json::to_string(&data) {
            Ok(document) => {
                debug!(key = %key, "Announcing");
                backend
                    .set(FlatMap::from([(key.clone(), document)]), true)
                    .await;
            }
            Err(e) => error!(key = %key, error = %e, "Failed to encode announcement"),
        }
    }
}
