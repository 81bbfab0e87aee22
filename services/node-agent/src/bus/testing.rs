//! In-crate test support.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use super::consumer::Consumer;
use super::message::Message;

/// Consumer that records every message it receives.
#[derive(Default)]
pub struct RecordingConsumer {
    messages: Mutex<Vec<Message>>,
    notify: Notify,
}

impl RecordingConsumer {
    /// Create an empty recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All recorded messages in arrival order.
    pub fn messages(&self) -> Vec<Message> {
        self.lock().clone()
    }

    /// Last recorded message.
    pub fn last(&self) -> Option<Message> {
        self.lock().last().cloned()
    }

    /// Number of recorded messages.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if nothing was recorded yet.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Wait until the recorded messages satisfy `pred` or `timeout` elapses.
    ///
    /// Returns whether the predicate was satisfied.
    pub async fn wait_for<P>(&self, timeout: Duration, pred: P) -> bool
    where
        P: Fn(&[Message]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if pred(&self.lock()) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return pred(&self.lock());
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Message>> {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Consumer for RecordingConsumer {
    fn consume(&self, message: Message) {
        self.lock().push(message);
        self.notify.notify_waiters();
    }
}
