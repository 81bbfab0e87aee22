//! Shared helpers for the node agent integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use plinth_node_agent::{Consumer, Message};
use tokio::sync::Notify;

pub const WAIT: Duration = Duration::from_secs(5);

/// Consumer recording every message it receives.
#[derive(Default)]
pub struct Recorder {
    messages: Mutex<Vec<Message>>,
    notify: Notify,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    /// Wait until the recorded messages satisfy `pred`, up to [`WAIT`].
    pub async fn wait_for<P: Fn(&[Message]) -> bool>(&self, pred: P) -> bool {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let notified = self.notify.notified();
            if pred(&self.messages.lock().unwrap()) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return pred(&self.messages.lock().unwrap());
            }
        }
    }
}

impl Consumer for Recorder {
    fn consume(&self, message: Message) {
        self.messages.lock().unwrap().push(message);
        self.notify.notify_waiters();
    }
}

/// Poll `f` every 10ms until it holds or [`WAIT`] elapses.
pub async fn eventually<F: Fn() -> bool>(f: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    f()
}
