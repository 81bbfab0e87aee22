//! Transform stage between a publisher and its consumers.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use super::consumer::{Consumer, Publisher};
use super::message::Message;

/// Pure message rewrite applied by a [`Pipe`].
pub type PipeFn = Arc<dyn Fn(Message) -> Message + Send + Sync>;

/// Subscribes to one publisher, rewrites every message and republishes it.
///
/// The last rewritten message is cached; consumers that join late get the
/// cached message replayed if it is clean.
pub struct Pipe {
    name: String,
    func: Option<PipeFn>,
    state: Mutex<PipeState>,
}

#[derive(Default)]
struct PipeState {
    cache: Option<Message>,
    consumers: Vec<Arc<dyn Consumer>>,
}

impl Pipe {
    /// Create a pipe. Without a function messages pass through unchanged.
    pub fn new(name: impl Into<String>, func: Option<PipeFn>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            func,
            state: Mutex::new(PipeState::default()),
        })
    }

    /// Create a pipe and register it on `upstream`.
    pub fn bind(
        name: impl Into<String>,
        upstream: &dyn Publisher,
        func: Option<PipeFn>,
    ) -> Arc<Self> {
        let pipe = Self::new(name, func);
        upstream.register_consumer(&pipe.name, pipe.clone());
        pipe
    }

    /// Pipe name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last message sent downstream.
    pub fn cached(&self) -> Option<Message> {
        self.lock().cache.clone()
    }

    fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Consumer for Pipe {
    fn consume(&self, message: Message) {
        debug!(pipe = %self.name, prefix = %message.prefix, clean = message.clean, "Accepted message");
        let res = match &self.func {
            Some(func) => func(message),
            None => message,
        };
        let mut state = self.lock();
        state.cache = Some(res.clone());
        for consumer in &state.consumers {
            consumer.consume(res.clone());
        }
    }
}

impl Publisher for Pipe {
    fn register_consumer(&self, name: &str, consumer: Arc<dyn Consumer>) {
        let mut state = self.lock();
        state.consumers.push(Arc::clone(&consumer));
        info!(pipe = %self.name, consumer = %name, "Consumer registered");
        if let Some(cached) = state.cache.as_ref().filter(|m| m.clean) {
            consumer.consume(cached.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Producer, RecordingConsumer};
    use plinth_constraint::FlatMap;

    fn map(pairs: &[(&str, &str)]) -> FlatMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn advertise_only() -> PipeFn {
        Arc::new(|message: Message| {
            let data = message
                .data
                .into_iter()
                .filter(|(k, _)| k.ends_with(".advertise"))
                .collect();
            Message {
                prefix: "advertise".to_string(),
                clean: message.clean,
                data,
            }
        })
    }

    #[test]
    fn test_pipe_applies_function() {
        let producer = Producer::new("nodes");
        let pipe = Pipe::bind("advertise", &producer, Some(advertise_only()));
        let consumer = RecordingConsumer::new();
        pipe.register_consumer("test", consumer.clone());

        producer.replace(Some(map(&[
            ("node-1.advertise", "10.0.0.1:7654"),
            ("node-1.version", "1.0"),
        ])));

        assert_eq!(
            consumer.last(),
            Some(Message::clean(
                "advertise",
                map(&[("node-1.advertise", "10.0.0.1:7654")])
            ))
        );
    }

    #[test]
    fn test_pipe_replays_clean_cache_to_late_consumer() {
        let producer = Producer::new("nodes");
        let pipe = Pipe::bind("nodes", &producer, None);

        // Initial registration delivered a dirty snapshot; nothing to replay.
        let early = RecordingConsumer::new();
        pipe.register_consumer("early", early.clone());
        assert!(early.is_empty());

        producer.set(map(&[("a", "1")]));
        let late = RecordingConsumer::new();
        pipe.register_consumer("late", late.clone());
        assert_eq!(late.messages(), vec![Message::clean("nodes", map(&[("a", "1")]))]);
        assert_eq!(early.messages(), late.messages());
    }

    #[test]
    fn test_pipe_passthrough_keeps_dirty_state() {
        let pipe = Pipe::new("registry", None);
        let consumer = RecordingConsumer::new();
        pipe.register_consumer("test", consumer.clone());

        pipe.consume(Message::dirty("registry"));
        assert_eq!(consumer.messages(), vec![Message::dirty("registry")]);
        assert_eq!(pipe.cached(), Some(Message::dirty("registry")));
    }
}
