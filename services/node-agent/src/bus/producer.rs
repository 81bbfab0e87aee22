//! Keyed snapshot producer.

use std::sync::{Arc, Mutex, MutexGuard};

use plinth_constraint::FlatMap;
use tracing::{debug, info, trace};

use super::consumer::{Consumer, Publisher};
use super::message::Message;

/// Broadcasts a mutable flat snapshot to a dynamic set of consumers.
pub struct Producer {
    prefix: String,
    state: Mutex<ProducerState>,
}

#[derive(Default)]
struct ProducerState {
    data: FlatMap,
    active: bool,
    consumers: Vec<Arc<dyn Consumer>>,
}

impl ProducerState {
    fn message(&self, prefix: &str) -> Message {
        Message {
            prefix: prefix.to_string(),
            clean: self.active,
            data: self.data.clone(),
        }
    }
}

impl Producer {
    /// Create an inactive producer with an empty snapshot.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            state: Mutex::new(ProducerState::default()),
        }
    }

    /// Producer prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Message {
        self.lock().message(&self.prefix)
    }

    /// Replace the snapshot. `None` deactivates the producer.
    pub fn replace(&self, data: Option<FlatMap>) {
        let mut state = self.lock();
        state.active = data.is_some();
        state.data = data.unwrap_or_default();
        self.notify(&state);
    }

    /// Replace the snapshot with an explicit state flag.
    pub fn store(&self, active: bool, data: FlatMap) {
        let mut state = self.lock();
        state.active = active;
        state.data = data;
        self.notify(&state);
    }

    /// Merge `data` into the snapshot and activate the producer.
    pub fn set(&self, data: FlatMap) {
        self.put(true, data);
    }

    /// Merge `data` into the snapshot key by key.
    pub fn put(&self, active: bool, data: FlatMap) {
        let mut state = self.lock();
        state.active = active;
        state.data.extend(data);
        self.notify(&state);
    }

    /// Remove `keys` from the snapshot.
    pub fn delete<I, K>(&self, active: bool, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let mut state = self.lock();
        state.active = active;
        for key in keys {
            state.data.remove(key.as_ref());
        }
        self.notify(&state);
    }

    fn notify(&self, state: &ProducerState) {
        trace!(
            prefix = %self.prefix,
            consumers = state.consumers.len(),
            "Syncing consumers"
        );
        let message = state.message(&self.prefix);
        for consumer in &state.consumers {
            consumer.consume(message.clone());
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProducerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Publisher for Producer {
    fn register_consumer(&self, name: &str, consumer: Arc<dyn Consumer>) {
        let mut state = self.lock();
        state.consumers.push(Arc::clone(&consumer));
        info!(prefix = %self.prefix, consumer = %name, "Consumer registered");
        let message = state.message(&self.prefix);
        debug!(prefix = %self.prefix, clean = message.clean, "Delivering initial snapshot");
        consumer.consume(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::RecordingConsumer;
    use proptest::prelude::*;

    fn map(pairs: &[(&str, &str)]) -> FlatMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_register_delivers_current_snapshot() {
        let producer = Producer::new("meta");
        let early = RecordingConsumer::new();
        producer.register_consumer("early", early.clone());
        assert_eq!(early.messages(), vec![Message::dirty("meta")]);

        producer.set(map(&[("zone", "eu")]));

        let late = RecordingConsumer::new();
        producer.register_consumer("late", late.clone());
        assert_eq!(
            late.messages(),
            vec![Message::clean("meta", map(&[("zone", "eu")]))]
        );
        assert_eq!(early.len(), 2);
    }

    #[test]
    fn test_mutators() {
        let producer = Producer::new("agent");
        let consumer = RecordingConsumer::new();
        producer.register_consumer("test", consumer.clone());

        producer.replace(Some(map(&[("id", "a"), ("drain", "false")])));
        producer.put(true, map(&[("drain", "true")]));
        producer.delete(true, ["id"]);
        producer.replace(None);
        producer.store(false, map(&[("id", "b")]));

        let messages = consumer.messages();
        assert_eq!(messages.len(), 6);
        assert_eq!(
            messages[1],
            Message::clean("agent", map(&[("id", "a"), ("drain", "false")]))
        );
        assert_eq!(
            messages[2],
            Message::clean("agent", map(&[("id", "a"), ("drain", "true")]))
        );
        assert_eq!(messages[3], Message::clean("agent", map(&[("drain", "true")])));
        assert_eq!(messages[4], Message::dirty("agent"));
        assert_eq!(
            messages[5],
            Message {
                prefix: "agent".to_string(),
                clean: false,
                data: map(&[("id", "b")]),
            }
        );
    }

    #[test]
    fn test_consumers_notified_in_registration_order() {
        let producer = Producer::new("meta");
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            producer.register_consumer(
                name,
                Arc::new(move |_: Message| order.lock().unwrap().push(name)),
            );
        }
        order.lock().unwrap().clear();
        producer.set(map(&[("k", "v")]));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Set(String, String),
        Delete(String),
        Replace(Option<Vec<(String, String)>>),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        let key = "[a-c]";
        prop_oneof![
            (key, "[a-z]{0,3}").prop_map(|(k, v)| Op::Set(k, v)),
            key.prop_map(Op::Delete),
            proptest::option::of(proptest::collection::vec((key, "[a-z]{0,3}"), 0..3))
                .prop_map(Op::Replace),
        ]
    }

    proptest! {
        #[test]
        fn prop_last_message_matches_final_state(ops in proptest::collection::vec(op_strategy(), 0..20)) {
            let producer = Producer::new("p");
            let consumer = RecordingConsumer::new();
            producer.register_consumer("c", consumer.clone());

            for op in &ops {
                match op {
                    Op::Set(k, v) => producer.set(FlatMap::from([(k.clone(), v.clone())])),
                    Op::Delete(k) => producer.delete(true, [k]),
                    Op::Replace(data) => producer.replace(data.clone().map(|d| d.into_iter().collect())),
                }
            }

            prop_assert_eq!(consumer.len(), ops.len() + 1);
            prop_assert_eq!(consumer.last(), Some(producer.snapshot()));
        }
    }
}
