//! Consumer and publisher seams.

use std::sync::Arc;

use super::message::Message;

/// Receives snapshots from a producer.
///
/// Called synchronously by the producer while it holds its own lock, so
/// implementations must not block and must not call back into the
/// producer that notified them.
pub trait Consumer: Send + Sync + 'static {
    /// Called by the producer on every data change.
    fn consume(&self, message: Message);
}

impl<F> Consumer for F
where
    F: Fn(Message) + Send + Sync + 'static,
{
    fn consume(&self, message: Message) {
        self(message)
    }
}

/// Something consumers can subscribe to after construction.
pub trait Publisher: Send + Sync {
    /// Register a consumer under a name used for logging.
    fn register_consumer(&self, name: &str, consumer: Arc<dyn Consumer>);
}
