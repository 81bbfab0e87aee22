//! Producer/consumer fabric for flat metadata snapshots.
//!
//! Every data source in the agent is a [`Producer`] broadcasting a
//! [`Message`] to its registered [`Consumer`]s. [`Pipe`]s reshape messages
//! between a publisher and its audiences.
//!
//! ## Delivery model
//!
//! - Registration immediately delivers the current snapshot
//! - Mutations notify consumers synchronously, in registration order
//! - There is no queue: a consumer only ever sees the latest snapshot
//!
//! Consumers must return quickly. Slow consumers hand the message off to
//! their own task.

mod consumer;
mod message;
mod pipe;
mod producer;
#[cfg(test)]
mod testing;

pub use consumer::{Consumer, Publisher};
pub use message::Message;
pub use pipe::{Pipe, PipeFn};
pub use producer::Producer;
#[cfg(test)]
pub(crate) use testing::RecordingConsumer;
