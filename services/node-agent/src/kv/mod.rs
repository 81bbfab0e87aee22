//! Public namespace backed by a distributed KV store.
//!
//! The [`Backend`] connects through a [`Connector`], mirrors watched subtrees
//! into consumers and writes announcements back. Stores plug in behind the
//! [`Store`] trait: [`ConsulStore`] for production, [`MemoryStore`] for tests
//! and single-node setups.

mod announcer;
mod backend;
mod consul;
mod endpoint;
mod memory;
mod store;
mod writer;

pub use announcer::Announcer;
pub use backend::{Backend, BackendConfig, Connection, ConnectionState, KvError};
pub use consul::{ConsulConnector, ConsulStore};
pub use endpoint::{join_key, Endpoint};
pub use memory::{MemoryConnector, MemoryStore};
pub use store::{Connector, KvPair, Store, StoreError};
pub use writer::{KvOp, KvWriter, WriterMessage, WRITER_MAILBOX};
