//! plinth Node Agent Library
//!
//! The node agent runs on every cluster node and keeps local scheduling
//! decisions consistent with changing facts: node metadata, drain mode, pod
//! allocations and the peer nodes announced in the cluster KV store.
//!
//! ## Architecture
//!
//! ```text
//! Producers (agent, meta, allocation)  ──┐
//! KV backend ── nodes pipe  ─────────────┼──> Manager ──> managed resources
//!                                        │
//! agent ── Announcer ──> KV backend (nodes/<id>, TTL)
//! ```
//!
//! ## Modules
//!
//! - `actors`: Actor framework (hosts the KV writer)
//! - `bus`: Producer/consumer fabric and pipes
//! - `metadata`: Manager and metadata sources
//! - `kv`: Distributed KV backend and stores

pub mod actors;
pub mod agent;
pub mod bus;
pub mod config;
pub mod kv;
pub mod metadata;

// Re-export commonly used types
pub use agent::{Agent, PRIVATE_NAMESPACE, PUBLIC_NAMESPACE};
pub use bus::{Consumer, Message, Pipe, Producer, Publisher};
pub use config::Config;
pub use kv::{Backend, BackendConfig};
pub use metadata::{Evaluation, ManagedResource, Manager, ManagerSource};
