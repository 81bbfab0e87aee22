//! Actor framework for the node agent.
//!
//! A lightweight actor runtime for loops that own mutable state and are fed
//! through a bounded mailbox.
//!
//! ## Design Principles
//!
//! - **One owner per state**: each actor owns its state, nobody else touches it
//! - **Sequential handling**: messages are processed one at a time, in order
//! - **Supervised shutdown**: every actor stops on the agent-wide shutdown signal
//!
//! ## Actor Types
//!
//! - `KvWriter`: replays pending KV writes against the connected store

mod framework;

pub use framework::{stop_requested, Actor, ActorContext, ActorError, ActorHandle, Supervisor};
