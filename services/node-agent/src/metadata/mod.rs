//! Node metadata sources and constraint arbitration.
//!
//! - `Manager`: aggregates sources and evaluates managed resources
//! - `Allocations`: per-pod allocation reports exposed as metadata
//! - `nodes_pipe`: reshapes node announcements stored in the KV backend

mod allocation;
mod manager;
mod nodes;

pub use allocation::{AllocationReport, Allocations};
pub use manager::{
    Evaluation, ManagedResource, Manager, ManagerError, ManagerSource, ResourceCallback,
};
pub use nodes::nodes_pipe;
