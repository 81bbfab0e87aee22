//! Constraint evaluation for node metadata.
//!
//! This library provides the small evaluation language used by the node
//! agent to decide whether a workload may run on a node:
//!
//! - **Flat maps**: ordered `namespace.key -> value` environments.
//! - **Interpolation**: `${namespace.key}` substitution with optional
//!   `${namespace.key|default}` fallbacks.
//! - **Constraints**: template pairs compared with `=`, `!=`, `<`, `<=`,
//!   `>`, `>=`, `~` (contains all) and `!~` (contains none).
//!
//! # Invariants
//!
//! - Evaluation is deterministic and free of side effects
//! - Unresolved references are left literal
//! - An empty constraint always succeeds

mod constraint;
mod env;
mod error;

pub use constraint::{Constraint, Operator};
pub use env::{content_hash, extract_refs, interpolate, merge_maps, with_json, FlatMap};
pub use error::ConstraintError;
