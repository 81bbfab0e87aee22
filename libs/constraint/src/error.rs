//! Error types for constraint evaluation.

use thiserror::Error;

/// Errors returned by [`crate::Constraint::check`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConstraintError {
    /// A constraint pair did not hold against the environment.
    #[error("constraint failed {left} != {right} ({raw_left}:{raw_right})")]
    Unsatisfied {
        /// Interpolated left side.
        left: String,
        /// Interpolated right side.
        right: String,
        /// Left template as declared.
        raw_left: String,
        /// Right template as declared.
        raw_right: String,
    },

    /// A hard gate rejected every resource (for example drain mode).
    #[error("required constraint of {source_prefix} failed: {cause}")]
    Required {
        source_prefix: String,
        cause: Box<ConstraintError>,
    },
}

impl ConstraintError {
    /// Returns true if this error comes from a required source gate.
    pub fn is_required(&self) -> bool {
        matches!(self, ConstraintError::Required { .. })
    }
}
