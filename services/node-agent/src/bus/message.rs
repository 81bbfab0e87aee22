//! Snapshot messages exchanged between producers and consumers.

use plinth_constraint::FlatMap;

/// Snapshot of one producer.
///
/// `clean == false` means the source is currently unknown or unavailable and
/// `data` must not be treated as authoritative.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Producer prefix.
    pub prefix: String,

    /// Producer state.
    pub clean: bool,

    /// Message payload.
    pub data: FlatMap,
}

impl Message {
    /// Create a clean message with the given payload.
    pub fn clean(prefix: impl Into<String>, data: FlatMap) -> Self {
        Self {
            prefix: prefix.into(),
            clean: true,
            data,
        }
    }

    /// Create a dirty message with an empty payload.
    pub fn dirty(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            clean: false,
            data: FlatMap::new(),
        }
    }
}
