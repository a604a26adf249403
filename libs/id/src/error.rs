use thiserror::Error;

/// Why a string was not accepted as an id.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("id is empty")]
    Empty,

    /// A well-formed id of another kind, e.g. a node id passed as a server id.
    #[error("expected a '{expected}' id, got '{found}'")]
    WrongKind {
        expected: &'static str,
        found: String,
    },

    #[error("malformed id '{id}': {reason}")]
    Malformed { id: String, reason: String },
}

impl IdError {
    pub fn is_wrong_kind(&self) -> bool {
        matches!(self, IdError::WrongKind { .. })
    }
}
