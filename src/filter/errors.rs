//! Filter error types

use thiserror::Error;

/// Result type for filter parsing and compilation
pub type FilterResult<T> = Result<T, FilterError>;

/// Filter errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("invalid filter: {0}")]
    Invalid(String),

    /// The same relation edge appears twice on one include path
    #[error("include cycle detected at {model}.{relation}")]
    IncludeCycle { model: String, relation: String },

    #[error("model {model} has no relation {relation}")]
    UnknownRelation { model: String, relation: String },

    #[error("unknown model {0}")]
    UnknownModel(String),
}

impl FilterError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        FilterError::Invalid(message.into())
    }
}
