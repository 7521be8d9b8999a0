//! # Model Errors
//!
//! The operation-boundary error. Every lower-level error converts into
//! `ModelError`, which carries the stable code and HTTP status clients see.

use thiserror::Error;

use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::datasource::DatasourceError;
use crate::filter::FilterError;

/// Result type for model operations
pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Debug, Error)]
pub enum ModelError {
    // ==================
    // Wrapped Errors
    // ==================
    #[error(transparent)]
    Datasource(#[from] DatasourceError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    // ==================
    // Operation Errors
    // ==================
    #[error("{model} {id} not found")]
    NotFound { model: String, id: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("cache datasource {datasource} of {model} is not a memorykv connector")]
    CacheUnsupported { model: String, datasource: String },

    #[error("{operation} handler produced {found}, expected {expected}")]
    TypeMismatch {
        operation: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    #[error("{model}.{relation} returned more than one {target} document for {id}")]
    DuplicateRelated {
        model: String,
        relation: String,
        target: String,
        id: String,
    },

    #[error("{event} handler panicked: {message}")]
    HandlerPanic { event: String, message: String },

    #[error("internal error: {0}")]
    Internal(String),

    // ==================
    // Registry Errors
    // ==================
    #[error("model {0} used before the registry was resolved")]
    NotResolved(String),

    #[error("unknown model {0}")]
    UnknownModel(String),

    #[error("model {0} is defined twice")]
    DuplicateModel(String),

    #[error("relation {model}.{relation} targets unknown model {target}")]
    UnresolvedRelation {
        model: String,
        relation: String,
        target: String,
    },

    #[error("model {model} refers to unknown datasource {datasource}")]
    UnknownDatasource { model: String, datasource: String },
}

impl ModelError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Stable error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            Self::Datasource(e) => match e {
                DatasourceError::InvalidConnector(_) => "INVALID_CONNECTOR",
                DatasourceError::Disconnected => "DISCONNECTED",
                DatasourceError::NotFound => "NOT_FOUND",
                DatasourceError::DuplicateKey(_) => "INVALID_INPUT",
                DatasourceError::BadLookup(_) => "BAD_DELETE_LOOKUP",
                DatasourceError::InvalidQuery(_) => "INVALID_FILTER",
                _ => "INTERNAL",
            },
            Self::Filter(FilterError::IncludeCycle { .. }) => "INCLUDE_CYCLE",
            Self::Filter(_) => "INVALID_FILTER",
            Self::Auth(_) => "UNAUTHORIZED",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::CacheUnsupported { .. } => "CACHE_UNSUPPORTED",
            Self::TypeMismatch { .. } => "TYPE_MISMATCH",
            Self::UnknownDatasource { .. } => "INVALID_CONNECTOR",
            Self::NotResolved(_)
            | Self::UnknownModel(_)
            | Self::DuplicateModel(_)
            | Self::UnresolvedRelation { .. } => "NOT_RESOLVED",
            Self::Config(_)
            | Self::DuplicateRelated { .. }
            | Self::HandlerPanic { .. }
            | Self::Internal(_) => "INTERNAL",
        }
    }

    /// HTTP status for API responses
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Auth(AuthError::Unauthorized {
                authenticated: true,
                ..
            }) => 403,
            Self::Auth(_) => 401,
            _ => match self.code() {
                "NOT_FOUND" => 404,
                "INVALID_FILTER" | "INCLUDE_CYCLE" | "INVALID_INPUT" | "BAD_DELETE_LOOKUP" => 400,
                "DISCONNECTED" => 503,
                _ => 500,
            },
        }
    }
}
