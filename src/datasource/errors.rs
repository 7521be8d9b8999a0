//! Datasource error types

use std::time::Duration;

use mongodb::error::{ErrorKind, WriteFailure};
use thiserror::Error;

use crate::memorykv::KvError;

/// Result type for connector operations
pub type DatasourceResult<T> = Result<T, DatasourceError>;

/// Connector and datasource errors
#[derive(Debug, Error)]
pub enum DatasourceError {
    #[error("invalid connector {0}")]
    InvalidConnector(String),

    #[error("client is disconnected")]
    Disconnected,

    #[error("document not found")]
    NotFound,

    /// A create reused an identifier already present in the collection
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Malformed `whereLookups` passed to a bulk delete
    #[error("{0}")]
    BadLookup(&'static str),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("{operation} is not supported by the {connector} connector")]
    Unsupported {
        connector: &'static str,
        operation: &'static str,
    },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("driver error: {0}")]
    Driver(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error(transparent)]
    Kv(#[from] KvError),
}

/// Server error code for a unique index violation
const DUPLICATE_KEY_CODE: i32 = 11000;

impl From<mongodb::error::Error> for DatasourceError {
    fn from(err: mongodb::error::Error) -> Self {
        if let ErrorKind::Write(WriteFailure::WriteError(write)) = err.kind.as_ref() {
            if write.code == DUPLICATE_KEY_CODE {
                return Self::DuplicateKey(write.message.clone());
            }
        }
        Self::Driver(err.to_string())
    }
}

impl From<bson::ser::Error> for DatasourceError {
    fn from(err: bson::ser::Error) -> Self {
        Self::Encoding(err.to_string())
    }
}

impl From<bson::de::Error> for DatasourceError {
    fn from(err: bson::de::Error) -> Self {
        Self::Encoding(err.to_string())
    }
}
