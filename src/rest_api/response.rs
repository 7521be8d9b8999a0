//! # Response Formatting
//!
//! Standard response types for REST API.

use serde::Serialize;
use serde_json::Value;

use crate::datasource::DeleteResult;
use crate::model::Instance;

/// Count response
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CountResponse {
    pub count: i64,
}

/// Delete response
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DeleteResponse {
    pub deleted: i64,
}

impl From<DeleteResult> for DeleteResponse {
    fn from(result: DeleteResult) -> Self {
        Self {
            deleted: result.deleted_count,
        }
    }
}

/// Render a list of instances
pub fn list_body(instances: &[Instance]) -> Value {
    Value::Array(instances.iter().map(Instance::to_json).collect())
}
