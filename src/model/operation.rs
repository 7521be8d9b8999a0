//! Model operations
//!
//! Every model call routes through this enum; its name is what ACL
//! rules and event handlers see.

use serde::{Deserialize, Serialize};

use crate::auth::AccessType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    FindMany,
    FindOne,
    FindById,
    Count,
    Create,
    UpdateById,
    DeleteById,
    DeleteMany,
}

impl Operation {
    /// Operation name for ACL properties and logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::FindMany => "findMany",
            Self::FindOne => "findOne",
            Self::FindById => "findById",
            Self::Count => "count",
            Self::Create => "create",
            Self::UpdateById => "updateById",
            Self::DeleteById => "deleteById",
            Self::DeleteMany => "deleteMany",
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Self::Create | Self::UpdateById | Self::DeleteById | Self::DeleteMany
        )
    }

    pub fn access_type(&self) -> AccessType {
        if self.is_write() {
            AccessType::Write
        } else {
            AccessType::Read
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
