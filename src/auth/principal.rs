//! # Principal
//!
//! The caller identity carried by every operation.

use serde::{Deserialize, Serialize};

/// Authenticated subject of a request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// The authenticated user's id (None if anonymous)
    pub user_id: Option<String>,

    /// Role names granted to the caller
    pub roles: Vec<String>,

    /// System principals bypass authorization
    pub system: bool,
}

impl Principal {
    /// Principal for anonymous access
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Principal for an authenticated user
    pub fn user(user_id: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            roles,
            system: false,
        }
    }

    /// Principal for internal calls
    pub fn system() -> Self {
        Self {
            user_id: None,
            roles: Vec::new(),
            system: true,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.system || self.user_id.is_some()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_is_not_authenticated() {
        let principal = Principal::anonymous();
        assert!(!principal.is_authenticated());
        assert!(!principal.system);
    }

    #[test]
    fn test_system_counts_as_authenticated() {
        assert!(Principal::system().is_authenticated());
    }

    #[test]
    fn test_roles() {
        let principal = Principal::user("u1", vec!["admin".into()]);
        assert!(principal.has_role("admin"));
        assert!(!principal.has_role("editor"));
    }
}
