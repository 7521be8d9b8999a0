//! # Access Control
//!
//! Declarative per-model rules and their evaluation.
//!
//! A rule grants or denies an access type to a role. Rules naming the
//! operation in `property` override wildcard rules; among the rules that
//! remain, the model's policy effect decides. No matching rule denies.

use bson::Bson;
use serde::{Deserialize, Serialize};

use super::errors::{AuthError, AuthResult};
use super::principal::Principal;
use crate::model::{ModelConfig, Operation};
use crate::value::key_fragment;

/// Built-in role matching every caller
pub const EVERYONE: &str = "$everyone";
/// Built-in role matching callers with a valid identity
pub const AUTHENTICATED: &str = "$authenticated";
/// Built-in role matching anonymous callers
pub const UNAUTHENTICATED: &str = "$unauthenticated";
/// Built-in role matching the owner of the target document
pub const OWNER: &str = "$owner";

const WILDCARD: &str = "*";

/// Kind of access an operation needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessType {
    #[serde(rename = "READ")]
    Read,
    #[serde(rename = "WRITE")]
    Write,
    #[serde(rename = "*")]
    All,
}

impl AccessType {
    fn covers(self, needed: AccessType) -> bool {
        self == AccessType::All || self == needed
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrincipalType {
    #[default]
    #[serde(rename = "ROLE")]
    Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "ALLOW")]
    Allow,
    #[serde(rename = "DENY")]
    Deny,
}

/// How conflicting matches resolve
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PolicyEffect {
    #[default]
    DenyOverrides,
    AllowOverrides,
}

/// One ACL entry of a model definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AclRule {
    #[serde(default = "default_access_type")]
    pub access_type: AccessType,

    #[serde(default)]
    pub principal_type: PrincipalType,

    pub principal_id: String,

    pub permission: Permission,

    /// `*` or an operation name
    #[serde(default = "default_property")]
    pub property: String,
}

fn default_access_type() -> AccessType {
    AccessType::All
}

fn default_property() -> String {
    WILDCARD.to_string()
}

/// Access decisions for one model
#[derive(Debug, Clone)]
pub struct Authorizer {
    model: String,
    rules: Vec<AclRule>,
    effect: PolicyEffect,
    owner_key: String,
}

impl Authorizer {
    pub fn from_config(config: &ModelConfig) -> Self {
        Self {
            model: config.name.clone(),
            rules: config.acls.clone(),
            effect: config.policy_effect,
            owner_key: config.owner_key(),
        }
    }

    /// Field holding the owner's user id
    pub fn owner_key(&self) -> &str {
        &self.owner_key
    }

    /// Whether any rule refers to the owner of a document
    pub fn needs_owner(&self) -> bool {
        self.rules.iter().any(|rule| rule.principal_id == OWNER)
    }

    /// Decide whether `principal` may run `operation`.
    ///
    /// `owner` is the owner-key value of the target document, when known.
    pub fn authorize(
        &self,
        principal: &Principal,
        operation: Operation,
        owner: Option<&Bson>,
    ) -> AuthResult<()> {
        if principal.system || self.rules.is_empty() {
            return Ok(());
        }

        let name = operation.name();
        let needed = operation.access_type();
        let matching: Vec<&AclRule> = self
            .rules
            .iter()
            .filter(|rule| rule.access_type.covers(needed))
            .filter(|rule| rule.property == WILDCARD || rule.property == name)
            .filter(|rule| principal_matches(&rule.principal_id, principal, owner))
            .collect();

        let specific: Vec<&AclRule> = matching
            .iter()
            .copied()
            .filter(|rule| rule.property == name)
            .collect();
        let decisive = if specific.is_empty() { matching } else { specific };

        let allowed = match self.effect {
            _ if decisive.is_empty() => false,
            PolicyEffect::DenyOverrides => decisive
                .iter()
                .all(|rule| rule.permission == Permission::Allow),
            PolicyEffect::AllowOverrides => decisive
                .iter()
                .any(|rule| rule.permission == Permission::Allow),
        };

        if allowed {
            Ok(())
        } else {
            Err(AuthError::Unauthorized {
                model: self.model.clone(),
                operation: name.to_string(),
                authenticated: principal.is_authenticated(),
            })
        }
    }
}

fn principal_matches(role: &str, principal: &Principal, owner: Option<&Bson>) -> bool {
    match role {
        EVERYONE => true,
        AUTHENTICATED => principal.is_authenticated(),
        UNAUTHENTICATED => !principal.is_authenticated(),
        OWNER => match (&principal.user_id, owner) {
            (Some(user_id), Some(owner)) => key_fragment(Some(owner)) == *user_id,
            _ => false,
        },
        other => principal.has_role(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn authorizer(acls: serde_json::Value) -> Authorizer {
        let config: ModelConfig = serde_json::from_value(json!({
            "name": "Note",
            "acls": acls,
        }))
        .unwrap();
        Authorizer::from_config(&config)
    }

    #[test]
    fn test_no_rules_permits_everything() {
        let auth = authorizer(json!([]));
        assert!(auth
            .authorize(&Principal::anonymous(), Operation::DeleteMany, None)
            .is_ok());
    }

    #[test]
    fn test_no_match_denies() {
        let auth = authorizer(json!([
            {"accessType": "READ", "principalId": "$authenticated", "permission": "ALLOW"}
        ]));
        let err = auth
            .authorize(&Principal::anonymous(), Operation::FindMany, None)
            .unwrap_err();
        assert_eq!(
            err,
            AuthError::Unauthorized {
                model: "Note".into(),
                operation: "findMany".into(),
                authenticated: false,
            }
        );
        assert!(auth
            .authorize(&Principal::user("u1", vec![]), Operation::FindMany, None)
            .is_ok());
    }

    #[test]
    fn test_deny_overrides_by_default() {
        let auth = authorizer(json!([
            {"principalId": "$everyone", "permission": "ALLOW"},
            {"accessType": "WRITE", "principalId": "$unauthenticated", "permission": "DENY"}
        ]));
        let anon = Principal::anonymous();
        assert!(auth.authorize(&anon, Operation::FindById, None).is_ok());
        assert!(auth.authorize(&anon, Operation::Create, None).is_err());
    }

    #[test]
    fn test_allow_overrides() {
        let config: ModelConfig = serde_json::from_value(json!({
            "name": "Note",
            "policyEffect": "allowOverrides",
            "acls": [
                {"principalId": "$everyone", "permission": "DENY"},
                {"principalId": "editor", "permission": "ALLOW"}
            ],
        }))
        .unwrap();
        let auth = Authorizer::from_config(&config);

        let editor = Principal::user("u1", vec!["editor".into()]);
        assert!(auth.authorize(&editor, Operation::UpdateById, None).is_ok());
        assert!(auth
            .authorize(&Principal::user("u2", vec![]), Operation::UpdateById, None)
            .is_err());
    }

    #[test]
    fn test_operation_rule_overrides_wildcard() {
        let auth = authorizer(json!([
            {"principalId": "$everyone", "permission": "DENY"},
            {"principalId": "$everyone", "permission": "ALLOW", "property": "count"}
        ]));
        let anon = Principal::anonymous();
        assert!(auth.authorize(&anon, Operation::Count, None).is_ok());
        assert!(auth.authorize(&anon, Operation::FindMany, None).is_err());
    }

    #[test]
    fn test_owner_rule() {
        let auth = authorizer(json!([
            {"principalId": "$owner", "permission": "ALLOW"}
        ]));
        assert!(auth.needs_owner());

        let user = Principal::user("u1", vec![]);
        let owner = Bson::String("u1".into());
        let stranger = Bson::String("u2".into());
        assert!(auth.authorize(&user, Operation::UpdateById, Some(&owner)).is_ok());
        assert!(auth
            .authorize(&user, Operation::UpdateById, Some(&stranger))
            .is_err());
        assert!(auth.authorize(&user, Operation::UpdateById, None).is_err());
    }

    #[test]
    fn test_system_bypasses_rules() {
        let auth = authorizer(json!([
            {"principalId": "$everyone", "permission": "DENY"}
        ]));
        assert!(auth
            .authorize(&Principal::system(), Operation::DeleteById, None)
            .is_ok());
    }
}
