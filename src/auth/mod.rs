//! # Auth Module
//!
//! Caller identity and per-model access control.
//!
//! Bearer tokens decode into a `Principal`; each model's ACL rules
//! compile into an `Authorizer` consulted from the model's
//! `before_load` and `before_save` hooks.

pub mod acl;
pub mod errors;
pub mod jwt;
pub mod principal;

pub use acl::{AccessType, AclRule, Authorizer, Permission, PolicyEffect, PrincipalType};
pub use errors::{AuthError, AuthResult};
pub use jwt::{BearerClaims, JwtManager};
pub use principal::Principal;
