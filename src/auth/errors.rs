//! # Auth Errors
//!
//! Error types for the authorization module.

use thiserror::Error;

/// Result type for auth operations
pub type AuthResult<T> = Result<T, AuthError>;

/// Authentication and authorization errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    // ==================
    // Token Errors
    // ==================
    /// JWT token is malformed
    #[error("Malformed token")]
    MalformedToken,

    /// JWT token has expired
    #[error("Token expired")]
    TokenExpired,

    /// JWT signature is invalid
    #[error("Invalid token signature")]
    InvalidSignature,

    /// Token could not be signed
    #[error("Failed to generate token")]
    TokenGenerationFailed,

    // ==================
    // Access Errors
    // ==================
    /// The policy denied the operation
    #[error("Not authorized to {operation} {model}")]
    Unauthorized {
        model: String,
        operation: String,
        /// Whether the caller presented a valid identity
        authenticated: bool,
    },
}

impl AuthError {
    /// Whether the error concerns the token rather than the policy
    pub fn is_token_error(&self) -> bool {
        !matches!(self, AuthError::Unauthorized { .. })
    }
}
