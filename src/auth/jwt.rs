//! # Bearer Tokens
//!
//! HS256 JSON Web Token decoding into a `Principal`, plus signing for
//! tooling and tests.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use super::errors::{AuthError, AuthResult};
use super::principal::Principal;

/// Claims carried by bearer tokens
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BearerClaims {
    /// User id; `sub` is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,

    #[serde(default)]
    pub roles: Vec<String>,

    #[serde(default)]
    pub system: bool,

    /// Expiration timestamp (Unix epoch seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

impl BearerClaims {
    pub fn into_principal(self) -> Principal {
        Principal {
            user_id: self.user_id.or(self.sub),
            roles: self.roles,
            system: self.system,
        }
    }
}

/// Signs and validates bearer tokens with a shared secret
#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtManager {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Validate a token and extract the principal
    pub fn decode(&self, token: &str) -> AuthResult<Principal> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        validation.validate_exp = true;

        let token_data =
            decode::<BearerClaims>(token, &self.decoding_key, &validation).map_err(|e| {
                match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                    jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                        AuthError::InvalidSignature
                    }
                    _ => AuthError::MalformedToken,
                }
            })?;

        Ok(token_data.claims.into_principal())
    }

    /// Sign a token for `principal`, valid for `ttl`
    pub fn sign(&self, principal: &Principal, ttl: Duration) -> AuthResult<String> {
        let claims = BearerClaims {
            user_id: principal.user_id.clone(),
            sub: principal.user_id.clone(),
            roles: principal.roles.clone(),
            system: principal.system,
            exp: Some((Utc::now() + ttl).timestamp()),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|_| AuthError::TokenGenerationFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> JwtManager {
        JwtManager::new("test_secret_key_for_testing_only")
    }

    #[test]
    fn test_sign_and_decode() {
        let manager = manager();
        let principal = Principal::user("u1", vec!["admin".into()]);
        let token = manager.sign(&principal, Duration::minutes(5)).unwrap();

        assert_eq!(manager.decode(&token).unwrap(), principal);
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let token = manager()
            .sign(&Principal::user("u1", vec![]), Duration::minutes(5))
            .unwrap();
        let other = JwtManager::new("another_secret");

        assert_eq!(other.decode(&token).unwrap_err(), AuthError::InvalidSignature);
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let token = manager()
            .sign(&Principal::user("u1", vec![]), Duration::minutes(-10))
            .unwrap();

        assert_eq!(manager().decode(&token).unwrap_err(), AuthError::TokenExpired);
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert_eq!(manager().decode("not.a.jwt").unwrap_err(), AuthError::MalformedToken);
    }

    #[test]
    fn test_sub_fallback() {
        let claims = BearerClaims {
            sub: Some("from-sub".into()),
            ..Default::default()
        };
        assert_eq!(claims.into_principal().user_id.as_deref(), Some("from-sub"));
    }
}
