//! Bearer token authentication.
//!
//! Routes flagged `auth_required` only reach their backend with a valid
//! `Authorization: Bearer <jwt>` header. On success the token's `user_id`
//! claim becomes the caller's identity and is forwarded as `X-User-ID`.
//!
//! # Verification Rules
//!
//! - Signature: HMAC (HS256, HS384 or HS512) with the shared secret from
//!   `JWT_SECRET_KEY`. A token whose header names any other algorithm is
//!   rejected before signature checking, which shuts out algorithm-confusion
//!   attacks against the symmetric key.
//! - `exp` and `nbf` are enforced when present but not required.
//! - `user_id` must be a non-empty string.
//!
//! Failure reasons are logged at debug level only; clients see a generic
//! message and `WWW-Authenticate: Bearer`.

use std::sync::Arc;

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::AuthError;

const HMAC_ALGORITHMS: [Algorithm; 3] = [Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];

/// Verified caller identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    /// Rate-limit tier named by the token's `tier` claim, if any.
    pub tier: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    user_id: Option<Value>,
    #[serde(default)]
    tier: Option<Value>,
}

/// Validates bearer tokens against a shared HMAC secret.
#[derive(Clone)]
pub struct AuthGuard {
    key: Arc<DecodingKey>,
    validation: Arc<Validation>,
}

impl AuthGuard {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = HMAC_ALGORITHMS.to_vec();
        validation.required_spec_claims.clear();
        validation.validate_nbf = true;
        validation.validate_aud = false;

        Self {
            key: Arc::new(DecodingKey::from_secret(secret.as_bytes())),
            validation: Arc::new(validation),
        }
    }

    /// Authenticate a request from its headers.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AuthError> {
        let token = bearer_token(headers)?;

        let header = jsonwebtoken::decode_header(token).map_err(|e| {
            debug!(error = %e, "Malformed token header");
            AuthError::InvalidToken
        })?;
        if !HMAC_ALGORITHMS.contains(&header.alg) {
            debug!(alg = ?header.alg, "Rejected token with non-HMAC algorithm");
            return Err(AuthError::DisallowedAlgorithm);
        }

        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation).map_err(
            |e| {
                debug!(error = %e, "Token verification failed");
                match e.kind() {
                    ErrorKind::InvalidAlgorithm => AuthError::DisallowedAlgorithm,
                    _ => AuthError::InvalidToken,
                }
            },
        )?;

        let user_id = match data.claims.user_id {
            Some(Value::String(id)) if !id.is_empty() => id,
            _ => return Err(AuthError::MissingUserId),
        };
        let tier = match data.claims.tier {
            Some(Value::String(tier)) if !tier.is_empty() => Some(tier),
            _ => None,
        };

        Ok(Principal { user_id, tier })
    }
}

/// Pull the token out of `Authorization: Bearer <token>`.
fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingHeader)?
        .to_str()
        .map_err(|_| AuthError::InvalidScheme)?;

    match value.split_once(' ') {
        Some(("Bearer", token)) if !token.is_empty() && !token.contains(' ') => Ok(token),
        _ => Err(AuthError::InvalidScheme),
    }
}
