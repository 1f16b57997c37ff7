//! Bearer-credential verification.
//!
//! Credential issuance lives in a separate identity service; this side only
//! verifies an opaque bearer credential into `{subject, role}` and gates
//! order submission on it.

use crate::{errors::ServiceError, AppState};
use axum::extract::{FromRef, FromRequestParts};
use http::request::Parts;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject identifier (shopper or staff id)
    pub sub: String,
    /// Coarse role: "shopper" or "operator"
    pub role: String,
    /// Expiry as a unix timestamp
    pub exp: usize,
}

/// A verified credential, extracted from the `Authorization` header.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub subject: String,
    pub role: String,
}

impl AuthenticatedUser {
    pub fn is_operator(&self) -> bool {
        self.role == "operator"
    }

    pub fn require_operator(&self) -> Result<(), ServiceError> {
        if self.is_operator() {
            Ok(())
        } else {
            Err(ServiceError::Forbidden(
                "operator role required".to_string(),
            ))
        }
    }
}

#[derive(Clone)]
pub struct AuthService {
    decoding_key: DecodingKey,
    encoding_key: EncodingKey,
}

impl AuthService {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Verifies a bearer credential, returning the subject and role.
    pub fn verify(&self, token: &str) -> Result<AuthenticatedUser, ServiceError> {
        let data = decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map_err(|e| ServiceError::Unauthorized(format!("invalid credential: {}", e)))?;

        Ok(AuthenticatedUser {
            subject: data.claims.sub,
            role: data.claims.role,
        })
    }

    /// Mints a credential. Exposed for tests and local tooling; production
    /// credentials come from the identity service.
    pub fn issue(&self, subject: &str, role: &str, ttl_secs: i64) -> Result<String, ServiceError> {
        let claims = Claims {
            sub: subject.to_string(),
            role: role.to_string(),
            exp: (chrono::Utc::now().timestamp() + ttl_secs) as usize,
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| ServiceError::Unauthorized(format!("could not issue token: {}", e)))
    }
}

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
    AppState: FromRef<S>,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let state = AppState::from_ref(state);

        let header = parts
            .headers
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ServiceError::Unauthorized("missing credential".to_string()))?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ServiceError::Unauthorized("malformed authorization header".to_string()))?;

        state.auth.verify(token)
    }
}
