//! Caller identity: HS256 JWT verification and the `AuthUser` extractor.

use axum::async_trait;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::{header, request::Parts};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ChatError;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (owner id)
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: usize,
    /// Issued at (Unix timestamp)
    #[serde(default)]
    pub iat: usize,
    #[serde(default)]
    pub email: Option<String>,
}

pub struct JwtVerifier {
    decoding_key: DecodingKey,
    encoding_key: EncodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, ChatError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| ChatError::AuthenticationFailed(e.to_string()))?;
        if data.claims.sub.trim().is_empty() {
            return Err(ChatError::AuthenticationFailed("token has no subject".to_string()));
        }
        Ok(data.claims)
    }

    /// Mint a token for `owner_id`; used by tooling and tests.
    pub fn issue_token(&self, owner_id: &str, ttl_secs: u64) -> anyhow::Result<String> {
        let now = chrono::Utc::now().timestamp() as usize;
        let claims = Claims {
            sub: owner_id.to_string(),
            exp: now + ttl_secs as usize,
            iat: now,
            email: None,
        };
        Ok(encode(&Header::default(), &claims, &self.encoding_key)?)
    }
}

/// Authenticated caller. `token` is forwarded to the object store.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub token: String,
    pub claims: Claims,
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    Arc<JwtVerifier>: FromRef<S>,
{
    type Rejection = ChatError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let header_value = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .ok_or_else(|| ChatError::AuthenticationFailed("missing authorization header".to_string()))?;

        let token = header_value
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ChatError::AuthenticationFailed("expected a bearer token".to_string()))?;

        let verifier = Arc::<JwtVerifier>::from_ref(state);
        let claims = verifier.verify(token)?;
        Ok(AuthUser {
            user_id: claims.sub.clone(),
            token: token.to_string(),
            claims,
        })
    }
}
