//! The Identity Provider boundary.
//!
//! Upstream authentication is an external collaborator: its whole contract
//! is a verified, non-empty, session-stable user-id string per request.
//! This module carries that boundary as an axum middleware — a bearer
//! token is verified against the injected signing secret, and the resulting
//! [`Identity`] is placed into request extensions. Everything downstream
//! (handlers, the credential bridge) trusts it unconditionally and never
//! re-verifies.
//!
//! Token issuance mechanics are out of scope; [`TokenVerifier::issue`]
//! exists so tests and operator tooling can mint tokens with the same
//! injected secret.

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use thiserror::Error;

use crate::state::AppState;

type HmacSha256 = Hmac<Sha256>;

/// A verified user identity, inserted into request extensions by
/// [`require_identity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity(pub String);

/// Token verification failures.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum AuthError {
    /// Token does not have the `<user_id>.<signature>` shape.
    #[error("malformed token")]
    Malformed,

    /// Signature did not verify, or the user id was empty.
    #[error("invalid token")]
    Invalid,
}

/// Verifies (and, for tests/tooling, issues) signed identity tokens.
///
/// Token format: `<user_id>.<hex(HMAC-SHA256(secret, user_id))>`.
pub struct TokenVerifier {
    secret: Vec<u8>,
}

impl TokenVerifier {
    /// Build a verifier around the injected signing secret.
    #[must_use]
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn mac(&self, user_id: &str) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(user_id.as_bytes());
        mac
    }

    /// Mint a token for a user id.
    #[must_use]
    pub fn issue(&self, user_id: &str) -> String {
        let signature = hex::encode(self.mac(user_id).finalize().into_bytes());
        format!("{user_id}.{signature}")
    }

    /// Verify a token and return the embedded user id.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] if the token is malformed, the signature does
    /// not verify, or the user id is empty.
    pub fn verify(&self, token: &str) -> Result<String, AuthError> {
        let (user_id, signature_hex) = token.rsplit_once('.').ok_or(AuthError::Malformed)?;
        if user_id.is_empty() {
            return Err(AuthError::Invalid);
        }
        let signature = hex::decode(signature_hex).map_err(|_| AuthError::Malformed)?;

        // Constant-time comparison via the Mac verifier.
        self.mac(user_id)
            .verify_slice(&signature)
            .map_err(|_| AuthError::Invalid)?;
        Ok(user_id.to_string())
    }
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier").finish_non_exhaustive()
    }
}

fn unauthorized(message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": message }))).into_response()
}

/// Middleware protecting authenticated routes.
///
/// Extracts `Authorization: Bearer <token>`, verifies it, and inserts
/// [`Identity`] into request extensions for downstream handlers.
pub async fn require_identity(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(header_value) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    else {
        return unauthorized("authorization header required");
    };

    let Some(token) = header_value.strip_prefix("Bearer ") else {
        return unauthorized("invalid authorization format");
    };

    match state.verifier.verify(token) {
        Ok(user_id) => {
            request.extensions_mut().insert(Identity(user_id));
            next.run(request).await
        },
        Err(err) => {
            tracing::debug!(error = %err, "token verification failed");
            unauthorized("invalid token")
        },
    }
}
