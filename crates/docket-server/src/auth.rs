//! Bearer-token issuance and verification.
//!
//! Tokens are Ed25519-signed: `base64url(claims_json).base64url(signature)`.
//! The signing key derives from the configured secret, so every instance
//! sharing the secret verifies every instance's tokens.

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;

use crate::AppState;

/// Verified token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Token subject (the authenticated user).
    pub sub: String,
    /// Issued-at, epoch seconds.
    pub iat: i64,
    /// Expiry, epoch seconds.
    pub exp: i64,
}

/// Token verification failures.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    Missing,

    #[error("malformed token")]
    Malformed,

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("token expired")]
    Expired,
}

struct TokenInner {
    signing: SigningKey,
    verifying: VerifyingKey,
    expiry_secs: i64,
}

/// Issues and verifies bearer tokens.
#[derive(Clone)]
pub struct TokenService(Arc<TokenInner>);

impl TokenService {
    /// Derives the Ed25519 signing key from the configured secret.
    pub fn new(secret: &str, expiry_secs: i64) -> Self {
        let seed: [u8; 32] = Sha256::digest(secret.as_bytes()).into();
        let signing = SigningKey::from_bytes(&seed);
        let verifying = signing.verifying_key();
        Self(Arc::new(TokenInner {
            signing,
            verifying,
            expiry_secs,
        }))
    }

    /// Issues a token for a subject.
    pub fn issue(&self, subject: &str) -> String {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: subject.to_string(),
            iat: now,
            exp: now + self.0.expiry_secs,
        };
        // Claims are a fixed struct, serialization cannot fail.
        let payload =
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).expect("claims serialize"));
        let signature = self.0.signing.sign(payload.as_bytes());
        format!("{payload}.{}", URL_SAFE_NO_PAD.encode(signature.to_bytes()))
    }

    /// Verifies a token and returns its claims.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] on shape, signature, or expiry failure.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let (payload, signature_b64) = token.split_once('.').ok_or(AuthError::Malformed)?;

        let signature_bytes = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| AuthError::Malformed)?;
        let signature_bytes: [u8; 64] =
            signature_bytes.try_into().map_err(|_| AuthError::Malformed)?;
        let signature = Signature::from_bytes(&signature_bytes);

        self.0
            .verifying
            .verify(payload.as_bytes(), &signature)
            .map_err(|_| AuthError::InvalidSignature)?;

        let claims_bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| AuthError::Malformed)?;
        let claims: Claims =
            serde_json::from_slice(&claims_bytes).map_err(|_| AuthError::Malformed)?;

        if claims.exp < Utc::now().timestamp() {
            return Err(AuthError::Expired);
        }

        Ok(claims)
    }

    /// Token lifetime, surfaced in the login response.
    pub fn expiry_secs(&self) -> i64 {
        self.0.expiry_secs
    }
}

/// Request body for `POST /auth/login`.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Response body for `POST /auth/login`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
}

/// Handler for `POST /api/v1/auth/login`.
///
/// Exchanges configured credentials for a signed bearer token. Token
/// issuance proper is delegated to an external identity provider in larger
/// deployments; this endpoint covers the single-tenant case.
pub async fn login_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<LoginRequest>,
) -> impl IntoResponse {
    if request.username != state.credentials.0 || request.password != state.credentials.1 {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": {"kind": "authorization", "message": "invalid credentials"}})),
        )
            .into_response();
    }

    let token = state.tokens.issue(&request.username);
    Json(LoginResponse {
        token,
        token_type: "Bearer",
        expires_in: state.tokens.expiry_secs(),
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_tokens_verify() {
        let tokens = TokenService::new("secret", 3600);
        let token = tokens.issue("auditor");
        let claims = tokens.verify(&token).unwrap();
        assert_eq!(claims.sub, "auditor");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn different_secret_rejects() {
        let issuer = TokenService::new("secret-a", 3600);
        let other = TokenService::new("secret-b", 3600);
        let token = issuer.issue("auditor");
        assert!(matches!(
            other.verify(&token),
            Err(AuthError::InvalidSignature)
        ));
    }

    #[test]
    fn expired_tokens_reject() {
        let tokens = TokenService::new("secret", -10);
        let token = tokens.issue("auditor");
        assert!(matches!(tokens.verify(&token), Err(AuthError::Expired)));
    }

    #[test]
    fn garbage_tokens_are_malformed() {
        let tokens = TokenService::new("secret", 3600);
        assert!(matches!(tokens.verify("nonsense"), Err(AuthError::Malformed)));
        assert!(matches!(
            tokens.verify("abc.def"),
            Err(AuthError::Malformed)
        ));
    }

    #[test]
    fn tampered_payload_rejects() {
        let tokens = TokenService::new("secret", 3600);
        let token = tokens.issue("auditor");
        let (_, signature) = token.split_once('.').unwrap();
        let forged_payload = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&Claims {
                sub: "admin".into(),
                iat: 0,
                exp: i64::MAX,
            })
            .unwrap(),
        );
        let forged = format!("{forged_payload}.{signature}");
        assert!(matches!(
            tokens.verify(&forged),
            Err(AuthError::InvalidSignature)
        ));
    }
}
