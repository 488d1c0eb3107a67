//! Signed token codec.
//!
//! Tokens use the format: `base64url(claims).base64url(signature)`
//!
//! The signature covers `claims_b64.as_bytes()` (the base64url-encoded
//! claims string, not the decoded JSON), so verifiers never re-serialize.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Token encoding and verification failures.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The token is not two base64url parts separated by a dot.
    #[error("invalid token format: {0}")]
    Format(String),

    /// The signature does not match the claims.
    #[error("token signature invalid")]
    Signature,

    /// The claims are not the expected JSON shape.
    #[error("invalid token claims: {0}")]
    Claims(String),

    /// Claims could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Serializes and signs a set of claims.
pub fn sign<T: Serialize>(key: &SigningKey, claims: &T) -> Result<String, TokenError> {
    let claims_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
    let signature = key.sign(claims_b64.as_bytes());
    let sig_b64 = URL_SAFE_NO_PAD.encode(signature.to_bytes());
    Ok(format!("{claims_b64}.{sig_b64}"))
}

/// Verifies a token's signature and decodes its claims.
///
/// # Errors
///
/// Fails with [`TokenError::Signature`] before touching the claims if the
/// signature does not verify.
pub fn open<T: DeserializeOwned>(key: &VerifyingKey, token: &str) -> Result<T, TokenError> {
    let token = token.trim();
    let Some((claims_b64, sig_b64)) = token.split_once('.') else {
        return Err(TokenError::Format(
            "token must have exactly two parts separated by a dot".to_string(),
        ));
    };
    if sig_b64.contains('.') {
        return Err(TokenError::Format(
            "token must have exactly two parts separated by a dot".to_string(),
        ));
    }

    let sig_bytes = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|e| TokenError::Format(format!("invalid signature base64: {e}")))?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|_| TokenError::Format("invalid signature length".to_string()))?;

    key.verify_strict(claims_b64.as_bytes(), &signature)
        .map_err(|_| TokenError::Signature)?;

    let claims_json = URL_SAFE_NO_PAD
        .decode(claims_b64)
        .map_err(|e| TokenError::Format(format!("invalid claims base64: {e}")))?;
    serde_json::from_slice(&claims_json).map_err(|e| TokenError::Claims(e.to_string()))
}
