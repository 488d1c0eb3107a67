//! Canonical signing input for device-signed requests.
//!
//! The message is built from the parsed fields in a fixed order, never from
//! the transport JSON, so reordering or re-encoding fields cannot change
//! what was signed:
//!
//! ```text
//! tessera-offline|v1|<type>\n<deviceId>\n<entitlementId>\n<jti>\n<iat>
//! ```

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use tessera_types::{DeviceId, EntitlementId};

use super::schema::{RequestKind, SignedRequest};
use crate::error::{LicenseError, LicenseResult};

/// Protocol tag prefixed to every canonical message.
pub const PROTOCOL_TAG: &str = "tessera-offline";

/// Builds the canonical message for a request.
#[must_use]
pub fn canonical_message(
    kind: RequestKind,
    device_id: &DeviceId,
    entitlement_id: &EntitlementId,
    jti: &str,
    iat: i64,
) -> String {
    format!(
        "{PROTOCOL_TAG}|v1|{}\n{device_id}\n{entitlement_id}\n{jti}\n{iat}",
        kind.code_kind()
    )
}

impl SignedRequest {
    /// Canonical message covered by `sig`.
    #[must_use]
    pub fn canonical_message(&self) -> String {
        canonical_message(
            self.kind,
            &self.device_id,
            &self.entitlement_id,
            &self.jti,
            self.iat,
        )
    }
}

/// Builds and signs a request with the device's private key.
#[must_use]
pub fn sign_request(
    kind: RequestKind,
    device_id: DeviceId,
    entitlement_id: EntitlementId,
    jti: impl Into<String>,
    iat: i64,
    key: &SigningKey,
) -> SignedRequest {
    let jti = jti.into();
    let message = canonical_message(kind, &device_id, &entitlement_id, &jti, iat);
    let sig = URL_SAFE_NO_PAD.encode(key.sign(message.as_bytes()).to_bytes());
    SignedRequest {
        kind,
        device_id,
        entitlement_id,
        jti,
        iat,
        sig,
    }
}

/// Verifies a request against the device's bound public key.
///
/// # Errors
///
/// Any decoding problem with `sig` and any verification failure map to
/// [`LicenseError::SignatureVerificationFailed`].
pub fn verify_request_signature(request: &SignedRequest, key: &VerifyingKey) -> LicenseResult<()> {
    let bytes = URL_SAFE_NO_PAD
        .decode(&request.sig)
        .map_err(|_| LicenseError::SignatureVerificationFailed)?;
    let signature =
        Signature::from_slice(&bytes).map_err(|_| LicenseError::SignatureVerificationFailed)?;
    key.verify_strict(request.canonical_message().as_bytes(), &signature)
        .map_err(|_| LicenseError::SignatureVerificationFailed)
}
