//! Server signing keys and device public keys.
//!
//! The server signs every lease, challenge and activation token with one
//! Ed25519 key. Devices publish their own Ed25519 public key once, as SPKI
//! DER in standard base64, during air-gapped setup.

use base64::{Engine, engine::general_purpose::STANDARD};
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

use crate::error::{LicenseError, LicenseResult};

/// Source of the server's signing key.
pub trait KeyProvider: Send + Sync {
    /// The key used to sign server-issued tokens.
    fn signing_key(&self) -> &SigningKey;

    /// The matching public key.
    fn verifying_key(&self) -> VerifyingKey {
        self.signing_key().verifying_key()
    }

    /// Short fingerprint of the public key (first 8 bytes of SHA-256, hex).
    fn key_id(&self) -> String {
        let digest = Sha256::digest(self.verifying_key().as_bytes());
        hex::encode(&digest[..8])
    }
}

/// An Ed25519 server key held in memory.
#[derive(Clone)]
pub struct ServerKey {
    signing: SigningKey,
}

impl ServerKey {
    /// Generates a fresh key from the OS random source.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Builds a key from a raw 32-byte seed.
    #[must_use]
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    /// Parses a PKCS#8 PEM private key.
    pub fn from_pkcs8_pem(pem: &str) -> LicenseResult<Self> {
        let signing = SigningKey::from_pkcs8_pem(pem)
            .map_err(|e| LicenseError::Key(format!("invalid PKCS#8 PEM: {e}")))?;
        Ok(Self { signing })
    }

    /// Parses a PKCS#8 DER private key.
    pub fn from_pkcs8_der(der: &[u8]) -> LicenseResult<Self> {
        let signing = SigningKey::from_pkcs8_der(der)
            .map_err(|e| LicenseError::Key(format!("invalid PKCS#8 DER: {e}")))?;
        Ok(Self { signing })
    }

    /// Loads a key file: PKCS#8 PEM, PKCS#8 DER, a raw 32-byte seed, or the
    /// seed as 64 hex characters.
    pub fn load(path: &Path) -> LicenseResult<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| LicenseError::Key(format!("cannot read {}: {e}", path.display())))?;

        if let Ok(text) = std::str::from_utf8(&bytes) {
            let text = text.trim();
            if text.starts_with("-----BEGIN") {
                return Self::from_pkcs8_pem(text);
            }
            if text.len() == 64 {
                if let Ok(seed) = hex::decode(text) {
                    if let Ok(seed) = <[u8; 32]>::try_from(seed.as_slice()) {
                        return Ok(Self::from_seed(&seed));
                    }
                }
            }
        }
        if let Ok(seed) = <[u8; 32]>::try_from(bytes.as_slice()) {
            return Ok(Self::from_seed(&seed));
        }
        Self::from_pkcs8_der(&bytes)
    }

    /// Encodes the private key as PKCS#8 PEM.
    pub fn to_pkcs8_pem(&self) -> LicenseResult<String> {
        let pem = self
            .signing
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| LicenseError::Key(format!("cannot encode key: {e}")))?;
        Ok(pem.as_str().to_owned())
    }

    /// Raw 32-byte public key.
    #[must_use]
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Public key as SPKI DER in standard base64, for publication.
    pub fn public_key_spki_b64(&self) -> LicenseResult<String> {
        encode_public_key(&self.signing.verifying_key())
    }
}

impl KeyProvider for ServerKey {
    fn signing_key(&self) -> &SigningKey {
        &self.signing
    }
}

impl fmt::Debug for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerKey")
            .field("key_id", &self.key_id())
            .finish_non_exhaustive()
    }
}

/// Encodes a public key as SPKI DER in standard base64.
pub fn encode_public_key(key: &VerifyingKey) -> LicenseResult<String> {
    let der = key
        .to_public_key_der()
        .map_err(|e| LicenseError::Key(format!("cannot encode public key: {e}")))?;
    Ok(STANDARD.encode(der.as_bytes()))
}

/// Decodes a device public key (SPKI DER, standard base64).
///
/// # Errors
///
/// Returns [`LicenseError::InvalidPublicKey`] for bad base64, bad DER or a
/// non-Ed25519 key.
pub fn decode_public_key(b64: &str) -> LicenseResult<VerifyingKey> {
    let der = STANDARD
        .decode(b64.trim())
        .map_err(|e| LicenseError::InvalidPublicKey(format!("invalid base64: {e}")))?;
    VerifyingKey::from_public_key_der(&der)
        .map_err(|e| LicenseError::InvalidPublicKey(format!("invalid SPKI key: {e}")))
}
