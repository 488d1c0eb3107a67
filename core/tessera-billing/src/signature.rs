//! HMAC-SHA256 signature validation for payment provider webhooks.
//!
//! The provider signs `"<t>.<payload>"` with a shared secret and sends the
//! result in a header of the form `t=<unix>,v1=<hex>[,v1=<hex>...]`. More
//! than one `v1` entry appears while a secret is being rolled.
//!
//! # Security Properties
//!
//! - Signatures are compared in constant time with the `subtle` crate
//! - The secret is wrapped in `SecretString` so it never reaches logs
//! - The signed timestamp must be within a tolerance of now, which bounds
//!   how long a captured delivery can be replayed

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::WebhookError;
use crate::event::BillingEvent;

type HmacSha256 = Hmac<Sha256>;

/// Default accepted distance between the signed timestamp and now.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Verifies webhook deliveries and turns them into events.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: SecretString,
    tolerance_secs: i64,
}

impl WebhookVerifier {
    #[must_use]
    pub fn new(secret: SecretString) -> Self {
        Self {
            secret,
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        }
    }

    #[must_use]
    pub fn with_tolerance(mut self, tolerance_secs: i64) -> Self {
        self.tolerance_secs = tolerance_secs;
        self
    }

    /// Verifies a delivery and parses the event.
    ///
    /// # Errors
    ///
    /// Any signature failure, or [`WebhookError::InvalidPayload`] if the
    /// verified body is not an event.
    pub fn construct_event(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<BillingEvent, WebhookError> {
        self.construct_event_at(payload, signature_header, Utc::now())
    }

    pub fn construct_event_at(
        &self,
        payload: &[u8],
        signature_header: &str,
        now: DateTime<Utc>,
    ) -> Result<BillingEvent, WebhookError> {
        self.verify_at(payload, signature_header, now)?;
        BillingEvent::from_slice(payload)
    }

    /// Verifies the signature header against the raw payload.
    pub fn verify_at(
        &self,
        payload: &[u8],
        signature_header: &str,
        now: DateTime<Utc>,
    ) -> Result<(), WebhookError> {
        let header = SignatureHeader::parse(signature_header)?;

        let tolerance = u64::try_from(self.tolerance_secs).unwrap_or(0);
        let within = now
            .timestamp()
            .checked_sub(header.timestamp)
            .is_some_and(|age| age.unsigned_abs() <= tolerance);
        if !within {
            let age_secs = now.timestamp().saturating_sub(header.timestamp);
            tracing::warn!(age_secs, "webhook timestamp outside tolerance");
            return Err(WebhookError::TimestampOutsideTolerance {
                age_secs,
                tolerance_secs: self.tolerance_secs,
            });
        }

        let computed = self.compute(header.timestamp, payload)?;
        let matched = header
            .signatures
            .iter()
            .any(|candidate| bool::from(computed.ct_eq(candidate.as_slice())));
        if matched {
            Ok(())
        } else {
            tracing::warn!("webhook signature verification failed");
            Err(WebhookError::InvalidSignature)
        }
    }

    /// Builds a signature header for a payload, as the provider would.
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> Result<String, WebhookError> {
        let sig = self.compute(timestamp, payload)?;
        Ok(format!("t={timestamp},v1={}", hex::encode(sig)))
    }

    fn compute(&self, timestamp: i64, payload: &[u8]) -> Result<Vec<u8>, WebhookError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|_| WebhookError::InvalidSignatureFormat("unusable secret".into()))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

struct SignatureHeader {
    timestamp: i64,
    signatures: Vec<Vec<u8>>,
}

impl SignatureHeader {
    fn parse(header: &str) -> Result<Self, WebhookError> {
        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in header.split(',') {
            let Some((key, value)) = part.trim().split_once('=') else {
                return Err(WebhookError::InvalidSignatureFormat(
                    "expected key=value pairs".into(),
                ));
            };
            match key {
                "t" => {
                    let t = value.parse::<i64>().map_err(|_| {
                        WebhookError::InvalidSignatureFormat("timestamp is not an integer".into())
                    })?;
                    timestamp = Some(t);
                }
                "v1" => {
                    let sig = hex::decode(value).map_err(|e| {
                        WebhookError::InvalidSignatureFormat(format!("invalid hex: {e}"))
                    })?;
                    signatures.push(sig);
                }
                // Other schemes (e.g. v0 test signatures) are ignored.
                _ => {}
            }
        }
        let timestamp = timestamp
            .ok_or_else(|| WebhookError::InvalidSignatureFormat("missing t=".into()))?;
        if signatures.is_empty() {
            return Err(WebhookError::InvalidSignatureFormat("missing v1=".into()));
        }
        Ok(Self {
            timestamp,
            signatures,
        })
    }
}
