//! Activation packages handed to an air-gapped device.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::CodeError;
use super::codec::{self, MAX_PACKAGE_LEN};
use super::schema::{CODE_VERSION, OfflineCodeKind, check_envelope};

/// `{v:1, type:"activation_package", activationToken, leaseToken?,
/// leaseExpiresAt?, entitlementExpiresAt?}`.
///
/// `entitlementExpiresAt` is only present for time-boxed (trial) grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationPackage {
    pub v: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub activation_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entitlement_expires_at: Option<DateTime<Utc>>,
}

impl ActivationPackage {
    #[must_use]
    pub fn new(activation_token: String) -> Self {
        Self {
            v: CODE_VERSION,
            kind: OfflineCodeKind::ActivationPackage.as_str().to_string(),
            activation_token,
            lease_token: None,
            lease_expires_at: None,
            entitlement_expires_at: None,
        }
    }

    /// Encodes the package for transport.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        codec::encode_json(self)
    }

    /// Decodes a package, running the same pre-parse pipeline as device
    /// codes.
    pub fn decode(code: &str) -> Result<Self, CodeError> {
        let map = codec::decode_object(code, MAX_PACKAGE_LEN)?;
        let kind = check_envelope(&map)?;
        if kind != OfflineCodeKind::ActivationPackage {
            return Err(CodeError::WrongType {
                expected: "activation_package",
                found: kind.as_str(),
            });
        }
        serde_json::from_value(serde_json::Value::Object(map))
            .map_err(|e| CodeError::Json(e.to_string()))
    }
}
