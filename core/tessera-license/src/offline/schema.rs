//! Offline code schemas and the validation pipeline.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use tessera_types::{CodeKind, DeviceId, EntitlementId, Platform};

use super::CodeError;
use super::codec::{self, MAX_REQUEST_CODE_LEN, MAX_SETUP_CODE_LEN};

/// The only supported code version.
pub const CODE_VERSION: u64 = 1;

const DEVICE_ID_MAX: usize = 128;
const DEVICE_NAME_MAX: usize = 128;
const PUBLIC_KEY_MIN: usize = 40;
const PUBLIC_KEY_MAX: usize = 200;
const JTI_MIN: usize = 8;
const JTI_MAX: usize = 128;
/// Unpadded base64url of a 64-byte Ed25519 signature.
const SIG_LEN: usize = 86;

const SETUP_FIELDS: &[&str] = &[
    "v",
    "type",
    "deviceId",
    "deviceName",
    "platform",
    "publicKey",
    "createdAt",
];
const REQUEST_FIELDS: &[&str] = &["v", "type", "deviceId", "entitlementId", "jti", "iat", "sig"];

/// The `type` of an offline code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OfflineCodeKind {
    DeviceSetup,
    LeaseRefreshRequest,
    DeactivationCode,
    ActivationPackage,
}

impl OfflineCodeKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeviceSetup => "device_setup",
            Self::LeaseRefreshRequest => "lease_refresh_request",
            Self::DeactivationCode => "deactivation_code",
            Self::ActivationPackage => "activation_package",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "device_setup" => Some(Self::DeviceSetup),
            "lease_refresh_request" => Some(Self::LeaseRefreshRequest),
            "deactivation_code" => Some(Self::DeactivationCode),
            "activation_package" => Some(Self::ActivationPackage),
            _ => None,
        }
    }

    /// Encoded size limit for this kind.
    #[must_use]
    pub fn max_len(&self) -> usize {
        match self {
            Self::DeviceSetup => MAX_SETUP_CODE_LEN,
            Self::LeaseRefreshRequest | Self::DeactivationCode => MAX_REQUEST_CODE_LEN,
            Self::ActivationPackage => codec::MAX_PACKAGE_LEN,
        }
    }
}

impl fmt::Display for OfflineCodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which signed request a device sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    LeaseRefresh,
    Deactivation,
}

impl RequestKind {
    #[must_use]
    pub fn code_kind(&self) -> OfflineCodeKind {
        match self {
            Self::LeaseRefresh => OfflineCodeKind::LeaseRefreshRequest,
            Self::Deactivation => OfflineCodeKind::DeactivationCode,
        }
    }

    /// Replay ledger kind for consumed requests.
    #[must_use]
    pub fn ledger_kind(&self) -> CodeKind {
        match self {
            Self::LeaseRefresh => CodeKind::Refresh,
            Self::Deactivation => CodeKind::Deactivation,
        }
    }
}

/// `device_setup`: binds a device's public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSetupCode {
    pub device_id: DeviceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    /// Ed25519 public key, SPKI DER, standard base64.
    pub public_key: String,
    pub created_at: DateTime<Utc>,
}

impl DeviceSetupCode {
    /// Encodes the code for transport.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        codec::encode_json(&Envelope {
            v: CODE_VERSION,
            kind: OfflineCodeKind::DeviceSetup.as_str(),
            body: self,
        })
    }
}

/// `lease_refresh_request` or `deactivation_code`, signed by the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedRequest {
    #[serde(skip)]
    pub kind: RequestKind,
    pub device_id: DeviceId,
    pub entitlement_id: EntitlementId,
    pub jti: String,
    pub iat: i64,
    /// Ed25519 signature over the canonical message, unpadded base64url.
    pub sig: String,
}

impl SignedRequest {
    /// Encodes the request for transport.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        codec::encode_json(&Envelope {
            v: CODE_VERSION,
            kind: self.kind.code_kind().as_str(),
            body: self,
        })
    }
}

/// A parsed device-to-server code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfflineCode {
    DeviceSetup(DeviceSetupCode),
    Request(SignedRequest),
}

impl OfflineCode {
    #[must_use]
    pub fn kind(&self) -> OfflineCodeKind {
        match self {
            Self::DeviceSetup(_) => OfflineCodeKind::DeviceSetup,
            Self::Request(req) => req.kind.code_kind(),
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a, T> {
    v: u64,
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(flatten)]
    body: &'a T,
}

/// Parses and schema-validates a device-to-server code.
///
/// Signatures are not checked here.
pub fn parse_code(code: &str) -> Result<OfflineCode, CodeError> {
    // The setup limit is the largest device-to-server limit; the per-type
    // limit is applied once the type is known.
    let map = codec::decode_object(code, MAX_SETUP_CODE_LEN)?;
    let kind = check_envelope(&map)?;

    let len = code.trim().len();
    if len > kind.max_len() {
        return Err(CodeError::TooLarge {
            len,
            max: kind.max_len(),
        });
    }

    match kind {
        OfflineCodeKind::DeviceSetup => parse_setup(&map).map(OfflineCode::DeviceSetup),
        OfflineCodeKind::LeaseRefreshRequest => {
            parse_request(&map, RequestKind::LeaseRefresh).map(OfflineCode::Request)
        }
        OfflineCodeKind::DeactivationCode => {
            parse_request(&map, RequestKind::Deactivation).map(OfflineCode::Request)
        }
        OfflineCodeKind::ActivationPackage => Err(CodeError::WrongType {
            expected: "device",
            found: kind.as_str(),
        }),
    }
}

/// Best-effort type of a code that may fail schema validation.
pub(crate) fn peek_kind(code: &str) -> Option<OfflineCodeKind> {
    let map = codec::decode_object(code, MAX_SETUP_CODE_LEN).ok()?;
    check_envelope(&map).ok()
}

/// Version then type.
pub(crate) fn check_envelope(map: &Map<String, Value>) -> Result<OfflineCodeKind, CodeError> {
    match map.get("v") {
        Some(v) if v.as_u64() == Some(CODE_VERSION) => {}
        Some(v) => return Err(CodeError::UnsupportedVersion(v.to_string())),
        None => return Err(CodeError::UnsupportedVersion("missing".to_string())),
    }
    let tag = map
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| CodeError::field("type", "must be a string"))?;
    OfflineCodeKind::from_tag(tag).ok_or_else(|| CodeError::UnknownType(tag.to_string()))
}

fn parse_setup(map: &Map<String, Value>) -> Result<DeviceSetupCode, CodeError> {
    reject_unknown(map, SETUP_FIELDS)?;
    let platform = optional_str(map, "platform", 16)?
        .map(|p| {
            p.parse::<Platform>()
                .map_err(|_| CodeError::field("platform", "must be windows, macos or linux"))
        })
        .transpose()?;
    let created_at = required_str(map, "createdAt", 1, 64)?;
    let created_at = DateTime::parse_from_rfc3339(created_at)
        .map_err(|e| CodeError::field("createdAt", e.to_string()))?
        .with_timezone(&Utc);

    Ok(DeviceSetupCode {
        device_id: device_id(map)?,
        device_name: optional_str(map, "deviceName", DEVICE_NAME_MAX)?.map(str::to_string),
        platform,
        public_key: required_str(map, "publicKey", PUBLIC_KEY_MIN, PUBLIC_KEY_MAX)?.to_string(),
        created_at,
    })
}

fn parse_request(map: &Map<String, Value>, kind: RequestKind) -> Result<SignedRequest, CodeError> {
    reject_unknown(map, REQUEST_FIELDS)?;
    let entitlement_id = required_str(map, "entitlementId", 1, 64)?;
    let entitlement_id = EntitlementId::parse(entitlement_id)
        .map_err(|_| CodeError::field("entitlementId", "must be a UUID"))?;

    let jti = required_str(map, "jti", JTI_MIN, JTI_MAX)?;
    if !is_token_charset(jti) {
        return Err(CodeError::field("jti", "must match [A-Za-z0-9_-]"));
    }

    let iat = map
        .get("iat")
        .ok_or_else(|| CodeError::field("iat", "is required"))?
        .as_i64()
        .filter(|iat| *iat >= 0)
        .ok_or_else(|| CodeError::field("iat", "must be a non-negative integer"))?;

    let sig = required_str(map, "sig", SIG_LEN, SIG_LEN)?;
    if !is_token_charset(sig) {
        return Err(CodeError::field("sig", "must be unpadded base64url"));
    }

    Ok(SignedRequest {
        kind,
        device_id: device_id(map)?,
        entitlement_id,
        jti: jti.to_string(),
        iat,
        sig: sig.to_string(),
    })
}

fn device_id(map: &Map<String, Value>) -> Result<DeviceId, CodeError> {
    let id = required_str(map, "deviceId", 1, DEVICE_ID_MAX)?;
    if id.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(CodeError::field(
            "deviceId",
            "must not contain whitespace or control characters",
        ));
    }
    Ok(DeviceId::new(id))
}

fn reject_unknown(map: &Map<String, Value>, allowed: &[&str]) -> Result<(), CodeError> {
    match map.keys().find(|k| !allowed.contains(&k.as_str())) {
        Some(unknown) => Err(CodeError::UnknownField(unknown.clone())),
        None => Ok(()),
    }
}

fn required_str<'a>(
    map: &'a Map<String, Value>,
    field: &'static str,
    min: usize,
    max: usize,
) -> Result<&'a str, CodeError> {
    let value = map
        .get(field)
        .ok_or_else(|| CodeError::field(field, "is required"))?
        .as_str()
        .ok_or_else(|| CodeError::field(field, "must be a string"))?;
    check_len(field, value, min, max)?;
    Ok(value)
}

fn optional_str<'a>(
    map: &'a Map<String, Value>,
    field: &'static str,
    max: usize,
) -> Result<Option<&'a str>, CodeError> {
    match map.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            check_len(field, s, 0, max)?;
            Ok(Some(s.as_str()))
        }
        Some(_) => Err(CodeError::field(field, "must be a string")),
    }
}

fn check_len(field: &'static str, value: &str, min: usize, max: usize) -> Result<(), CodeError> {
    let len = value.chars().count();
    if len < min || len > max {
        return Err(CodeError::field(
            field,
            format!("length {len} outside {min}..={max}"),
        ));
    }
    Ok(())
}

fn is_token_charset(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
