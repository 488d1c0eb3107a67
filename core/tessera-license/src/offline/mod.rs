//! Air-gapped offline codes.
//!
//! Every code is a versioned JSON object, URL-safe base64 encoded without
//! padding, small enough to copy and paste:
//!
//! | type | direction | signed |
//! |---|---|---|
//! | `device_setup` | device → server | no (establishes the device key) |
//! | `lease_refresh_request` | device → server | yes, by the device key |
//! | `deactivation_code` | device → server | yes, by the device key |
//! | `activation_package` | server → device | carries server-signed tokens |
//!
//! Parsing runs a fixed pipeline and stops at the first failure: format,
//! length and charset, then base64, JSON, object shape, version, type and
//! finally per-field schema. Signature checks happen later and separately.

mod canonical;
mod codec;
mod package;
mod schema;

pub use canonical::{PROTOCOL_TAG, canonical_message, sign_request, verify_request_signature};
pub use codec::{MAX_PACKAGE_LEN, MAX_REQUEST_CODE_LEN, MAX_SETUP_CODE_LEN, encode_json};
pub use package::ActivationPackage;
pub use schema::{
    CODE_VERSION, DeviceSetupCode, OfflineCode, OfflineCodeKind, RequestKind, SignedRequest,
    parse_code,
};
pub(crate) use schema::peek_kind;

use thiserror::Error;

/// Offline code validation failures, in pipeline order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodeError {
    #[error("code is empty")]
    Empty,

    #[error("code is {len} characters, limit is {max}")]
    TooLarge { len: usize, max: usize },

    #[error("code contains characters outside [A-Za-z0-9_-]")]
    Charset,

    #[error("code is not valid base64url: {0}")]
    Base64(String),

    #[error("code is not valid JSON: {0}")]
    Json(String),

    #[error("code must be a JSON object")]
    NotObject,

    #[error("unsupported code version {0}")]
    UnsupportedVersion(String),

    #[error("unknown code type {0:?}")]
    UnknownType(String),

    #[error("expected a {expected} code, got {found}")]
    WrongType {
        expected: &'static str,
        found: &'static str,
    },

    #[error("field {field}: {reason}")]
    Field { field: &'static str, reason: String },

    #[error("unexpected field {0:?}")]
    UnknownField(String),
}

impl CodeError {
    pub(crate) fn field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Field {
            field,
            reason: reason.into(),
        }
    }
}
