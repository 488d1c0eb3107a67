//! Transport encoding: URL-safe base64 (no padding) of compact JSON.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::Serialize;
use serde_json::{Map, Value};

use super::CodeError;

/// Largest accepted `device_setup` code, in encoded characters.
pub const MAX_SETUP_CODE_LEN: usize = 4096;
/// Largest accepted refresh or deactivation code, in encoded characters.
pub const MAX_REQUEST_CODE_LEN: usize = 2048;
/// Largest accepted activation package, in encoded characters.
pub const MAX_PACKAGE_LEN: usize = 8192;

/// Serializes a value and encodes it for transport.
pub fn encode_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(value)?))
}

/// Runs the pre-parse checks and decodes a code into its JSON object.
///
/// Length and charset are checked on the raw string before any decoding, so
/// oversized or garbage input costs no base64 or JSON work.
pub(crate) fn decode_object(code: &str, max_len: usize) -> Result<Map<String, Value>, CodeError> {
    let code = code.trim();
    if code.is_empty() {
        return Err(CodeError::Empty);
    }
    if code.len() > max_len {
        return Err(CodeError::TooLarge {
            len: code.len(),
            max: max_len,
        });
    }
    if !code
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(CodeError::Charset);
    }

    let bytes = URL_SAFE_NO_PAD
        .decode(code)
        .map_err(|e| CodeError::Base64(e.to_string()))?;
    let value: Value =
        serde_json::from_slice(&bytes).map_err(|e| CodeError::Json(e.to_string()))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(CodeError::NotObject),
    }
}
