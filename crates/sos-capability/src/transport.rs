//! Wire encodings for carrying tokens across HTTP boundaries.
//!
//! Three transports are accepted: a nested JSON object in request bodies,
//! an `X-Sos-Capability` header holding base64url-encoded JSON, and
//! `Authorization: Bearer <base64url>`. This module owns the string forms;
//! extraction from requests lives in the engine middleware.

use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64URL;
use base64::Engine;

use crate::{CapabilityToken, VerifyError, VerifyResult};

/// Encode a token as base64url JSON for header transport.
pub fn encode_token(token: &CapabilityToken) -> VerifyResult<String> {
    let json = serde_json::to_vec(token)
        .map_err(|e| VerifyError::MalformedToken(format!("encode: {e}")))?;
    Ok(B64URL.encode(json))
}

/// Decode a base64url JSON token from header transport.
pub fn decode_token(encoded: &str) -> VerifyResult<CapabilityToken> {
    let raw = B64URL
        .decode(encoded.trim())
        .map_err(|_| VerifyError::MalformedToken("header value is not base64url".into()))?;
    serde_json::from_slice(&raw)
        .map_err(|e| VerifyError::MalformedToken(format!("decode: {e}")))
}

/// Decode a token from an `Authorization` header value.
pub fn token_from_bearer(header_value: &str) -> VerifyResult<CapabilityToken> {
    let encoded = header_value
        .strip_prefix("Bearer ")
        .ok_or_else(|| VerifyError::MalformedToken("authorization scheme is not Bearer".into()))?;
    decode_token(encoded)
}
