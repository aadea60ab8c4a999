//! REST wire types shared by [`crate::HttpKeyVaultClient`] and [`crate::server`].
//!
//! Binary values travel as unpadded base64url.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

use crate::error::KeyVaultError;

/// Header carrying the bearer token.
pub const AUTHORIZATION: &str = "authorization";

/// Encodes bytes for the wire.
pub fn encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decodes a wire value.
pub fn decode(value: &str) -> Result<Vec<u8>, KeyVaultError> {
    URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|e| KeyVaultError::WrapUnwrapFailure(format!("invalid base64url value: {e}")))
}

/// Body of `wrapkey`, `unwrapkey` and `sign`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyOperationRequest {
    /// Algorithm name.
    pub alg: String,
    /// Input bytes, base64url.
    pub value: String,
}

/// Answer to `wrapkey`, `unwrapkey` and `sign`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyOperationResponse {
    /// Versioned key identifier.
    pub kid: String,
    /// Output bytes, base64url.
    pub value: String,
}

/// Body of `verify`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyRequest {
    /// Algorithm name.
    pub alg: String,
    /// Signed data, base64url.
    pub digest: String,
    /// Signature, base64url.
    pub value: String,
}

/// Answer to `verify`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyResponse {
    /// Whether the signature matched.
    pub value: bool,
}

/// Error body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error detail.
    pub error: ErrorDetail,
}

/// Error code and message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

/// Signature algorithm name used on the wire.
pub const SIGN_ALGORITHM: &str = "HS256";
