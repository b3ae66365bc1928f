use serde::{Deserialize, Serialize};

/// Normalized failure shape for every remote call.
///
/// Transport failures, HTTP errors, and client-side validation rejections all
/// collapse into this one struct so callers branch on `status`/`code` instead
/// of transport-specific error types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct RequestError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

pub const CODE_UNAUTHORIZED: &str = "unauthorized";
pub const CODE_TRANSPORT: &str = "transport";
pub const CODE_DECODE: &str = "decode";
pub const CODE_AMOUNT_OUT_OF_RANGE: &str = "amount_out_of_range";

impl RequestError {
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(CODE_TRANSPORT.to_string()),
            status: None,
        }
    }

    #[must_use]
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            status: Some(status),
        }
    }

    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(CODE_DECODE.to_string()),
            status: None,
        }
    }

    /// Terminal authorization failure: a fresh token was still rejected.
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(CODE_UNAUTHORIZED.to_string()),
            status: Some(401),
        }
    }

    #[must_use]
    pub fn validation(code: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.to_string()),
            status: None,
        }
    }

    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        self.status == Some(401)
    }
}
