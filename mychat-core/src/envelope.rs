//! Response envelope shared by every API endpoint
//!
//! Every body is `{ "code": <int>, "message": <string>, "data": <T> }`.
//! A `code` of 200 is success; anything else is a failure even when the
//! HTTP status is 200. Two codes (and HTTP 401) mean the access token is no
//! longer valid and must be refreshed.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ClientError;

/// Success code
pub const CODE_OK: i64 = 200;

/// Access token rejected
pub const CODE_UNAUTHORIZED: i64 = 401;

/// Access token expired, refresh required
pub const CODE_TOKEN_NEEDS_REFRESH: i64 = 40001;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T = Value> {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }
}

/// Whether an envelope code means "refresh the access token".
pub fn is_auth_expiry_code(code: i64) -> bool {
    code == CODE_UNAUTHORIZED || code == CODE_TOKEN_NEEDS_REFRESH
}

/// How a single response should be handled by the request client
#[derive(Debug)]
pub(crate) enum Verdict {
    Success(Value),
    AuthExpired { code: i64, message: String },
    Failed(ClientError),
}

/// Classify a response from its HTTP status and raw body.
pub(crate) fn classify(status: StatusCode, body: &[u8]) -> Verdict {
    let envelope = serde_json::from_slice::<ApiResponse>(body).ok();

    if status == StatusCode::UNAUTHORIZED {
        let (code, message) = envelope
            .map(|e| (e.code, e.message))
            .unwrap_or_else(|| (CODE_UNAUTHORIZED, "unauthorized".to_string()));
        return Verdict::AuthExpired { code, message };
    }

    let Some(envelope) = envelope else {
        if status.is_success() {
            return Verdict::Failed(ClientError::InvalidResponse(
                "body is not a response envelope".to_string(),
            ));
        }
        return Verdict::Failed(ClientError::Status(status));
    };

    if is_auth_expiry_code(envelope.code) {
        return Verdict::AuthExpired {
            code: envelope.code,
            message: envelope.message,
        };
    }

    match (status.is_success(), envelope.code) {
        (true, CODE_OK) => Verdict::Success(envelope.data),
        (false, CODE_OK) => Verdict::Failed(ClientError::Status(status)),
        (_, code) => Verdict::Failed(ClientError::Business {
            code,
            message: if envelope.message.is_empty() {
                format!("api error code={code}")
            } else {
                envelope.message
            },
        }),
    }
}
