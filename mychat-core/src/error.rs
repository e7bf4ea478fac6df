//! Error types for the request client and socket session

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Request timed out")]
    Timeout,

    #[error("Unexpected HTTP status {0}")]
    Status(StatusCode),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("API error {code}: {message}")]
    Business { code: i64, message: String },

    /// The request was still rejected after a successful token refresh.
    #[error("Unauthorized ({code}): {message}")]
    Unauthorized { code: i64, message: String },

    #[error("Token refresh impossible: no refresh token stored")]
    RefreshImpossible,

    #[error("Token refresh failed: {0}")]
    RefreshFailed(RefreshError),

    #[error("Invalid socket URL: {0}")]
    InvalidUrl(String),
}

/// Outcome of a failed refresh exchange.
///
/// `Clone` because one outcome is handed to every caller waiting on the same
/// exchange.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
    #[error("no refresh token stored")]
    MissingRefreshToken,

    #[error("server rejected refresh ({code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("refresh response missing tokens")]
    IncompleteTokens,

    #[error("refresh request timed out")]
    Timeout,

    #[error("refresh request failed: {0}")]
    Transport(String),

    #[error("refresh response is not an envelope: {0}")]
    InvalidResponse(String),

    #[error("refresh task ended without an outcome")]
    Aborted,
}

impl From<RefreshError> for ClientError {
    fn from(err: RefreshError) -> Self {
        match err {
            RefreshError::MissingRefreshToken => ClientError::RefreshImpossible,
            // A slow refresh is reported like any other slow exchange
            RefreshError::Timeout => ClientError::Timeout,
            other => ClientError::RefreshFailed(other),
        }
    }
}
