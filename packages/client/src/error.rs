//! Error types for the Parlor client services.

use thiserror::Error;

/// Errors from the REST collaborator.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The HTTP request itself failed.
    #[error("api request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("api returned status {0}")]
    Status(u16),

    /// No auth token is available for an authenticated call.
    #[error("no auth token is available")]
    NotAuthenticated,
}

/// Errors from the token service.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The token does not have the expected `header.payload.signature` shape.
    #[error("token is not a valid JWT: {0}")]
    Malformed(String),

    /// The payload segment could not be decoded or parsed.
    #[error("token payload could not be decoded: {0}")]
    Payload(String),

    /// The backing token store failed.
    #[error("token store error: {0}")]
    Store(#[from] std::io::Error),
}

/// Errors from audio playback.
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("audio playback failed: {0}")]
    Playback(String),
}
