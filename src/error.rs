//! Error types for the gateway client.
//!
//! ERROR HANDLING
//! ==============
//! Failures that only concern one request (timeout, closure while pending,
//! bad command uri) are returned to that request's caller. Failures that
//! concern the link itself (socket errors, stalled requests) tear the socket
//! down and leave recovery to the reconnection loop.

use std::time::Duration;

/// Failure while fetching or parsing the digest challenge.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The probe request could not be performed.
    #[error("challenge probe failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The probe answered with something other than `401`.
    #[error("unexpected challenge probe status {0}")]
    UnexpectedStatus(u16),
    /// The `401` carried no `www-authenticate` header.
    #[error("missing required www-authenticate header")]
    MissingChallenge,
    /// A required digest field is absent from the challenge.
    #[error("digest challenge is missing `{0}`")]
    MissingField(&'static str),
}

/// Invalid or missing configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
}

/// Error surfaced by [`crate::Client`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// The socket upgrade or a later socket operation failed.
    #[error("websocket connect failed: {0}")]
    WsConnect(Box<tokio_tungstenite::tungstenite::Error>),
    /// The HTTP client used for the challenge probe could not be built.
    #[error("http client setup failed: {0}")]
    HttpClient(#[from] reqwest::Error),
    /// An upgrade header value could not be constructed.
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue),
    /// TLS setup for the socket failed.
    #[error("tls configuration failed: {0}")]
    Tls(#[from] rustls::Error),
    /// No socket is open; call `connect()` first.
    #[error("socket is not connected, please use connect() first")]
    NotConnected,
    /// The socket closed while the request was still waiting for its reply.
    #[error("socket closed while request {transaction_id} was pending")]
    ClosedWhilePending { transaction_id: String },
    /// No reply matched the request before its deadline.
    #[error("request {transaction_id} timed out after {timeout:?}")]
    Timeout { transaction_id: String, timeout: Duration },
    /// `command()` only accepts `/devices/<id>/endpoints/<id>/cdata?name=<name>`.
    #[error("invalid command uri: {0}")]
    InvalidCommandUri(String),
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WsConnect(Box::new(error))
    }
}
