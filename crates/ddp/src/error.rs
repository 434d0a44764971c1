//! Error types.
//!
//! [`DdpError`] is the error object carried on the wire inside `result` and
//! `nosub` envelopes. [`ConnectionError`] covers the conditions that end a
//! connection; those are logged and never sent to the peer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Error type reported for application errors raised by handlers.
pub const METEOR_ERROR: &str = "Meteor.Error";
/// Error type reported when a method name is not registered.
pub const METHOD_ERROR: &str = "Method.Error";
/// Error type reported for server-side protocol errors (unknown subscription, panics).
pub const SERVER_ERROR: &str = "Server.Error";

/// A protocol-shaped error surfaced verbatim to the client.
///
/// Serializes as `{errorType, error, reason, message, details?}` where
/// `message` is conventionally `"<reason> [<error>]"`.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct DdpError {
    #[serde(rename = "errorType")]
    pub error_type: String,
    /// The error code (`"unknown-method"`, `"wrong-params"`, ...).
    pub error: String,
    pub reason: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl DdpError {
    /// Application error with the `Meteor.Error` type.
    pub fn new(error: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::with_type(METEOR_ERROR, error, reason)
    }

    pub fn with_type(
        error_type: impl Into<String>,
        error: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let error = error.into();
        let reason = reason.into();
        Self {
            error_type: error_type.into(),
            message: format!("{} [{}]", reason, error),
            error,
            reason,
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn unknown_method(name: &str) -> Self {
        Self::with_type(
            METHOD_ERROR,
            "unknown-method",
            format!("Method '{}' not found", name),
        )
    }

    pub fn unknown_publication(name: &str) -> Self {
        Self::with_type(
            SERVER_ERROR,
            "unknown-subscription",
            format!("Subscription '{}' not found", name),
        )
    }

    pub fn unknown_subscription_id(id: &str) -> Self {
        Self::with_type(
            SERVER_ERROR,
            "unknown-subscription",
            format!("Subscription ID '{}' not found", id),
        )
    }

    /// Reported when a handler panics; carries no internal state.
    pub fn internal() -> Self {
        Self::with_type(SERVER_ERROR, "internal-server-error", "Internal server error")
    }
}

/// Fatal conditions that close a single connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("malformed envelope: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("envelope is missing the 'msg' field")]
    MissingKind,

    #[error("unrecognized message kind '{0}'")]
    UnknownKind(String),

    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("binary frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("unsupported protocol version '{requested}'")]
    HandshakeFailed { requested: String },

    #[error("could not allocate a unique session id")]
    SessionUnavailable,

    #[error("no pong received within the liveness window")]
    LivenessTimeout,

    #[error("outbound queue full")]
    Backpressure,

    #[error("write did not complete within the write deadline")]
    WriteTimeout,

    #[error("outbound queue closed")]
    Closed,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// An error raised by the underlying message-framed transport.
#[derive(Debug, Error)]
#[error("transport error: {0}")]
pub struct TransportError(Box<dyn std::error::Error + Send + Sync>);

impl TransportError {
    pub fn new(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self(error.into())
    }
}

/// Returned by publication handle operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// The subscription was stopped (unsub, disconnect, or publication-initiated).
    #[error("subscription '{0}' is stopped")]
    Stopped(String),

    /// The connection's publication queue was full; the connection is closing.
    #[error("publication queue of subscription '{0}' is full")]
    Backpressure(String),
}

impl From<PublishError> for DdpError {
    fn from(err: PublishError) -> Self {
        let code = match err {
            PublishError::Stopped(_) => "subscription-stopped",
            PublishError::Backpressure(_) => "too-many-writes",
        };
        Self::with_type(SERVER_ERROR, code, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_follows_reason_code_convention() {
        let err = DdpError::new("wrong-params", "Missing required parameter");
        assert_eq!(err.message, "Missing required parameter [wrong-params]");
        assert_eq!(err.error_type, METEOR_ERROR);
        assert_eq!(err.to_string(), err.message);
    }

    #[test]
    fn test_wire_shape() {
        let err = DdpError::unknown_method("nope");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["errorType"], "Method.Error");
        assert_eq!(json["error"], "unknown-method");
        assert_eq!(json["reason"], "Method 'nope' not found");
        assert_eq!(json["message"], "Method 'nope' not found [unknown-method]");
        assert!(json.get("details").is_none());
    }

    #[test]
    fn test_details_are_serialized_when_present() {
        let err = DdpError::new("too-long", "Name too long")
            .with_details(serde_json::json!({ "max": 10 }));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["details"]["max"], 10);
    }
}
