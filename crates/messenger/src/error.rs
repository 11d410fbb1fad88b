//! Error types for the messenger.
//!
//! Nothing here is fatal to a messenger instance: a `RequestError` is scoped to one
//! request, a `ResponderError` to one inbound request, and a `ConfigError` to the
//! configuration lookup that produced it.

use duplex_protocol::ChannelName;
use thiserror::Error;

/// Failure of a single `request()` call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// No matching response arrived within the timeout window
    #[error("Request on channel '{channel}' timed out after {timeout_ms}ms")]
    Timeout { channel: ChannelName, timeout_ms: u64 },

    /// The settlement was dropped without a value (the messenger went away)
    #[error("Request was cancelled")]
    Cancelled,

    /// The typed request payload could not be serialized
    #[error("Failed to encode request payload: {0}")]
    Encode(String),

    /// The response payload did not match the expected type
    #[error("Failed to decode response payload: {0}")]
    Decode(String),
}

impl RequestError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Failure while a responder produced its reply.
///
/// These are logged and swallowed: no response envelope is sent, so the peer's
/// request runs into its own timeout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResponderError {
    #[error("could not decode request payload: {0}")]
    Decode(String),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("could not encode response payload: {0}")]
    Encode(String),
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var} must be a non-negative integer number of milliseconds, got '{value}'")]
    InvalidTimeout { var: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let err = RequestError::Timeout {
            channel: ChannelName::from("foo"),
            timeout_ms: 50,
        };
        assert_eq!(err.to_string(), "Request on channel 'foo' timed out after 50ms");
        assert!(err.is_timeout());
    }

    #[test]
    fn test_other_errors_are_not_timeouts() {
        assert!(!RequestError::Cancelled.is_timeout());
        assert!(!RequestError::Decode("expected u32".into()).is_timeout());
    }
}
