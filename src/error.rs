//! Crate error type.
//!
//! [`ZerobotError`] is the single error enum for the framework. The first
//! group of variants is the RPC failure taxonomy (what a caller or an operator
//! can observe); the second group covers the plumbing around it.
//!
//! | Variant             | Where it surfaces                               |
//! |---------------------|-------------------------------------------------|
//! | `Protocol`          | logged and dropped by the receiving reactor     |
//! | `ProtectedMethod`   | returned to the caller as `Response.error`      |
//! | `UnknownMethod`     | returned to the caller as `Response.error`      |
//! | `RemoteExecution`   | raised by blocking calls                        |
//! | `Timeout`           | raised by blocking calls, synthesized locally   |
//! | `Routing`           | logged and dropped by addressable bind channels |

use crate::protocol::RemoteError;

/// Errors produced by the broker, the executors and the client.
#[derive(Debug, thiserror::Error)]
pub enum ZerobotError {
    /// Malformed envelope, frame or payload.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A reserved or protection-marked method was invoked remotely.
    #[error("method {0} is protected")]
    ProtectedMethod(String),

    /// The exposed object has no method with this name.
    #[error("no method named {0}")]
    UnknownMethod(String),

    /// The remote method failed; carries the remote message and trace.
    #[error("remote execution failed: {message}")]
    RemoteExecution {
        /// Remote error message.
        message: String,
        /// Formatted remote trace.
        trace: String,
    },

    /// No response arrived before the deadline.
    #[error("call {uid} timed out")]
    Timeout {
        /// Correlation id of the call.
        uid: String,
    },

    /// The recipient identity is not connected.
    #[error("no route to {0}")]
    Routing(String),

    /// A call with this uid is already outstanding.
    #[error("duplicate outstanding uid: {0}")]
    DuplicateUid(String),

    /// Address could not be parsed or is not supported.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The channel or component was closed.
    #[error("channel closed")]
    Closed,

    /// Underlying socket failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ZerobotError {
    /// Returns a stable short code naming the error category.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "protocol",
            Self::ProtectedMethod(_) => "protected_method",
            Self::UnknownMethod(_) => "unknown_method",
            Self::RemoteExecution { .. } => "remote_execution",
            Self::Timeout { .. } => "timeout",
            Self::Routing(_) => "routing",
            Self::DuplicateUid(_) => "duplicate_uid",
            Self::InvalidAddress(_) => "invalid_address",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Closed => "closed",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }

    /// Returns `true` for failures the caller can reasonably retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Routing(_) | Self::Io(_))
    }
}

impl From<RemoteError> for ZerobotError {
    fn from(err: RemoteError) -> Self {
        Self::RemoteExecution {
            message: err.message,
            trace: err.trace,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = ZerobotError> = std::result::Result<T, E>;

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes_are_stable() {
        assert_eq!(ZerobotError::Protocol("x".into()).kind(), "protocol");
        assert_eq!(
            ZerobotError::Timeout { uid: "1".into() }.kind(),
            "timeout"
        );
        assert_eq!(ZerobotError::Closed.kind(), "closed");
    }

    #[test]
    fn remote_error_converts_with_trace() {
        let err: ZerobotError = RemoteError::new("boom", "trace line").into();
        let ZerobotError::RemoteExecution { message, trace } = &err else {
            panic!("expected remote execution error");
        };
        assert_eq!(message, "boom");
        assert_eq!(trace, "trace line");
        assert_eq!(err.to_string(), "remote execution failed: boom");
    }

    #[test]
    fn transient_classification() {
        assert!(ZerobotError::Timeout { uid: "a".into() }.is_transient());
        assert!(!ZerobotError::ProtectedMethod("_x".into()).is_transient());
    }
}
