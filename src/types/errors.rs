//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. Errors are
//! `Clone` because a single failure may be observed by several futures and
//! callbacks (a composite and its components, a reply and its timeout).

use crate::eventbus::{ReplyException, ReplyFailure};
use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the courier runtime.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Codec registry and wire-format failures.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Asynchronous request/reply failures (no handlers, timeout, recipient failure).
    #[error(transparent)]
    Reply(#[from] ReplyException),

    /// Operation not permitted in the current state.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Invalid argument supplied by the caller.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// Application failure carried by a future.
    #[error("{0}")]
    Failed(String),

    /// A panic captured from a task, handler, or blocking action.
    #[error("uncaught failure: {0}")]
    Uncaught(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Failures raised by the codec manager and the built-in codecs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("no message codec registered for name: {0}")]
    UnknownCodec(String),

    #[error("no message codec for type: {0}")]
    UnknownType(String),

    #[error("already a codec registered with name: {0}")]
    DuplicateName(String),

    #[error("already a default codec registered for type: {0}")]
    DuplicateDefault(String),

    #[error("cannot register a system codec: {0}")]
    IllegalCodec(String),

    #[error("codec {codec} cannot handle body of type {type_name}")]
    TypeMismatch { codec: String, type_name: String },

    #[error("codec {codec} failed to decode payload: {reason}")]
    Decode { codec: String, reason: String },
}

impl CodecError {
    pub fn decode(codec: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Decode {
            codec: codec.into(),
            reason: reason.into(),
        }
    }
}

// Convenience constructors
impl Error {
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    pub fn illegal_argument(msg: impl Into<String>) -> Self {
        Self::IllegalArgument(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn uncaught(msg: impl Into<String>) -> Self {
        Self::Uncaught(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Reply failure kind, when this error came back from a request.
    pub fn reply_failure(&self) -> Option<ReplyFailure> {
        match self {
            Error::Reply(e) => Some(e.failure_type()),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Render a captured panic payload as a message.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(e) = payload.downcast_ref::<Error>() {
        e.to_string()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_error_is_transparent() {
        let err: Error = CodecError::UnknownCodec("mycodec".to_string()).into();
        assert_eq!(
            err.to_string(),
            "no message codec registered for name: mycodec"
        );
    }

    #[test]
    fn test_reply_failure_accessor() {
        let err: Error = ReplyException::timeout("no reply within 10ms").into();
        assert_eq!(err.reply_failure(), Some(ReplyFailure::Timeout));
        assert_eq!(Error::failed("boom").reply_failure(), None);
    }

    #[test]
    fn test_panic_message_variants() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("static str");
        assert_eq!(panic_message(payload.as_ref()), "static str");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");

        let payload: Box<dyn std::any::Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "panic with non-string payload");
    }
}
