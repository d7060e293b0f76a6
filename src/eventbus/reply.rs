//! Request/reply failure outcomes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Why a request did not receive a successful reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplyFailure {
    /// No reply arrived within the send timeout.
    Timeout,
    /// No consumer was registered at the address.
    NoHandlers,
    /// The recipient answered with [`Message::fail`](crate::eventbus::Message::fail).
    RecipientFailure,
}

impl ReplyFailure {
    pub fn to_i8(self) -> i8 {
        match self {
            ReplyFailure::Timeout => 0,
            ReplyFailure::NoHandlers => 1,
            ReplyFailure::RecipientFailure => 2,
        }
    }

    pub fn from_i8(value: i8) -> Option<Self> {
        match value {
            0 => Some(ReplyFailure::Timeout),
            1 => Some(ReplyFailure::NoHandlers),
            2 => Some(ReplyFailure::RecipientFailure),
            _ => None,
        }
    }
}

impl fmt::Display for ReplyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReplyFailure::Timeout => "TIMEOUT",
            ReplyFailure::NoHandlers => "NO_HANDLERS",
            ReplyFailure::RecipientFailure => "RECIPIENT_FAILURE",
        };
        f.write_str(name)
    }
}

/// A failed reply. Also travels over the bus as a message body when a
/// recipient fails a request.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{failure_type} ({failure_code}): {message}")]
pub struct ReplyException {
    failure_type: ReplyFailure,
    failure_code: i32,
    message: String,
}

impl ReplyException {
    pub fn new(failure_type: ReplyFailure, failure_code: i32, message: impl Into<String>) -> Self {
        Self {
            failure_type,
            failure_code,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ReplyFailure::Timeout, -1, message)
    }

    pub fn no_handlers(address: &str) -> Self {
        Self::new(
            ReplyFailure::NoHandlers,
            -1,
            format!("no handlers for address {}", address),
        )
    }

    pub fn recipient_failure(code: i32, message: impl Into<String>) -> Self {
        Self::new(ReplyFailure::RecipientFailure, code, message)
    }

    pub fn failure_type(&self) -> ReplyFailure {
        self.failure_type
    }

    pub fn failure_code(&self) -> i32 {
        self.failure_code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_type_wire_values() {
        for failure in [
            ReplyFailure::Timeout,
            ReplyFailure::NoHandlers,
            ReplyFailure::RecipientFailure,
        ] {
            assert_eq!(ReplyFailure::from_i8(failure.to_i8()), Some(failure));
        }
        assert_eq!(ReplyFailure::from_i8(9), None);
    }

    #[test]
    fn test_display() {
        let e = ReplyException::recipient_failure(42, "bad input");
        assert_eq!(e.to_string(), "RECIPIENT_FAILURE (42): bad input");
        assert_eq!(
            ReplyException::no_handlers("svc.users").to_string(),
            "NO_HANDLERS (-1): no handlers for address svc.users"
        );
    }
}
