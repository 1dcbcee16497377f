// src/client/error.rs

//! Execution client failures and their retry classification.

use thiserror::Error;

/// How the retry policy should treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Connection-level trouble: refused, reset, timed out, or a 5xx.
    Transient,
    /// The service understood the request and rejected it.
    Permanent,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("connection to execution service failed: {0}")]
    Connection(String),

    #[error("request to execution service timed out: {0}")]
    Timeout(String),

    #[error("execution service responded {status}: {message}")]
    Status { status: u16, message: String },

    #[error("could not decode execution service response: {0}")]
    Decode(String),

    #[error("invalid request to execution service: {0}")]
    InvalidRequest(String),
}

impl ClientError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        ClientError::Status {
            status,
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ClientError::Connection(_) | ClientError::Timeout(_) => ErrorClass::Transient,
            ClientError::Status { status, .. } if *status >= 500 => ErrorClass::Transient,
            // 408 and 429 are the service asking us to come back later.
            ClientError::Status { status: 408 | 429, .. } => ErrorClass::Transient,
            ClientError::Status { .. } | ClientError::Decode(_) | ClientError::InvalidRequest(_) => {
                ErrorClass::Permanent
            }
        }
    }

    /// HTTP status carried by the failure, if the service answered at all.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            ClientError::status(status.as_u16(), err.to_string())
        } else if err.is_decode() {
            ClientError::Decode(err.to_string())
        } else if err.is_builder() {
            ClientError::InvalidRequest(err.to_string())
        } else {
            ClientError::Connection(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_status_family() {
        assert_eq!(ClientError::status(400, "bad").class(), ErrorClass::Permanent);
        assert_eq!(ClientError::status(404, "gone").class(), ErrorClass::Permanent);
        assert_eq!(ClientError::status(429, "slow down").class(), ErrorClass::Transient);
        assert_eq!(ClientError::status(500, "boom").class(), ErrorClass::Transient);
        assert_eq!(ClientError::status(503, "busy").class(), ErrorClass::Transient);
    }

    #[test]
    fn transport_failures_are_transient() {
        assert_eq!(
            ClientError::Connection("refused".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            ClientError::Timeout("30s".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            ClientError::Decode("not json".into()).class(),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn only_status_failures_carry_a_code() {
        assert_eq!(ClientError::status(400, "bad").http_status(), Some(400));
        assert_eq!(ClientError::Connection("x".into()).http_status(), None);
    }
}
