//! AniDB client error types

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::state::Protocol;

/// AniDB client errors
#[derive(Error, Debug)]
pub enum AniDbError {
    /// The API refused further traffic; nothing was sent
    #[error("AniDB {protocol} API is banned until {expires_at}")]
    Banned {
        protocol: Protocol,
        expires_at: DateTime<Utc>,
    },

    /// The UDP session is no longer valid and must be re-established
    #[error("AniDB UDP session is invalid or expired")]
    InvalidSession,

    /// AniDB rejected the configured username/password
    #[error("AniDB login failed: credentials rejected")]
    LoginFailed,

    /// No credentials are configured for the UDP API
    #[error("AniDB credentials are not configured")]
    MissingCredentials,

    /// The server asked us to back off for a while
    #[error("AniDB {protocol} API is backing off until {until}: {reason}")]
    Backoff {
        protocol: Protocol,
        until: DateTime<Utc>,
        reason: String,
    },

    /// No response within the request timeout
    #[error("request to AniDB timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the request
    #[error("request to AniDB was cancelled")]
    Cancelled,

    /// UDP socket failure
    #[error("AniDB socket error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// AniDB answered with an error code
    #[error("AniDB returned {code}: {message}")]
    Api { code: u16, message: String },

    /// The HTTP API answered with a non-success status
    #[error("AniDB HTTP API returned status {0}")]
    Status(u16),

    /// The response could not be understood
    #[error("unexpected AniDB response: {0}")]
    UnexpectedResponse(String),

    /// Invalid input provided to a client method
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// How an error should be handled by whoever issued the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Circuit breaker is open; wait for the ban window to elapse
    Banned,
    /// Needs a fresh login before the request can be repeated
    InvalidSession,
    /// Worth retrying later
    Transient,
    /// Retrying will not help
    Fatal,
}

impl AniDbError {
    /// Classify the error for retry decisions
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Banned { .. } => ErrorClass::Banned,
            Self::InvalidSession | Self::LoginFailed | Self::MissingCredentials => {
                ErrorClass::InvalidSession
            }
            Self::Backoff { .. }
            | Self::Timeout(_)
            | Self::Cancelled
            | Self::Io(_)
            | Self::UnexpectedResponse(_) => ErrorClass::Transient,
            Self::Http(e) => {
                if e.is_timeout() || e.is_connect() {
                    return ErrorClass::Transient;
                }
                match e.status() {
                    Some(status) if status.is_server_error() => ErrorClass::Transient,
                    Some(_) => ErrorClass::Fatal,
                    None => ErrorClass::Transient,
                }
            }
            Self::Status(status) if *status >= 500 => ErrorClass::Transient,
            Self::Status(_) => ErrorClass::Fatal,
            Self::Api { code, .. } if is_transient_code(*code) => ErrorClass::Transient,
            Self::Api { .. } | Self::InvalidInput(_) => ErrorClass::Fatal,
        }
    }

    /// Check if the request may succeed when issued again later
    pub fn is_retryable(&self) -> bool {
        self.class() != ErrorClass::Fatal
    }
}

/// UDP return codes for server-side failures that clear up on their own
fn is_transient_code(code: u16) -> bool {
    matches!(code, 600..=602 | 604)
}

/// Result type for AniDB operations
pub type AniDbResult<T> = Result<T, AniDbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ban_is_its_own_class() {
        let err = AniDbError::Banned {
            protocol: Protocol::Udp,
            expires_at: Utc::now(),
        };
        assert_eq!(err.class(), ErrorClass::Banned);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_session_errors_need_relogin() {
        assert_eq!(AniDbError::InvalidSession.class(), ErrorClass::InvalidSession);
        assert_eq!(AniDbError::LoginFailed.class(), ErrorClass::InvalidSession);
    }

    #[test]
    fn test_server_busy_is_transient() {
        let err = AniDbError::Api {
            code: 602,
            message: "SERVER BUSY".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[test]
    fn test_unknown_command_is_fatal() {
        let err = AniDbError::Api {
            code: 598,
            message: "UNKNOWN COMMAND".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert!(!err.is_retryable());
        assert!(!AniDbError::InvalidInput("empty hash".to_string()).is_retryable());
    }

    #[test]
    fn test_http_status_classes() {
        assert_eq!(AniDbError::Status(503).class(), ErrorClass::Transient);
        assert_eq!(AniDbError::Status(404).class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_timeout_is_transient() {
        assert!(AniDbError::Timeout(Duration::from_secs(20)).is_retryable());
    }
}
