//! Common surface of the UDP and HTTP connection handlers

use std::fmt;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::events::ConnectionEvent;
use crate::state::{ConnectionSnapshot, InvalidSessionReason, Protocol};

/// Why work that needs a handler cannot run right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PauseReason {
    /// Inside a ban window
    Banned { until: DateTime<Utc> },
    /// The server asked us to back off
    Backoff { until: DateTime<Utc> },
    /// The session must be re-established first
    InvalidSession(InvalidSessionReason),
    /// The handler cannot authenticate at all
    NotConfigured,
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Banned { until } => write!(f, "banned until {}", until),
            Self::Backoff { until } => write!(f, "backing off until {}", until),
            Self::InvalidSession(InvalidSessionReason::Expired) => write!(f, "session expired"),
            Self::InvalidSession(InvalidSessionReason::CredentialsRejected) => {
                write!(f, "credentials rejected")
            }
            Self::NotConfigured => write!(f, "credentials not configured"),
        }
    }
}

/// Read-only view of a connection handler shared by both protocols
///
/// Implementations must answer from in-memory state only; these methods are
/// called on every scheduling tick.
pub trait ConnectionHandler: Send + Sync {
    fn protocol(&self) -> Protocol;

    fn snapshot(&self) -> ConnectionSnapshot;

    fn is_banned(&self) -> bool;

    /// `Some` while work needing this handler should not be dispatched
    fn pause_reason(&self) -> Option<PauseReason>;

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent>;
}
