//! Connection events published by the handlers
//!
//! Events fan out over a `tokio::sync::broadcast` channel. Publishing never
//! blocks: a subscriber that falls behind gets `RecvError::Lagged` and should
//! re-read the handler's snapshot instead of replaying what it missed.
//! Subscribers must not do slow work inline on the receive path.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::state::{ConnectionSnapshot, Protocol};

/// Default buffer size of the event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Something observable happened to a connection
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Any state transition; carries the state right after it
    StateChanged(ConnectionSnapshot),

    /// The API refused further traffic
    BanOccurred {
        protocol: Protocol,
        banned_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },

    /// A ban window elapsed
    BanExpired { protocol: Protocol },

    /// AniDB rejected the configured credentials
    LoginFailed,
}

impl ConnectionEvent {
    pub fn protocol(&self) -> Option<Protocol> {
        match self {
            Self::StateChanged(snapshot) => Some(snapshot.protocol),
            Self::BanOccurred { protocol, .. } | Self::BanExpired { protocol } => Some(*protocol),
            Self::LoginFailed => Some(Protocol::Udp),
        }
    }
}

/// Sending half of a handler's event channel
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<ConnectionEvent>,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; having no subscribers is not an error
    pub fn publish(&self, event: ConnectionEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}
