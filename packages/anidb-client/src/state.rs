//! Connection state owned by a connection handler
//!
//! A [`ConnectionState`] is mutated only by the handler that owns it. Everyone
//! else (acquisition filters, the scheduler, status endpoints) reads a
//! [`ConnectionSnapshot`] taken at a point in time.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Which AniDB API surface a handler talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Session-oriented UDP API
    Udp,
    /// Stateless HTTP API
    Http,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => write!(f, "UDP"),
            Self::Http => write!(f, "HTTP"),
        }
    }
}

/// Coarse connection status derived from the state flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No session; a login is needed before commands can be sent
    Disconnected,
    /// A session token is held
    Authenticated,
    /// Stateless API that is currently usable
    Ready,
    /// Inside a ban window; nothing may be sent
    Banned,
}

/// Why the previous session token must not be reused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidSessionReason {
    /// The server reported the session as invalid or expired
    Expired,
    /// The server rejected the credentials on login
    CredentialsRejected,
}

/// Opaque session key handed out by the UDP API on login
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken([REDACTED])")
    }
}

/// A time-boxed ban: `[banned_at, banned_at + duration)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BanWindow {
    banned_at: Instant,
    duration: Duration,
    banned_at_utc: DateTime<Utc>,
}

impl BanWindow {
    pub fn new(banned_at: Instant, duration: Duration) -> Self {
        Self {
            banned_at,
            duration,
            banned_at_utc: wall_clock(banned_at, Instant::now()),
        }
    }

    pub fn banned_at(&self) -> Instant {
        self.banned_at
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// First instant at which the ban no longer applies
    pub fn expires_at(&self) -> Instant {
        self.banned_at
            .checked_add(self.duration)
            .unwrap_or_else(|| far_future(self.banned_at))
    }

    pub fn is_active_at(&self, now: Instant) -> bool {
        now >= self.banned_at && now < self.expires_at()
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at().saturating_duration_since(now)
    }

    pub fn banned_at_utc(&self) -> DateTime<Utc> {
        self.banned_at_utc
    }

    pub fn expires_at_utc(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.duration)
            .ok()
            .and_then(|d| self.banned_at_utc.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// A server-requested pause shorter than a ban (e.g. SERVER BUSY)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    until: Instant,
    reason: String,
}

impl Backoff {
    pub fn until(&self) -> Instant {
        self.until
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn is_active_at(&self, now: Instant) -> bool {
        now < self.until
    }
}

/// Mutable connection state of a single handler
#[derive(Debug)]
pub struct ConnectionState {
    protocol: Protocol,
    session: Option<SessionToken>,
    online: bool,
    ban: Option<BanWindow>,
    invalid_session: Option<InvalidSessionReason>,
    invalid_since: Option<Instant>,
    backoff: Option<Backoff>,
    last_activity: Option<Instant>,
    last_traffic: Option<Instant>,
}

impl ConnectionState {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            session: None,
            online: false,
            ban: None,
            invalid_session: None,
            invalid_since: None,
            backoff: None,
            last_activity: None,
            last_traffic: None,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn status_at(&self, now: Instant) -> ConnectionStatus {
        if self.is_banned_at(now) {
            ConnectionStatus::Banned
        } else if self.session.is_some() {
            ConnectionStatus::Authenticated
        } else if self.protocol == Protocol::Http {
            ConnectionStatus::Ready
        } else {
            ConnectionStatus::Disconnected
        }
    }

    pub fn is_banned_at(&self, now: Instant) -> bool {
        self.ban.is_some_and(|ban| ban.is_active_at(now))
    }

    pub fn is_backing_off_at(&self, now: Instant) -> bool {
        self.backoff.as_ref().is_some_and(|b| b.is_active_at(now))
    }

    pub fn session(&self) -> Option<&SessionToken> {
        self.session.as_ref()
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn ban(&self) -> Option<&BanWindow> {
        self.ban.as_ref()
    }

    pub fn backoff(&self) -> Option<&Backoff> {
        self.backoff.as_ref()
    }

    pub fn invalid_session(&self) -> Option<InvalidSessionReason> {
        self.invalid_session
    }

    pub fn invalid_since(&self) -> Option<Instant> {
        self.invalid_since
    }

    /// Last command exchange, pings excluded
    pub fn last_activity(&self) -> Option<Instant> {
        self.last_activity
    }

    /// Last datagram or request of any kind
    pub fn last_traffic(&self) -> Option<Instant> {
        self.last_traffic
    }

    pub fn snapshot(&self, now: Instant) -> ConnectionSnapshot {
        ConnectionSnapshot {
            protocol: self.protocol,
            status: self.status_at(now),
            online: self.online,
            has_session: self.session.is_some(),
            invalid_session: self.invalid_session,
            banned_until: self
                .ban
                .filter(|ban| ban.is_active_at(now))
                .map(|ban| ban.expires_at_utc()),
            backoff_until: self
                .backoff
                .as_ref()
                .filter(|b| b.is_active_at(now))
                .map(|b| wall_clock(b.until, now)),
            last_activity: self.last_activity.map(|t| wall_clock(t, now)),
        }
    }

    /// Store a fresh session token, returning the one it replaced
    pub(crate) fn set_session(&mut self, token: SessionToken) -> Option<SessionToken> {
        self.invalid_session = None;
        self.invalid_since = None;
        self.online = true;
        self.session.replace(token)
    }

    pub(crate) fn clear_session(&mut self) -> Option<SessionToken> {
        self.session.take()
    }

    pub(crate) fn invalidate_session(&mut self, reason: InvalidSessionReason, now: Instant) {
        self.session = None;
        self.invalid_session = Some(reason);
        self.invalid_since = Some(now);
    }

    /// Push the next automatic re-login attempt out by restarting the cool-down
    pub(crate) fn defer_session_recovery(&mut self, now: Instant) {
        if self.invalid_session.is_some() {
            self.invalid_since = Some(now);
        }
    }

    pub(crate) fn clear_invalid_session(&mut self) -> bool {
        self.invalid_since = None;
        self.invalid_session.take().is_some()
    }

    /// Enter a ban window; a banned client holds no session
    pub(crate) fn enter_ban(&mut self, now: Instant, duration: Duration) -> BanWindow {
        let window = BanWindow::new(now, duration);
        self.ban = Some(window);
        self.session = None;
        self.invalid_session = None;
        self.invalid_since = None;
        window
    }

    /// Clear a ban whose window has elapsed; yields it only the first time
    pub(crate) fn expire_ban(&mut self, now: Instant) -> Option<BanWindow> {
        match self.ban {
            Some(ban) if !ban.is_active_at(now) => self.ban.take(),
            _ => None,
        }
    }

    pub(crate) fn start_backoff(&mut self, until: Instant, reason: impl Into<String>) {
        self.backoff = Some(Backoff {
            until,
            reason: reason.into(),
        });
    }

    pub(crate) fn expire_backoff(&mut self, now: Instant) -> Option<Backoff> {
        match &self.backoff {
            Some(backoff) if !backoff.is_active_at(now) => self.backoff.take(),
            _ => None,
        }
    }

    /// Record a completed exchange with the server
    pub(crate) fn touch(&mut self, now: Instant, counts_as_activity: bool) {
        self.online = true;
        self.last_traffic = Some(now);
        if counts_as_activity {
            self.last_activity = Some(now);
        }
    }

    /// Record that a request went out, whatever came back
    pub(crate) fn note_traffic(&mut self, now: Instant) {
        self.last_traffic = Some(now);
    }

    pub(crate) fn set_online(&mut self, online: bool) {
        self.online = online;
    }
}

/// Point-in-time, read-only view of a [`ConnectionState`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub protocol: Protocol,
    pub status: ConnectionStatus,
    pub online: bool,
    pub has_session: bool,
    pub invalid_session: Option<InvalidSessionReason>,
    pub banned_until: Option<DateTime<Utc>>,
    pub backoff_until: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
}

impl ConnectionSnapshot {
    pub fn is_banned(&self) -> bool {
        self.status == ConnectionStatus::Banned
    }
}

/// Map a monotonic instant onto the wall clock, relative to `now`
pub(crate) fn wall_clock(at: Instant, now: Instant) -> DateTime<Utc> {
    let wall_now = Utc::now();
    if at <= now {
        chrono::Duration::from_std(now - at)
            .ok()
            .and_then(|d| wall_now.checked_sub_signed(d))
            .unwrap_or(wall_now)
    } else {
        chrono::Duration::from_std(at - now)
            .ok()
            .and_then(|d| wall_now.checked_add_signed(d))
            .unwrap_or(wall_now)
    }
}

/// Roughly thirty years out; used when an addition would overflow
fn far_future(from: Instant) -> Instant {
    from + Duration::from_secs(86_400 * 365 * 30)
}
