//! Session-oriented connection handler for the AniDB UDP API
//!
//! The handler owns the one session this client may hold. Every request goes
//! through the same path:
//!
//! 1. fail fast without touching the socket while banned or backing off
//! 2. log in if there is no session yet
//! 3. wait for the rate limiter; the permit is held until the reply arrives,
//!    so at most one request is in flight
//! 4. exchange one datagram under the request timeout and the caller's
//!    cancellation token
//! 5. classify the return code and update the connection state
//!
//! Nothing is retried in here. Bans, invalid sessions and transport failures
//! are reported to the caller as typed errors.

use std::fmt;
use std::io;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};
use tsundoku_shared_config::AniDbConfig;

use super::codec::{mask_for_log, Command, ResponseClass, ReturnCode, UdpResponse};
use super::transport::{SocketTransport, UdpTransport};
use crate::error::{AniDbError, AniDbResult};
use crate::events::{ConnectionEvent, EventPublisher};
use crate::handler::{ConnectionHandler, PauseReason};
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::state::{
    wall_clock, ConnectionSnapshot, ConnectionState, ConnectionStatus, InvalidSessionReason,
    Protocol, SessionToken,
};

/// UDP API protocol version spoken by this client
const PROTOCOL_VERSION: u32 = 3;

/// How long the maintenance task sleeps when nothing is scheduled
const IDLE_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// AniDB account credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    /// # Errors
    /// Returns `AniDbError::MissingCredentials` if either value is blank
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> AniDbResult<Self> {
        let username = username.into();
        let password = password.into();
        if username.trim().is_empty() || password.is_empty() {
            return Err(AniDbError::MissingCredentials);
        }
        Ok(Self { username, password })
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Tunables of a [`UdpConnectionHandler`]
#[derive(Debug, Clone)]
pub struct UdpHandlerConfig {
    pub client_name: String,
    pub client_version: u32,
    /// Upper bound for one request/response exchange
    pub request_timeout: Duration,
    /// Length of the ban window after a ban is detected
    pub ban_duration: Duration,
    /// Pause after OUT OF SERVICE / SERVER BUSY replies
    pub backoff_duration: Duration,
    /// Keep-alive ping interval while a session is idle
    pub ping_interval: Duration,
    /// Idle time after which the session is logged out
    pub idle_logout: Duration,
    /// Wait before re-authenticating after the server invalidated the session
    pub session_retry_cooldown: Duration,
    pub rate_limit: RateLimitConfig,
}

impl UdpHandlerConfig {
    pub fn from_config(config: &AniDbConfig) -> Self {
        Self {
            client_name: config.client_name.clone(),
            client_version: config.client_version,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            ban_duration: Duration::from_secs_f64(config.udp_ban_hours * 3600.0),
            ping_interval: Duration::from_secs(config.ping_interval_secs),
            idle_logout: Duration::from_secs(config.idle_logout_secs),
            ..Self::default()
        }
    }
}

impl Default for UdpHandlerConfig {
    fn default() -> Self {
        Self {
            client_name: "tsundoku".to_string(),
            client_version: 1,
            request_timeout: Duration::from_secs(20),
            ban_duration: Duration::from_secs(90 * 60),
            backoff_duration: Duration::from_secs(5 * 60),
            ping_interval: Duration::from_secs(90),
            idle_logout: Duration::from_secs(5 * 60),
            session_retry_cooldown: Duration::from_secs(30),
            rate_limit: RateLimitConfig::udp(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExchangeKind {
    Command,
    Ping,
    Logout,
}

impl ExchangeKind {
    fn counts_as_activity(self) -> bool {
        self == Self::Command
    }
}

/// Connection handler for the session-oriented UDP API
pub struct UdpConnectionHandler {
    config: UdpHandlerConfig,
    transport: Arc<dyn UdpTransport>,
    rate_limiter: RateLimiter,
    state: RwLock<ConnectionState>,
    credentials: RwLock<Option<Credentials>>,
    /// Serializes login and logout so only one session can exist
    session_lock: Mutex<()>,
    events: EventPublisher,
    /// Reschedules the maintenance task after state changes
    wake: Notify,
}

impl fmt::Debug for UdpConnectionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpConnectionHandler")
            .field("status", &self.status())
            .field("has_credentials", &self.has_credentials())
            .finish_non_exhaustive()
    }
}

impl UdpConnectionHandler {
    pub fn new(
        config: UdpHandlerConfig,
        transport: Arc<dyn UdpTransport>,
        credentials: Option<Credentials>,
    ) -> Self {
        let rate_limiter = RateLimiter::new("anidb-udp", config.rate_limit);
        Self {
            config,
            transport,
            rate_limiter,
            state: RwLock::new(ConnectionState::new(Protocol::Udp)),
            credentials: RwLock::new(credentials),
            session_lock: Mutex::new(()),
            events: EventPublisher::new(),
            wake: Notify::new(),
        }
    }

    /// Build a handler with a real socket from the shared configuration
    pub fn from_config(config: &AniDbConfig) -> Self {
        let transport = Arc::new(SocketTransport::new(
            config.udp_server_addr(),
            config.client_port,
        ));
        let credentials = config
            .credentials()
            .and_then(|(user, pass)| Credentials::new(user, pass).ok());
        Self::new(UdpHandlerConfig::from_config(config), transport, credentials)
    }

    // ========== State access ==========

    fn read_state(&self) -> RwLockReadGuard<'_, ConnectionState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ConnectionState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn publish_state(&self) {
        self.events
            .publish(ConnectionEvent::StateChanged(self.snapshot()));
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.read_state().snapshot(Instant::now())
    }

    pub fn status(&self) -> ConnectionStatus {
        self.read_state().status_at(Instant::now())
    }

    pub fn is_banned(&self) -> bool {
        self.read_state().is_banned_at(Instant::now())
    }

    pub fn is_authenticated(&self) -> bool {
        self.status() == ConnectionStatus::Authenticated
    }

    fn current_session(&self) -> Option<SessionToken> {
        self.read_state().session().cloned()
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Replace the stored credentials
    ///
    /// Clears a previous credential rejection so the next request logs in
    /// again. A live session is kept.
    pub fn set_credentials(&self, username: &str, password: &str) -> AniDbResult<()> {
        let credentials = Credentials::new(username, password)?;
        *self.credentials.write().unwrap_or_else(|e| e.into_inner()) = Some(credentials);

        let cleared = {
            let mut state = self.write_state();
            state.invalid_session() == Some(InvalidSessionReason::CredentialsRejected)
                && state.clear_invalid_session()
        };
        if cleared {
            self.publish_state();
        }
        self.wake.notify_one();
        Ok(())
    }

    // ========== Operations ==========

    /// Log in with the given credentials
    ///
    /// A no-op while a session is held. Credential rejection emits
    /// [`ConnectionEvent::LoginFailed`] and leaves the handler disconnected.
    #[instrument(skip(self, password, cancel))]
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        cancel: &CancellationToken,
    ) -> AniDbResult<()> {
        if self.is_authenticated() {
            debug!("Already logged in to AniDB UDP API");
            return Ok(());
        }
        self.set_credentials(username, password)?;
        self.ensure_session(cancel).await.map(|_| ())
    }

    /// Send a command on the session, logging in first if needed
    ///
    /// # Errors
    /// - `AniDbError::Banned` while inside a ban window (nothing is sent), or
    ///   when this request triggered the ban
    /// - `AniDbError::Backoff` while the server asked us to back off
    /// - `AniDbError::InvalidSession` when the server dropped the session;
    ///   the next call logs in again
    /// - `AniDbError::Api` for any other error code
    /// - `AniDbError::Timeout`, `AniDbError::Io`, `AniDbError::Cancelled`
    #[instrument(skip(self, command, cancel), fields(command = command.name()))]
    pub async fn send(
        &self,
        command: Command,
        cancel: &CancellationToken,
    ) -> AniDbResult<UdpResponse> {
        self.check_available()?;
        let session = self.ensure_session(cancel).await?;
        let response = self
            .exchange(&command, Some(&session), ExchangeKind::Command, cancel)
            .await?;

        match response.code.class() {
            ResponseClass::Error => Err(AniDbError::Api {
                code: response.code.as_u16(),
                message: response.message,
            }),
            _ => Ok(response),
        }
    }

    /// Liveness probe that does not use the session
    ///
    /// Pings always run at the short rate-limit delay and never count as
    /// session activity. Returns the round-trip time.
    #[instrument(skip(self, cancel))]
    pub async fn ping(&self, cancel: &CancellationToken) -> AniDbResult<Duration> {
        let started = Instant::now();
        let command = Command::new("PING").param("nat", 1);
        let response = self
            .exchange(&command, None, ExchangeKind::Ping, cancel)
            .await?;

        match response.code {
            ReturnCode::Pong => Ok(started.elapsed()),
            code => Err(AniDbError::Api {
                code: code.as_u16(),
                message: response.message,
            }),
        }
    }

    /// End the session; local state is cleared whatever the network says
    pub async fn logout(&self) {
        let _guard = self.session_lock.lock().await;
        let Some(token) = self.current_session() else {
            return;
        };

        if !self.is_banned() {
            let cancel = CancellationToken::new();
            match self
                .exchange(&Command::new("LOGOUT"), Some(&token), ExchangeKind::Logout, &cancel)
                .await
            {
                Ok(response) if response.code == ReturnCode::LoggedOut => {
                    debug!("Logged out of AniDB UDP API");
                }
                Ok(response) => debug!(code = %response.code, "Unexpected reply to LOGOUT"),
                Err(e) => debug!(error = %e, "LOGOUT failed, dropping the session anyway"),
            }
        }

        if self.write_state().clear_session().is_some() {
            info!("AniDB UDP session closed");
            self.publish_state();
        }
    }

    /// Log out and forget any invalid-session flag
    pub async fn force_logout(&self) {
        self.logout().await;
        if self.write_state().clear_invalid_session() {
            self.publish_state();
        }
        self.wake.notify_one();
    }

    /// Log out and reopen the socket, e.g. after a network change
    ///
    /// An active ban is kept; it only ends when its window elapses.
    pub async fn force_reconnection(&self) {
        self.force_logout().await;
        if let Err(e) = self.transport.reconnect().await {
            error!(error = %e, "Failed to reset AniDB UDP socket");
        }
        self.write_state().set_online(false);
        info!("AniDB UDP connection reset");
        self.publish_state();
    }

    // ========== Request path ==========

    /// Fail fast while banned or backing off, clearing windows that elapsed
    fn check_available(&self) -> AniDbResult<()> {
        let now = Instant::now();
        self.expire_elapsed(now);

        let state = self.read_state();
        if let Some(ban) = state.ban().filter(|ban| ban.is_active_at(now)) {
            return Err(AniDbError::Banned {
                protocol: Protocol::Udp,
                expires_at: ban.expires_at_utc(),
            });
        }
        if let Some(backoff) = state.backoff().filter(|b| b.is_active_at(now)) {
            return Err(AniDbError::Backoff {
                protocol: Protocol::Udp,
                until: wall_clock(backoff.until(), now),
                reason: backoff.reason().to_string(),
            });
        }
        Ok(())
    }

    /// Clear elapsed ban and backoff windows; each is reported once
    fn expire_elapsed(&self, now: Instant) {
        {
            let state = self.read_state();
            let ban_elapsed = state.ban().is_some_and(|ban| !ban.is_active_at(now));
            let backoff_elapsed = state.backoff().is_some_and(|b| !b.is_active_at(now));
            if !ban_elapsed && !backoff_elapsed {
                return;
            }
        }

        let (ban, backoff) = {
            let mut state = self.write_state();
            (state.expire_ban(now), state.expire_backoff(now))
        };

        if let Some(window) = ban {
            info!(banned_for = ?window.duration(), "AniDB UDP ban expired");
            self.events.publish(ConnectionEvent::BanExpired {
                protocol: Protocol::Udp,
            });
        }
        if let Some(backoff) = &backoff {
            info!(reason = backoff.reason(), "AniDB UDP backoff ended");
        }
        if ban.is_some() || backoff.is_some() {
            self.publish_state();
        }
    }

    async fn ensure_session(&self, cancel: &CancellationToken) -> AniDbResult<SessionToken> {
        if let Some(token) = self.current_session() {
            return Ok(token);
        }

        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AniDbError::Cancelled),
            guard = self.session_lock.lock() => guard,
        };

        // Someone else may have logged in while we waited
        if let Some(token) = self.current_session() {
            return Ok(token);
        }
        self.authenticate(cancel).await
    }

    /// Issue AUTH; caller holds the session lock
    async fn authenticate(&self, cancel: &CancellationToken) -> AniDbResult<SessionToken> {
        if self.read_state().invalid_session() == Some(InvalidSessionReason::CredentialsRejected) {
            return Err(AniDbError::LoginFailed);
        }
        let credentials = self
            .credentials
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(AniDbError::MissingCredentials)?;

        let command = Command::new("AUTH")
            .param("user", &credentials.username)
            .param("pass", &credentials.password)
            .param("protover", PROTOCOL_VERSION)
            .param("client", &self.config.client_name)
            .param("clientver", self.config.client_version)
            .param("nat", 1)
            .param("enc", "UTF8");

        debug!(user = credentials.username(), "Logging in to AniDB UDP API");
        let response = self
            .exchange(&command, None, ExchangeKind::Command, cancel)
            .await?;

        match response.code {
            ReturnCode::LoginAccepted | ReturnCode::LoginAcceptedNewVersion => {
                let token = response.session_token()?;
                if self.write_state().set_session(token.clone()).is_some() {
                    warn!("Replaced a live AniDB UDP session");
                }
                if response.code == ReturnCode::LoginAcceptedNewVersion {
                    info!("A newer AniDB client version is available");
                }
                info!("Logged in to AniDB UDP API");
                self.publish_state();
                self.wake.notify_one();
                Ok(token)
            }
            ReturnCode::LoginFailed => {
                self.write_state()
                    .invalidate_session(InvalidSessionReason::CredentialsRejected, Instant::now());
                error!("AniDB login failed: invalid credentials");
                self.events.publish(ConnectionEvent::LoginFailed);
                self.publish_state();
                Err(AniDbError::LoginFailed)
            }
            code => Err(AniDbError::Api {
                code: code.as_u16(),
                message: response.message,
            }),
        }
    }

    /// One rate-limited request/response exchange
    ///
    /// Ban and invalid-session replies come back as errors; other error codes
    /// are returned as responses for the caller to interpret.
    async fn exchange(
        &self,
        command: &Command,
        session: Option<&SessionToken>,
        kind: ExchangeKind,
        cancel: &CancellationToken,
    ) -> AniDbResult<UdpResponse> {
        self.check_available()?;

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AniDbError::Cancelled),
            permit = self.rate_limiter.acquire(kind == ExchangeKind::Ping) => permit,
        };

        // The previous permit holder may have been banned or lost the session
        if let Err(e) = self.check_available() {
            permit.abandon();
            return Err(e);
        }
        if let Some(token) = session {
            if self.current_session().as_ref() != Some(token) {
                permit.abandon();
                return Err(AniDbError::InvalidSession);
            }
        }

        let wire = command.encode(session);
        trace!(command = %mask_for_log(&wire), "AniDB UDP request");
        let started = Instant::now();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = timeout(self.config.request_timeout, self.transport.exchange(wire.as_bytes())) => Some(result),
        };
        drop(permit);

        let Some(result) = outcome else {
            return Err(AniDbError::Cancelled);
        };

        let now = Instant::now();
        let bytes = match result {
            Err(_) => {
                self.write_state().note_traffic(now);
                warn!(
                    command = command.name(),
                    timeout = ?self.config.request_timeout,
                    "AniDB UDP request timed out"
                );
                return Err(AniDbError::Timeout(self.config.request_timeout));
            }
            Ok(Err(e)) => {
                self.on_socket_error(&e);
                return Err(AniDbError::Io(e));
            }
            Ok(Ok(bytes)) => bytes,
        };

        if bytes.iter().all(|b| *b == 0) {
            // Banned clients get empty datagrams instead of a reply
            return Err(self.enter_ban("empty response"));
        }

        let text = String::from_utf8_lossy(&bytes);
        let response = match UdpResponse::parse(&text) {
            Ok(response) => response,
            Err(e) => {
                self.write_state().touch(now, false);
                return Err(e);
            }
        };
        trace!(
            code = %response.code,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "AniDB UDP response"
        );

        self.classify(response, kind, now)
    }

    fn classify(
        &self,
        response: UdpResponse,
        kind: ExchangeKind,
        now: Instant,
    ) -> AniDbResult<UdpResponse> {
        match response.code.class() {
            ResponseClass::Ban => Err(self.enter_ban(&response.message)),
            ResponseClass::InvalidSession => {
                {
                    let mut state = self.write_state();
                    state.note_traffic(now);
                    state.invalidate_session(InvalidSessionReason::Expired, now);
                }
                warn!(code = %response.code, "AniDB UDP session is no longer valid");
                self.publish_state();
                self.wake.notify_one();
                Err(AniDbError::InvalidSession)
            }
            ResponseClass::Error => {
                let backoff = response.code.starts_backoff();
                {
                    let mut state = self.write_state();
                    state.touch(now, kind.counts_as_activity());
                    if backoff {
                        state.start_backoff(
                            now + self.config.backoff_duration,
                            format!("{} {}", response.code, response.message),
                        );
                    }
                }
                if backoff {
                    warn!(
                        code = %response.code,
                        pause = ?self.config.backoff_duration,
                        "AniDB asked us to back off"
                    );
                    self.publish_state();
                    self.wake.notify_one();
                }
                Ok(response)
            }
            ResponseClass::Success => {
                let was_online = {
                    let mut state = self.write_state();
                    let was_online = state.is_online();
                    state.touch(now, kind.counts_as_activity());
                    was_online
                };
                if !was_online {
                    self.publish_state();
                }
                Ok(response)
            }
        }
    }

    fn enter_ban(&self, reason: &str) -> AniDbError {
        let window = self
            .write_state()
            .enter_ban(Instant::now(), self.config.ban_duration);

        warn!(
            reason,
            expires_at = %window.expires_at_utc(),
            "AniDB UDP API ban detected"
        );
        self.events.publish(ConnectionEvent::BanOccurred {
            protocol: Protocol::Udp,
            banned_at: window.banned_at_utc(),
            expires_at: window.expires_at_utc(),
        });
        self.publish_state();
        self.wake.notify_one();

        AniDbError::Banned {
            protocol: Protocol::Udp,
            expires_at: window.expires_at_utc(),
        }
    }

    fn on_socket_error(&self, error: &io::Error) {
        {
            let mut state = self.write_state();
            state.set_online(false);
            state.clear_session();
        }
        error!(error = %error, "AniDB UDP socket error");
        self.publish_state();
    }

    // ========== Maintenance ==========

    /// Run keep-alive pings, idle logout, ban/backoff expiry and session
    /// recovery until `shutdown` fires, then log out
    pub fn spawn_maintenance(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let handler = Arc::clone(self);
        tokio::spawn(async move { handler.maintain(shutdown).await })
    }

    async fn maintain(&self, shutdown: CancellationToken) {
        debug!("AniDB UDP maintenance started");
        loop {
            let next = self.next_maintenance(Instant::now());
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.wake.notified() => continue,
                _ = sleep_until(next) => {}
            }
            self.run_maintenance(&shutdown).await;
        }
        self.logout().await;
        debug!("AniDB UDP maintenance stopped");
    }

    fn next_maintenance(&self, now: Instant) -> Instant {
        let has_credentials = self.has_credentials();
        let state = self.read_state();
        let mut next = now + IDLE_MAINTENANCE_INTERVAL;

        let mut deadlines = Vec::new();
        if let Some(ban) = state.ban() {
            deadlines.push(ban.expires_at());
        }
        if let Some(backoff) = state.backoff() {
            deadlines.push(backoff.until());
        }
        if !state.is_banned_at(now) && !state.is_backing_off_at(now) {
            if state.invalid_session() == Some(InvalidSessionReason::Expired) && has_credentials {
                if let Some(since) = state.invalid_since() {
                    deadlines.push(since + self.config.session_retry_cooldown);
                }
            }
            if state.session().is_some() {
                if let Some(at) = state.last_traffic() {
                    deadlines.push(at + self.config.ping_interval);
                }
                if let Some(at) = state.last_activity() {
                    deadlines.push(at + self.config.idle_logout);
                }
            }
        }

        for deadline in deadlines {
            next = next.min(deadline);
        }
        next
    }

    async fn run_maintenance(&self, cancel: &CancellationToken) {
        let now = Instant::now();
        self.expire_elapsed(now);

        let (invalid, invalid_since, has_session, last_activity, last_traffic) = {
            let state = self.read_state();
            if state.is_banned_at(now) || state.is_backing_off_at(now) {
                return;
            }
            (
                state.invalid_session(),
                state.invalid_since(),
                state.session().is_some(),
                state.last_activity(),
                state.last_traffic(),
            )
        };

        let recovery_due = invalid == Some(InvalidSessionReason::Expired)
            && self.has_credentials()
            && invalid_since.is_some_and(|at| now >= at + self.config.session_retry_cooldown);
        if recovery_due {
            info!("Re-establishing AniDB UDP session");
            if let Err(e) = self.ensure_session(cancel).await {
                warn!(error = %e, "AniDB UDP session recovery failed");
                self.write_state().defer_session_recovery(Instant::now());
            }
            return;
        }

        if !has_session {
            return;
        }

        if last_activity.is_some_and(|at| now >= at + self.config.idle_logout) {
            info!(idle = ?self.config.idle_logout, "Logging out idle AniDB UDP session");
            self.logout().await;
            return;
        }

        if last_traffic.is_some_and(|at| now >= at + self.config.ping_interval) {
            match self.ping(cancel).await {
                Ok(rtt) => trace!(rtt_ms = rtt.as_millis() as u64, "AniDB UDP keep-alive"),
                Err(e) => warn!(error = %e, "AniDB UDP keep-alive failed"),
            }
        }
    }
}

impl ConnectionHandler for UdpConnectionHandler {
    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        UdpConnectionHandler::snapshot(self)
    }

    fn is_banned(&self) -> bool {
        UdpConnectionHandler::is_banned(self)
    }

    fn pause_reason(&self) -> Option<PauseReason> {
        let now = Instant::now();
        {
            let state = self.read_state();
            if let Some(ban) = state.ban().filter(|ban| ban.is_active_at(now)) {
                return Some(PauseReason::Banned {
                    until: ban.expires_at_utc(),
                });
            }
            if let Some(backoff) = state.backoff().filter(|b| b.is_active_at(now)) {
                return Some(PauseReason::Backoff {
                    until: wall_clock(backoff.until(), now),
                });
            }
            if let Some(reason) = state.invalid_session() {
                return Some(PauseReason::InvalidSession(reason));
            }
        }
        if !self.has_credentials() {
            return Some(PauseReason::NotConfigured);
        }
        None
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        UdpConnectionHandler::subscribe(self)
    }
}
