//! Stateless, rate-limited connection handler for the AniDB HTTP API

use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use reqwest::{Client, StatusCode};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use tsundoku_shared_config::AniDbConfig;

use crate::error::{AniDbError, AniDbResult};
use crate::events::{ConnectionEvent, EventPublisher};
use crate::handler::{ConnectionHandler, PauseReason};
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::state::{ConnectionSnapshot, ConnectionState, Protocol};

/// HTTP API protocol version spoken by this client
const PROTOCOL_VERSION: u32 = 1;

/// Marker AniDB puts in the body of a banned client's response
const BANNED_MARKER: &str = ">banned<";

/// Tunables of an [`HttpConnectionHandler`]
#[derive(Debug, Clone)]
pub struct HttpHandlerConfig {
    pub base_url: String,
    pub client_name: String,
    pub client_version: u32,
    pub request_timeout: Duration,
    pub ban_duration: Duration,
    pub rate_limit: RateLimitConfig,
}

impl HttpHandlerConfig {
    pub fn from_config(config: &AniDbConfig) -> Self {
        Self {
            base_url: config.http_url.clone(),
            client_name: config.client_name.clone(),
            client_version: config.client_version,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            ban_duration: Duration::from_secs_f64(config.http_ban_hours * 3600.0),
            rate_limit: RateLimitConfig::http(),
        }
    }
}

impl Default for HttpHandlerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://api.anidb.net:9001/httpapi".to_string(),
            client_name: "tsundoku".to_string(),
            client_version: 1,
            request_timeout: Duration::from_secs(20),
            ban_duration: Duration::from_secs(12 * 60 * 60),
            rate_limit: RateLimitConfig::http(),
        }
    }
}

/// Connection handler for the stateless HTTP API
///
/// There is no session: the handler only enforces the rate limit and tracks
/// bans. Requests do not hold the limiter across the round trip, but
/// consecutive requests still start at least one delay apart. Ban expiry is
/// driven by [`HttpConnectionHandler::spawn_maintenance`].
pub struct HttpConnectionHandler {
    config: HttpHandlerConfig,
    http_client: Client,
    rate_limiter: RateLimiter,
    state: RwLock<ConnectionState>,
    events: EventPublisher,
    wake: Notify,
}

impl fmt::Debug for HttpConnectionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnectionHandler")
            .field("base_url", &self.config.base_url)
            .field("status", &self.snapshot().status)
            .finish_non_exhaustive()
    }
}

impl HttpConnectionHandler {
    /// # Errors
    /// Returns `AniDbError::InvalidInput` for an empty base URL and
    /// `AniDbError::Http` if the HTTP client cannot be built
    pub fn new(config: HttpHandlerConfig) -> AniDbResult<Self> {
        if config.base_url.trim().is_empty() {
            return Err(AniDbError::InvalidInput(
                "HTTP API base URL cannot be empty".to_string(),
            ));
        }

        let http_client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(2)
            .user_agent(format!("{}/{}", config.client_name, config.client_version))
            .build()?;
        let rate_limiter = RateLimiter::new("anidb-http", config.rate_limit);

        Ok(Self {
            config,
            http_client,
            rate_limiter,
            state: RwLock::new(ConnectionState::new(Protocol::Http)),
            events: EventPublisher::new(),
            wake: Notify::new(),
        })
    }

    pub fn from_config(config: &AniDbConfig) -> AniDbResult<Self> {
        Self::new(HttpHandlerConfig::from_config(config))
    }

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

    pub fn is_banned(&self) -> bool {
        self.read_state().is_banned_at(Instant::now())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Fetch anime details (XML) by AniDB anime id
    #[instrument(skip(self, cancel))]
    pub async fn get_anime(&self, anime_id: u64, cancel: &CancellationToken) -> AniDbResult<String> {
        if anime_id == 0 {
            return Err(AniDbError::InvalidInput("anime id must be positive".to_string()));
        }
        let aid = anime_id.to_string();
        self.get(&[("request", "anime"), ("aid", &aid)], cancel).await
    }

    /// Issue one request against the HTTP API and return the response body
    ///
    /// Client name, version and protocol version are added to `params`.
    ///
    /// # Errors
    /// - `AniDbError::Banned` while inside a ban window (nothing is sent), or
    ///   when this request revealed the ban
    /// - `AniDbError::Api` when the body is an `<error>` document
    /// - `AniDbError::Status` for other non-success statuses
    /// - `AniDbError::Http`, `AniDbError::Cancelled`
    pub async fn get(
        &self,
        params: &[(&str, &str)],
        cancel: &CancellationToken,
    ) -> AniDbResult<String> {
        self.check_available()?;

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AniDbError::Cancelled),
            permit = self.rate_limiter.acquire(false) => permit,
        };
        // A request that finished while we waited may have revealed a ban
        if let Err(e) = self.check_available() {
            permit.abandon();
            return Err(e);
        }
        drop(permit);

        let client_version = self.config.client_version.to_string();
        let protocol_version = PROTOCOL_VERSION.to_string();
        let mut query: Vec<(&str, &str)> = vec![
            ("client", self.config.client_name.as_str()),
            ("clientver", client_version.as_str()),
            ("protover", protocol_version.as_str()),
        ];
        query.extend_from_slice(params);

        debug!(params = ?params, "AniDB HTTP request");
        let request = async {
            let response = self
                .http_client
                .get(&self.config.base_url)
                .query(&query)
                .send()
                .await?;
            let status = response.status();
            let body = response.text().await?;
            Ok::<_, reqwest::Error>((status, body))
        };

        let (status, body) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AniDbError::Cancelled),
            result = request => match result {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(error = %e, "AniDB HTTP request failed");
                    let was_online = {
                        let mut state = self.write_state();
                        let was_online = state.is_online();
                        state.set_online(false);
                        was_online
                    };
                    if was_online {
                        self.publish_state();
                    }
                    return Err(AniDbError::Http(e));
                }
            },
        };

        self.classify(status, body)
    }

    fn classify(&self, status: StatusCode, body: String) -> AniDbResult<String> {
        let now = Instant::now();
        let banned = status == StatusCode::SERVICE_UNAVAILABLE
            || body.to_ascii_lowercase().contains(BANNED_MARKER);
        if banned {
            return Err(self.enter_ban(status));
        }

        let was_online = {
            let mut state = self.write_state();
            let was_online = state.is_online();
            state.touch(now, true);
            was_online
        };
        if !was_online {
            self.publish_state();
        }

        if let Some((code, message)) = parse_error_document(&body) {
            warn!(code, message = %message, "AniDB HTTP API returned an error");
            return Err(AniDbError::Api { code, message });
        }
        if !status.is_success() {
            return Err(AniDbError::Status(status.as_u16()));
        }
        Ok(body)
    }

    fn check_available(&self) -> AniDbResult<()> {
        let now = Instant::now();
        self.expire_elapsed(now);

        match self.read_state().ban().filter(|ban| ban.is_active_at(now)) {
            Some(ban) => Err(AniDbError::Banned {
                protocol: Protocol::Http,
                expires_at: ban.expires_at_utc(),
            }),
            None => Ok(()),
        }
    }

    /// Clear an elapsed ban window; reported once
    fn expire_elapsed(&self, now: Instant) {
        let ban_elapsed = self.read_state().ban().is_some_and(|ban| !ban.is_active_at(now));
        if !ban_elapsed {
            return;
        }

        let expired = self.write_state().expire_ban(now);
        if let Some(window) = expired {
            info!(banned_for = ?window.duration(), "AniDB HTTP ban expired");
            self.events.publish(ConnectionEvent::BanExpired {
                protocol: Protocol::Http,
            });
            self.publish_state();
        }
    }

    fn enter_ban(&self, status: StatusCode) -> AniDbError {
        let window = self
            .write_state()
            .enter_ban(Instant::now(), self.config.ban_duration);

        warn!(
            status = status.as_u16(),
            expires_at = %window.expires_at_utc(),
            "AniDB HTTP API ban detected"
        );
        self.events.publish(ConnectionEvent::BanOccurred {
            protocol: Protocol::Http,
            banned_at: window.banned_at_utc(),
            expires_at: window.expires_at_utc(),
        });
        self.publish_state();
        self.wake.notify_one();

        AniDbError::Banned {
            protocol: Protocol::Http,
            expires_at: window.expires_at_utc(),
        }
    }

    // ========== Maintenance ==========

    /// Clear ban windows as soon as they elapse until `shutdown` fires
    pub fn spawn_maintenance(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let handler = Arc::clone(self);
        tokio::spawn(async move { handler.maintain(shutdown).await })
    }

    async fn maintain(&self, shutdown: CancellationToken) {
        debug!("AniDB HTTP maintenance started");
        loop {
            let expires_at = self.read_state().ban().map(|ban| ban.expires_at());
            match expires_at {
                Some(at) => tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = self.wake.notified() => continue,
                    _ = sleep_until(at) => {}
                },
                None => tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = self.wake.notified() => continue,
                },
            }
            self.expire_elapsed(Instant::now());
        }
        debug!("AniDB HTTP maintenance stopped");
    }
}

/// `<error code="N">message</error>` bodies; the code attribute is optional
fn parse_error_document(body: &str) -> Option<(u16, String)> {
    let start = body.find("<error")?;
    let rest = &body[start..];
    let tag_end = rest.find('>')?;
    let tag = &rest[..tag_end];

    let code = tag
        .split_once("code=\"")
        .and_then(|(_, tail)| tail.split_once('"'))
        .and_then(|(code, _)| code.parse().ok())
        .unwrap_or(0);

    let inner = &rest[tag_end + 1..];
    let message = inner
        .split_once("</error>")
        .map(|(message, _)| message)
        .unwrap_or(inner)
        .trim()
        .to_string();

    Some((code, message))
}

impl ConnectionHandler for HttpConnectionHandler {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        HttpConnectionHandler::snapshot(self)
    }

    fn is_banned(&self) -> bool {
        HttpConnectionHandler::is_banned(self)
    }

    fn pause_reason(&self) -> Option<PauseReason> {
        let now = Instant::now();
        self.read_state()
            .ban()
            .filter(|ban| ban.is_active_at(now))
            .map(|ban| PauseReason::Banned {
                until: ban.expires_at_utc(),
            })
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        HttpConnectionHandler::subscribe(self)
    }
}
