//! AniDB API client for tsundoku
//!
//! This crate owns every connection the server makes to AniDB:
//! - [`UdpConnectionHandler`]: the session-oriented UDP API (login, keep-alive,
//!   ban detection, backoff)
//! - [`HttpConnectionHandler`]: the stateless, rate-limited HTTP API
//!
//! Both handlers enforce the AniDB rate limits, fail fast while banned and
//! publish [`ConnectionEvent`]s that the job scheduler uses to pause and
//! resume work.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use tsundoku_anidb_client::{Command, UdpConnectionHandler};
//! use tsundoku_shared_config::AniDbConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AniDbConfig::from_env()?;
//! let udp = Arc::new(UdpConnectionHandler::from_config(&config));
//! let shutdown = CancellationToken::new();
//! let _maintenance = udp.spawn_maintenance(shutdown.clone());
//!
//! let response = udp
//!     .send(Command::new("FILE").param("fid", 312498).param("fmask", "7000000000"), &shutdown)
//!     .await?;
//! println!("{} {}", response.code, response.message);
//! # Ok(())
//! # }
//! ```
//!
//! # Environment Variables
//!
//! - `ANIDB_USERNAME` / `ANIDB_PASSWORD`: UDP API credentials (optional)
//! - `ANIDB_UDP_HOST`, `ANIDB_UDP_PORT`, `ANIDB_CLIENT_PORT`: UDP endpoint
//! - `ANIDB_HTTP_URL`: HTTP API endpoint

mod error;
mod events;
mod handler;
mod http;
mod rate_limit;
mod state;
pub mod udp;

pub use error::{AniDbError, AniDbResult, ErrorClass};
pub use events::{ConnectionEvent, EventPublisher};
pub use handler::{ConnectionHandler, PauseReason};
pub use http::{HttpConnectionHandler, HttpHandlerConfig};
pub use rate_limit::{RateLimitConfig, RateLimiter, RatePermit};
pub use state::{
    Backoff, BanWindow, ConnectionSnapshot, ConnectionState, ConnectionStatus, InvalidSessionReason,
    Protocol, SessionToken,
};
pub use udp::{
    Command, Credentials, ReturnCode, SocketTransport, UdpConnectionHandler, UdpHandlerConfig,
    UdpResponse, UdpTransport,
};
