//! Shared test utilities for tsundoku workspace
//!
//! This crate provides mock implementations of the AniDB APIs for testing
//! without network dependencies. These mocks are used by the AniDB client and
//! worker test suites.
//!
//! # Mock Services
//!
//! - [`MockUdpTransport`] - Scripted datagram transport for the UDP handler
//! - [`MockAniDbHttpServer`] - Mock AniDB HTTP API server
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tsundoku_test_utils::{MockReply, MockUdpTransport};
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_with_mocks() {
//!     let transport = Arc::new(MockUdpTransport::new());
//!     transport.reply_once("FILE", MockReply::text("555 BANNED"));
//!
//!     // Hand `transport.clone()` to UdpConnectionHandler::new
//! }
//! ```

mod http;
mod udp;

pub mod fixtures;

pub use http::MockAniDbHttpServer;
pub use udp::{MockReply, MockUdpTransport, SentDatagram};
