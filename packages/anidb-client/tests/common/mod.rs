//! Common test utilities for AniDB client integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tsundoku_anidb_client::{
    ConnectionEvent, Credentials, HttpConnectionHandler, HttpHandlerConfig, RateLimitConfig,
    UdpConnectionHandler, UdpHandlerConfig,
};
use tsundoku_test_utils::MockUdpTransport;

pub const USERNAME: &str = "tester";
pub const PASSWORD: &str = "hunter2";

/// UDP handler with default timings over a mock transport, with credentials
pub fn udp_handler(transport: &Arc<MockUdpTransport>) -> Arc<UdpConnectionHandler> {
    udp_handler_with(transport, UdpHandlerConfig::default())
}

pub fn udp_handler_with(
    transport: &Arc<MockUdpTransport>,
    config: UdpHandlerConfig,
) -> Arc<UdpConnectionHandler> {
    let credentials = Credentials::new(USERNAME, PASSWORD).ok();
    Arc::new(UdpConnectionHandler::new(
        config,
        transport.clone(),
        credentials,
    ))
}

/// HTTP handler config against a mock server with a short fixed rate limit
pub fn http_config(base_url: String, delay: Duration) -> HttpHandlerConfig {
    HttpHandlerConfig {
        base_url,
        request_timeout: Duration::from_secs(5),
        rate_limit: RateLimitConfig::fixed(delay),
        ..HttpHandlerConfig::default()
    }
}

pub fn http_handler(base_url: String, delay: Duration) -> HttpConnectionHandler {
    HttpConnectionHandler::new(http_config(base_url, delay)).expect("handler should build")
}

/// Everything published so far that has not been received yet
pub fn drain(rx: &mut broadcast::Receiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn count_bans(events: &[ConnectionEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, ConnectionEvent::BanOccurred { .. }))
        .count()
}
