//! HTTP connection handler integration tests
//!
//! Runs against a wiremock server in real time with short rate-limit delays.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use common::{count_bans, drain, http_config, http_handler};
use tokio_util::sync::CancellationToken;
use tsundoku_anidb_client::{
    AniDbError, ConnectionEvent, ConnectionHandler, ErrorClass, HttpConnectionHandler,
    HttpHandlerConfig, PauseReason, Protocol,
};
use tsundoku_test_utils::MockAniDbHttpServer;

const DELAY: Duration = Duration::from_millis(150);

#[tokio::test]
async fn test_get_anime_returns_document() {
    let server = MockAniDbHttpServer::start().await;
    server.mock_anime(1, "Cowboy Bebop").await;
    let handler = http_handler(server.url(), DELAY);

    let body = handler
        .get_anime(1, &CancellationToken::new())
        .await
        .unwrap();

    assert!(body.contains("Cowboy Bebop"));
    let query = &server.request_queries().await[0];
    assert!(query.contains("client=tsundoku"));
    assert!(query.contains("clientver=1"));
    assert!(query.contains("protover=1"));
    assert!(query.contains("aid=1"));
}

#[tokio::test]
async fn test_requests_are_spaced_by_rate_limit() {
    let server = MockAniDbHttpServer::start().await;
    server.mock_anime(1, "Cowboy Bebop").await;
    let handler = http_handler(server.url(), DELAY);
    let cancel = CancellationToken::new();

    let started = Instant::now();
    for _ in 0..3 {
        handler.get_anime(1, &cancel).await.unwrap();
    }

    assert!(started.elapsed() >= DELAY * 2);
    assert_eq!(server.request_count().await, 3);
}

#[tokio::test]
async fn test_ban_document_trips_breaker() {
    let server = MockAniDbHttpServer::start().await;
    server.mock_banned().await;
    let handler = http_handler(server.url(), DELAY);
    let mut events = handler.subscribe();
    let cancel = CancellationToken::new();

    let err = handler.get_anime(1, &cancel).await.unwrap_err();
    assert_matches!(err, AniDbError::Banned { .. });
    assert_eq!(err.class(), ErrorClass::Banned);
    assert_matches!(handler.pause_reason(), Some(PauseReason::Banned { .. }));

    // Fails fast without another request
    let err = handler.get_anime(2, &cancel).await.unwrap_err();
    assert_matches!(err, AniDbError::Banned { .. });
    assert_eq!(server.request_count().await, 1);
    assert_eq!(count_bans(&drain(&mut events)), 1);
}

#[tokio::test]
async fn test_ban_expires_without_further_requests() {
    let server = MockAniDbHttpServer::start().await;
    server.mock_banned().await;
    let config = HttpHandlerConfig {
        ban_duration: Duration::from_millis(300),
        ..http_config(server.url(), DELAY)
    };
    let handler = Arc::new(HttpConnectionHandler::new(config).unwrap());
    let shutdown = CancellationToken::new();
    let maintenance = handler.spawn_maintenance(shutdown.clone());
    let mut events = handler.subscribe();

    let err = handler
        .get_anime(1, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_matches!(err, AniDbError::Banned { .. });

    let expired = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::BanExpired { protocol }) => break protocol,
                Ok(_) => continue,
                Err(e) => panic!("event stream closed: {e}"),
            }
        }
    })
    .await
    .expect("ban expiry should be published");

    assert_eq!(expired, Protocol::Http);
    assert!(!handler.is_banned());
    assert!(handler.pause_reason().is_none());
    assert!(handler.snapshot().banned_until.is_none());
    assert_eq!(server.request_count().await, 1);

    // The recovered state follows the expiry
    assert_matches!(
        drain(&mut events).as_slice(),
        [ConnectionEvent::StateChanged(snapshot)] if !snapshot.is_banned()
    );

    shutdown.cancel();
    maintenance.await.unwrap();
}

#[tokio::test]
async fn test_service_unavailable_is_a_ban() {
    let server = MockAniDbHttpServer::start().await;
    server.mock_status(503).await;
    let handler = http_handler(server.url(), DELAY);

    let err = handler
        .get_anime(1, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_matches!(err, AniDbError::Banned { .. });
    assert!(handler.is_banned());
}

#[tokio::test]
async fn test_error_document_maps_to_api_error() {
    let server = MockAniDbHttpServer::start().await;
    server.mock_error(302, "client version missing or invalid").await;
    let handler = http_handler(server.url(), DELAY);

    let err = handler
        .get_anime(1, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_matches!(err, AniDbError::Api { code: 302, .. });
    assert!(!err.is_retryable());
    assert!(!handler.is_banned());
}

#[tokio::test]
async fn test_server_error_is_retryable() {
    let server = MockAniDbHttpServer::start().await;
    server.mock_status(500).await;
    let handler = http_handler(server.url(), DELAY);

    let err = handler
        .get_anime(1, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_matches!(err, AniDbError::Status(500));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_zero_anime_id_rejected_without_request() {
    let server = MockAniDbHttpServer::start().await;
    let handler = http_handler(server.url(), DELAY);

    let err = handler
        .get_anime(0, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_matches!(err, AniDbError::InvalidInput(_));
    assert_eq!(server.request_count().await, 0);
}

#[tokio::test]
async fn test_cancellation_aborts_request() {
    let server = MockAniDbHttpServer::start().await;
    server
        .mock_anime_slow(1, "Cowboy Bebop", Duration::from_secs(3))
        .await;
    let handler = http_handler(server.url(), DELAY);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = handler.get_anime(1, &cancel).await.unwrap_err();

    assert_matches!(err, AniDbError::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!handler.is_banned());
}
