//! Acquisition filter integration tests
//!
//! This module tests which categories each filter holds back:
//! - Storage offline or blocked for maintenance
//! - Network connectivity across several monitors
//! - AniDB session and stateless protocol pause states
//! - Recovery notifications after a network outage

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tsundoku_anidb_client::PauseReason;
use tsundoku_test_utils::{MockAniDbHttpServer, MockReply, MockUdpTransport};
use tsundoku_anidb_client::{HttpConnectionHandler, UdpConnectionHandler};
use tsundoku_worker::jobs::{register_anidb_jobs, GetFileJob, ADD_TO_MYLIST, GET_ANIME, GET_FILE};
use tsundoku_worker::monitors::watch_recovery;
use tsundoku_worker::{
    AcquisitionFilter, AniDbFilter, ConnectivityMonitor, Dependency, JobCategory, JobState,
    JobTypeRegistry, NetworkFilter, StorageFilter, StorageMonitor,
};

fn categories(names: &[&str]) -> HashSet<JobCategory> {
    names.iter().map(|name| JobCategory::new(*name)).collect()
}

/// Registry with one job per dependency combination
fn dependency_registry() -> JobTypeRegistry {
    let local = ScriptedJob::new(info("local_hash").requires(Dependency::Storage));
    let remote = ScriptedJob::new(
        info("remote_lookup")
            .requires(Dependency::Storage)
            .requires(Dependency::Network),
    );
    let offline = ScriptedJob::new(info("cleanup"));
    registry_with(&[local, remote, offline])
}

fn anidb_registry(
    udp: &Arc<UdpConnectionHandler>,
    http: &Arc<HttpConnectionHandler>,
) -> JobTypeRegistry {
    let mut registry = JobTypeRegistry::new();
    register_anidb_jobs(&mut registry, udp.clone(), http.clone(), RecordingSink::new())
    .unwrap();
    registry
}

// =============================================================================
// Storage
// =============================================================================

#[tokio::test]
async fn test_storage_filter_tracks_availability() {
    let registry = dependency_registry();
    let monitor = Arc::new(StorageMonitor::new(true));
    let filter = StorageFilter::new(monitor.clone(), &registry);

    assert_eq!(filter.name(), "storage");
    assert!(filter.types_to_exclude().is_empty());

    monitor.set_online(false);
    assert_eq!(
        filter.types_to_exclude(),
        categories(&["local_hash", "remote_lookup"])
    );

    monitor.set_online(true);
    monitor.set_blocked(true);
    assert_eq!(
        filter.types_to_exclude(),
        categories(&["local_hash", "remote_lookup"])
    );

    monitor.set_blocked(false);
    assert!(filter.types_to_exclude().is_empty());
}

#[tokio::test]
async fn test_storage_filter_reports_changes() {
    let registry = dependency_registry();
    let monitor = Arc::new(StorageMonitor::new(true));
    let filter = StorageFilter::new(monitor.clone(), &registry);
    let mut changes = filter.state_changed();

    monitor.set_blocked(true);

    tokio::time::timeout(Duration::from_secs(1), changes.next())
        .await
        .expect("storage change should be reported")
        .expect("stream should stay open");
}

// =============================================================================
// Network
// =============================================================================

#[tokio::test]
async fn test_network_filter_needs_any_monitor_connected() {
    let registry = dependency_registry();
    let primary = ManualConnectivityMonitor::new("primary", true);
    let fallback = ManualConnectivityMonitor::new("fallback", false);
    let filter = NetworkFilter::new(
        vec![
            primary.clone() as Arc<dyn ConnectivityMonitor>,
            fallback.clone() as Arc<dyn ConnectivityMonitor>,
        ],
        &registry,
    );

    assert!(filter.is_connected());
    assert!(filter.types_to_exclude().is_empty());

    primary.set_connected(false);
    assert!(!filter.is_connected());
    assert_eq!(filter.types_to_exclude(), categories(&["remote_lookup"]));

    fallback.set_connected(true);
    assert!(filter.types_to_exclude().is_empty());
}

#[tokio::test]
async fn test_network_filter_without_monitors_pauses_network_jobs() {
    let registry = dependency_registry();
    let filter = NetworkFilter::new(vec![], &registry);

    assert!(filter.monitors().is_empty());
    assert_eq!(filter.types_to_exclude(), categories(&["remote_lookup"]));
}

#[tokio::test]
async fn test_network_filter_reports_monitor_changes() {
    let registry = dependency_registry();
    let primary = ManualConnectivityMonitor::new("primary", true);
    let fallback = ManualConnectivityMonitor::new("fallback", true);
    let filter = NetworkFilter::new(
        vec![
            primary.clone() as Arc<dyn ConnectivityMonitor>,
            fallback.clone() as Arc<dyn ConnectivityMonitor>,
        ],
        &registry,
    );
    let mut changes = filter.state_changed();

    fallback.set_connected(false);

    tokio::time::timeout(Duration::from_secs(1), changes.next())
        .await
        .expect("monitor change should be reported")
        .expect("stream should stay open");
}

#[tokio::test]
async fn test_recovery_fires_only_after_outage() {
    let monitor = ManualConnectivityMonitor::new("primary", false);
    let recoveries = Arc::new(AtomicUsize::new(0));
    let shutdown = CancellationToken::new();

    let task = tokio::spawn({
        let monitors = vec![monitor.clone() as Arc<dyn ConnectivityMonitor>];
        let recoveries = recoveries.clone();
        let shutdown = shutdown.clone();
        async move {
            watch_recovery(monitors, shutdown, move || {
                let recoveries = recoveries.clone();
                async move {
                    recoveries.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;
        }
    });

    // First connection after startup is not a recovery
    monitor.set_connected(true);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recoveries.load(Ordering::SeqCst), 0);

    monitor.set_connected(false);
    tokio::time::sleep(Duration::from_millis(50)).await;
    monitor.set_connected(true);
    eventually(|| recoveries.load(Ordering::SeqCst) == 1).await;

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("watcher should stop on shutdown")
        .unwrap();
}

// =============================================================================
// AniDB
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_session_filter_without_credentials() {
    let transport = Arc::new(MockUdpTransport::new());
    let udp = udp_handler(&transport, false);
    let http = http_handler("http://127.0.0.1:9".to_string());
    let registry = anidb_registry(&udp, &http);
    let filter = AniDbFilter::session(udp, &registry);

    assert_eq!(filter.name(), "anidb_udp");
    assert_eq!(filter.pause_reason(), Some(PauseReason::NotConfigured));
    assert_eq!(
        filter.types_to_exclude(),
        categories(&[GET_FILE, ADD_TO_MYLIST])
    );
}

#[tokio::test(start_paused = true)]
async fn test_session_filter_pauses_on_ban() {
    let transport = Arc::new(MockUdpTransport::new());
    transport.reply_always("FILE", MockReply::text("555 BANNED"));
    let udp = udp_handler(&transport, true);
    let http = http_handler("http://127.0.0.1:9".to_string());
    let registry = anidb_registry(&udp, &http);
    let session = AniDbFilter::session(udp, &registry);
    let stateless = AniDbFilter::stateless(http, &registry);
    let mut changes = session.state_changed();

    assert!(session.types_to_exclude().is_empty());

    let harness = Harness::new(registry, vec![]);
    let job = GetFileJob::job(FILE_SIZE, ED2K).unwrap();
    let key = job.key();
    harness.scheduler.enqueue(job).await.unwrap();
    harness.scheduler.tick().await.unwrap();
    harness.wait_idle().await;

    let record = harness.record(&key);
    assert_eq!(record.state, JobState::Waiting);
    assert_eq!(record.attempts, 0);

    assert!(matches!(session.pause_reason(), Some(PauseReason::Banned { .. })));
    assert_eq!(
        session.types_to_exclude(),
        categories(&[GET_FILE, ADD_TO_MYLIST])
    );
    assert!(stateless.types_to_exclude().is_empty());
    assert!(changes.next().await.is_some());
}

#[tokio::test]
async fn test_stateless_filter_covers_http_jobs() {
    let server = MockAniDbHttpServer::start().await;
    server.mock_banned().await;
    let transport = Arc::new(MockUdpTransport::new());
    let http = http_handler(server.url());
    let registry = anidb_registry(&udp_handler(&transport, true), &http);
    let filter = AniDbFilter::stateless(http.clone(), &registry);

    assert_eq!(filter.name(), "anidb_http");
    assert!(filter.types_to_exclude().is_empty());

    let result = http.get_anime(1, &CancellationToken::new()).await;

    assert!(result.is_err());
    assert!(matches!(filter.pause_reason(), Some(PauseReason::Banned { .. })));
    assert_eq!(filter.types_to_exclude(), categories(&[GET_ANIME]));
}
