//! Scheduler and job fixtures for worker integration tests

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tsundoku_anidb_client::{
    Credentials, HttpConnectionHandler, HttpHandlerConfig, RateLimitConfig, UdpConnectionHandler,
    UdpHandlerConfig,
};
use tsundoku_test_utils::MockUdpTransport;
use tsundoku_worker::{
    AcquisitionFilter, JobKey, JobRecord, JobState, JobTypeInfo, JobTypeRegistry,
    MemoryJobStore, NewJob, Scheduler, SchedulerConfig,
};

use super::mocks::ScriptedJob;

pub const USERNAME: &str = "tester";
pub const PASSWORD: &str = "hunter2";

/// Hash of a file AniDB knows about
pub const ED2K: &str = "a3a6d4a25b6ab1b3bd3ab34a2e5d8c2f";
pub const FILE_SIZE: u64 = 734_003_200;

/// How long [`eventually`] waits before failing a test
pub const EVENTUALLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Fast scheduler settings: short poll, no retry backoff
pub fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        poll_interval: Duration::from_millis(50),
        max_concurrent_jobs: 4,
        max_attempts: 3,
        retry_base_delay: Duration::ZERO,
        retry_max_delay: Duration::ZERO,
        batch_size: 64,
    }
}

/// Registry holding the given handlers
pub fn registry_with(handlers: &[Arc<ScriptedJob>]) -> JobTypeRegistry {
    let mut registry = JobTypeRegistry::new();
    for handler in handlers {
        registry
            .register(handler.clone())
            .expect("test handlers should register");
    }
    registry
}

/// Plain job type with no dependencies or caps
pub fn info(category: &str) -> JobTypeInfo {
    JobTypeInfo::new(category)
}

/// Scheduler over an in-memory store
pub struct Harness {
    pub store: Arc<MemoryJobStore>,
    pub scheduler: Scheduler,
    pub shutdown: CancellationToken,
}

impl Harness {
    pub fn new(registry: JobTypeRegistry, filters: Vec<Arc<dyn AcquisitionFilter>>) -> Self {
        Self::with_config(scheduler_config(), registry, filters)
    }

    pub fn with_config(
        config: SchedulerConfig,
        registry: JobTypeRegistry,
        filters: Vec<Arc<dyn AcquisitionFilter>>,
    ) -> Self {
        let store = Arc::new(MemoryJobStore::new());
        let shutdown = CancellationToken::new();
        let scheduler = Scheduler::new(
            config,
            store.clone(),
            Arc::new(registry),
            filters,
            shutdown.clone(),
        );
        Self {
            store,
            scheduler,
            shutdown,
        }
    }

    /// Start the scheduler's run loop
    pub fn start(&self) -> JoinHandle<()> {
        let scheduler = self.scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    }

    /// Enqueue a job with no payload
    pub async fn enqueue(&self, category: &str, dedup_key: &str) -> JobKey {
        let job = NewJob::new(category, dedup_key);
        let key = job.key();
        self.scheduler
            .enqueue(job)
            .await
            .expect("enqueue should succeed");
        key
    }

    /// Most recent record stored under `key`
    pub fn record(&self, key: &JobKey) -> JobRecord {
        self.store
            .snapshot()
            .into_iter()
            .rev()
            .find(|record| record.key == *key)
            .unwrap_or_else(|| panic!("no job stored for {key}"))
    }

    pub fn state(&self, key: &JobKey) -> JobState {
        self.record(key).state
    }

    /// Wait until `key` reaches `state`
    pub async fn wait_for_state(&self, key: &JobKey, state: JobState) -> JobRecord {
        eventually(|| self.state(key) == state).await;
        self.record(key)
    }

    /// Wait until no job holds a worker
    pub async fn wait_idle(&self) {
        tokio::time::timeout(EVENTUALLY_TIMEOUT, self.scheduler.wait_idle())
            .await
            .expect("scheduler should go idle");
    }

    pub async fn stop(&self, run: JoinHandle<()>) {
        self.shutdown.cancel();
        tokio::time::timeout(EVENTUALLY_TIMEOUT, run)
            .await
            .expect("run loop should stop")
            .expect("run loop should not panic");
    }
}

/// Poll `condition` until it holds, failing the test after [`EVENTUALLY_TIMEOUT`]
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + EVENTUALLY_TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {EVENTUALLY_TIMEOUT:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// =============================================================================
// AniDB handlers
// =============================================================================

/// UDP handler over a mock transport with a short fixed rate limit
pub fn udp_handler(transport: &Arc<MockUdpTransport>, logged_in: bool) -> Arc<UdpConnectionHandler> {
    let config = UdpHandlerConfig {
        rate_limit: RateLimitConfig::fixed(Duration::from_millis(10)),
        ..UdpHandlerConfig::default()
    };
    let credentials = if logged_in {
        Credentials::new(USERNAME, PASSWORD).ok()
    } else {
        None
    };
    Arc::new(UdpConnectionHandler::new(
        config,
        transport.clone(),
        credentials,
    ))
}

/// HTTP handler against `base_url` with a short fixed rate limit
pub fn http_handler(base_url: String) -> Arc<HttpConnectionHandler> {
    let config = HttpHandlerConfig {
        base_url,
        request_timeout: Duration::from_secs(5),
        rate_limit: RateLimitConfig::fixed(Duration::from_millis(10)),
        ..HttpHandlerConfig::default()
    };
    Arc::new(HttpConnectionHandler::new(config).expect("handler should build"))
}
