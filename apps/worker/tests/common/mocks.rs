//! Fakes for worker integration tests
//!
//! Locks are acquired with `unwrap_or_else(|e| e.into_inner())` so a failing
//! assertion in one job task does not poison the fake for the rest of a test.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use tokio::sync::{watch, Semaphore};
use tokio_stream::wrappers::WatchStream;
use tsundoku_worker::{
    AcquisitionFilter, AniDbAnime, AniDbFile, ConnectivityMonitor, JobCategory, JobContext,
    JobError, JobHandler, JobRecord, JobTypeInfo, MetadataSink, MyListEntry, NewJob,
    WorkerError, WorkerResult,
};

// =============================================================================
// Connectivity
// =============================================================================

/// Connectivity monitor flipped by the test
pub struct ManualConnectivityMonitor {
    name: String,
    connected: watch::Sender<bool>,
}

impl ManualConnectivityMonitor {
    pub fn new(name: &str, connected: bool) -> Arc<Self> {
        let (tx, _) = watch::channel(connected);
        Arc::new(Self {
            name: name.to_string(),
            connected: tx,
        })
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.send_replace(connected);
    }
}

impl ConnectivityMonitor for ManualConnectivityMonitor {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_connected(&self) -> bool {
        *self.connected.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }
}

// =============================================================================
// Filters
// =============================================================================

/// Filter whose exclusion set is set by the test
pub struct ManualFilter {
    name: &'static str,
    excluded: watch::Sender<HashSet<JobCategory>>,
}

impl ManualFilter {
    pub fn new(name: &'static str) -> Arc<Self> {
        let (tx, _) = watch::channel(HashSet::new());
        Arc::new(Self { name, excluded: tx })
    }

    pub fn exclude(&self, categories: &[&str]) {
        self.excluded
            .send_replace(categories.iter().map(|c| JobCategory::new(*c)).collect());
    }

    pub fn clear(&self) {
        self.excluded.send_replace(HashSet::new());
    }
}

impl AcquisitionFilter for ManualFilter {
    fn name(&self) -> &str {
        self.name
    }

    fn types_to_exclude(&self) -> HashSet<JobCategory> {
        self.excluded.borrow().clone()
    }

    fn state_changed(&self) -> BoxStream<'static, ()> {
        WatchStream::from_changes(self.excluded.subscribe())
            .map(|_| ())
            .boxed()
    }
}

// =============================================================================
// Job handlers
// =============================================================================

/// What a [`ScriptedJob`] execution does
#[derive(Debug, Clone)]
pub enum Outcome {
    Succeed,
    Retry(&'static str),
    Fail(&'static str),
    Panic,
}

/// One observed execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub category: String,
    pub dedup_key: String,
    pub attempt: u32,
}

/// Job handler that plays back scripted outcomes
///
/// With [`ScriptedJob::gated`] every execution waits for a permit from the
/// gate (or for cancellation) before finishing, which keeps jobs running
/// while a test inspects the scheduler.
pub struct ScriptedJob {
    info: JobTypeInfo,
    outcomes: Mutex<VecDeque<Outcome>>,
    executions: Mutex<Vec<Execution>>,
    gate: Option<Arc<Semaphore>>,
    follow_up: Option<&'static str>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl ScriptedJob {
    pub fn new(info: JobTypeInfo) -> Arc<Self> {
        Arc::new(Self::build(info, None, None))
    }

    /// Executions block until the returned gate hands out a permit
    pub fn gated(info: JobTypeInfo) -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        (Arc::new(Self::build(info, Some(gate.clone()), None)), gate)
    }

    /// On success, enqueue a `category` job with the same dedup key
    pub fn with_follow_up(info: JobTypeInfo, category: &'static str) -> Arc<Self> {
        Arc::new(Self::build(info, None, Some(category)))
    }

    fn build(info: JobTypeInfo, gate: Option<Arc<Semaphore>>, follow_up: Option<&'static str>) -> Self {
        Self {
            info,
            outcomes: Mutex::new(VecDeque::new()),
            executions: Mutex::new(Vec::new()),
            gate,
            follow_up,
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }

    /// Outcomes for the next executions, in order; afterwards jobs succeed
    pub fn script(&self, outcomes: impl IntoIterator<Item = Outcome>) {
        self.outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(outcomes);
    }

    pub fn executions(&self) -> Vec<Execution> {
        self.executions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn execution_count(&self) -> usize {
        self.executions().len()
    }

    /// Highest number of simultaneous executions observed
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for ScriptedJob {
    fn job_type(&self) -> JobTypeInfo {
        self.info.clone()
    }

    async fn execute(&self, job: &JobRecord, ctx: &JobContext) -> Result<(), JobError> {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
        self.executions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Execution {
                category: job.key.category.to_string(),
                dedup_key: job.key.dedup_key.clone(),
                attempt: ctx.attempt(),
            });

        let result = self.run(job, ctx).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl ScriptedJob {
    async fn run(&self, job: &JobRecord, ctx: &JobContext) -> Result<(), JobError> {
        if let Some(gate) = &self.gate {
            tokio::select! {
                _ = ctx.cancellation().cancelled() => return Err(JobError::Cancelled),
                permit = gate.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                }
            }
        }

        let outcome = self
            .outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or(Outcome::Succeed);

        match outcome {
            Outcome::Succeed => {
                if let Some(category) = self.follow_up {
                    ctx.enqueue(NewJob::new(category, job.key.dedup_key.clone()))
                        .await?;
                }
                Ok(())
            }
            Outcome::Retry(reason) => Err(JobError::retryable(reason)),
            Outcome::Fail(reason) => Err(JobError::fatal(reason)),
            Outcome::Panic => panic!("scripted panic"),
        }
    }
}

// =============================================================================
// Metadata sink
// =============================================================================

/// Everything a [`RecordingSink`] received
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkRecord {
    File(AniDbFile),
    Unknown { size: u64, ed2k: String },
    Anime(AniDbAnime),
    MyList(MyListEntry),
}

/// Metadata sink that records what it receives
#[derive(Default)]
pub struct RecordingSink {
    records: Mutex<Vec<SinkRecord>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<SinkRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn push(&self, record: SinkRecord) -> WorkerResult<()> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
        Ok(())
    }
}

#[async_trait]
impl MetadataSink for RecordingSink {
    async fn file_identified(&self, file: &AniDbFile) -> WorkerResult<()> {
        self.push(SinkRecord::File(file.clone()))
    }

    async fn file_unknown(&self, size: u64, ed2k: &str) -> WorkerResult<()> {
        self.push(SinkRecord::Unknown {
            size,
            ed2k: ed2k.to_string(),
        })
    }

    async fn anime_updated(&self, anime: &AniDbAnime) -> WorkerResult<()> {
        self.push(SinkRecord::Anime(anime.clone()))
    }

    async fn mylist_updated(&self, entry: &MyListEntry) -> WorkerResult<()> {
        self.push(SinkRecord::MyList(entry.clone()))
    }
}
