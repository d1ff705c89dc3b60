//! Scheduler / dispatcher
//!
//! Turns the backlog of due jobs into running work. Every tick:
//! 1. unions the exclusions of all acquisition filters
//! 2. adds categories whose per-category or concurrency-group cap is reached
//! 3. asks the store for due Waiting jobs (priority, then age)
//! 4. claims and starts admissible jobs while worker permits remain
//!
//! Ticks run one at a time, on a timer, whenever a filter reports a change,
//! and whenever a job is enqueued or finishes. Job execution happens on
//! spawned tasks; the tick never waits on it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use futures_util::FutureExt;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::Config;
use crate::error::{JobError, WorkerError, WorkerResult};
use crate::filters::AcquisitionFilter;
use crate::job::{JobContext, JobEnqueuer, JobHandler, NewJob};
use crate::registry::{JobCategory, JobTypeInfo, JobTypeRegistry};
use crate::store::{EnqueueOutcome, JobKey, JobRecord, JobStore, StoreResult};

/// Per-filter view of the categories currently held back
pub type PausedCategories = BTreeMap<String, BTreeSet<JobCategory>>;

/// Scheduler tunables
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Tick interval when nothing else wakes the scheduler
    pub poll_interval: Duration,
    /// Worker pool size
    pub max_concurrent_jobs: usize,
    /// Executions before a retryable failure becomes permanent
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Due jobs fetched per tick
    pub batch_size: usize,
}

impl SchedulerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            max_concurrent_jobs: config.max_concurrent_jobs,
            max_attempts: config.max_retries,
            retry_base_delay: config.retry_delay(),
            retry_max_delay: config.retry_max_delay(),
            ..Self::default()
        }
    }

    /// Delay before the next attempt after `failed_attempts` failures:
    /// `base * 2^(failed_attempts - 1)`, capped at `retry_max_delay`
    pub fn retry_delay(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(16);
        self.retry_base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.retry_max_delay)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_concurrent_jobs: 4,
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(60),
            retry_max_delay: Duration::from_secs(3600),
            batch_size: 64,
        }
    }
}

/// What one tick did
#[derive(Debug, Default, Clone)]
pub struct TickReport {
    /// Jobs handed to workers, in dispatch order
    pub dispatched: Vec<JobKey>,
    /// Union of filter exclusions at the time of the tick
    pub excluded: HashSet<JobCategory>,
}

#[derive(Default)]
struct Occupancy {
    by_category: HashMap<JobCategory, usize>,
    by_group: HashMap<String, usize>,
}

impl Occupancy {
    fn category(&self, category: &JobCategory) -> usize {
        self.by_category.get(category).copied().unwrap_or(0)
    }

    fn group(&self, group: &str) -> usize {
        self.by_group.get(group).copied().unwrap_or(0)
    }

    fn has_room(&self, info: &JobTypeInfo) -> bool {
        let category_ok = info
            .max_concurrent
            .map_or(true, |cap| self.category(&info.category) < cap);
        let group_ok = info
            .group
            .as_ref()
            .map_or(true, |group| self.group(&group.name) < group.cap);
        category_ok && group_ok
    }
}

struct Inner {
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
    registry: Arc<JobTypeRegistry>,
    filters: Vec<Arc<dyn AcquisitionFilter>>,
    enqueuer: JobEnqueuer,
    workers: Arc<Semaphore>,
    occupancy: Mutex<Occupancy>,
    wake: Arc<Notify>,
    job_finished: Notify,
    tick_lock: tokio::sync::Mutex<()>,
    paused: Mutex<PausedCategories>,
    shutdown: CancellationToken,
}

impl Inner {
    fn occupancy(&self) -> MutexGuard<'_, Occupancy> {
        self.occupancy.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Holds a job's worker permit and occupancy slots until the job finishes
struct RunningGuard {
    inner: Arc<Inner>,
    category: JobCategory,
    group: Option<String>,
    permit: Option<OwnedSemaphorePermit>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        drop(self.permit.take());
        {
            let mut occupancy = self.inner.occupancy();
            if let Some(count) = occupancy.by_category.get_mut(&self.category) {
                *count = count.saturating_sub(1);
            }
            if let Some(group) = &self.group {
                if let Some(count) = occupancy.by_group.get_mut(group) {
                    *count = count.saturating_sub(1);
                }
            }
        }
        self.inner.job_finished.notify_waiters();
        self.inner.wake.notify_one();
    }
}

/// Dispatches due jobs to a fixed-size worker pool
///
/// Cheap to clone; clones share the same pool and backlog.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// `shutdown` stops the run loop and is propagated to running jobs
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        registry: Arc<JobTypeRegistry>,
        filters: Vec<Arc<dyn AcquisitionFilter>>,
        shutdown: CancellationToken,
    ) -> Self {
        let wake = Arc::new(Notify::new());
        let enqueuer = JobEnqueuer::new(Arc::clone(&store), Arc::clone(&registry), Arc::clone(&wake));
        let workers = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));

        Self {
            inner: Arc::new(Inner {
                config,
                store,
                registry,
                filters,
                enqueuer,
                workers,
                occupancy: Mutex::new(Occupancy::default()),
                wake,
                job_finished: Notify::new(),
                tick_lock: tokio::sync::Mutex::new(()),
                paused: Mutex::new(PausedCategories::new()),
                shutdown,
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &JobTypeRegistry {
        &self.inner.registry
    }

    /// Handle for enqueuing from outside the scheduler
    pub fn enqueuer(&self) -> JobEnqueuer {
        self.inner.enqueuer.clone()
    }

    /// Add a job, or update the Waiting/Running job with the same identity
    pub async fn enqueue(&self, job: NewJob) -> WorkerResult<EnqueueOutcome> {
        self.inner.enqueuer.enqueue(job).await
    }

    /// Cancel a Waiting job; running jobs are never pre-empted
    pub async fn cancel(&self, key: &JobKey) -> StoreResult<bool> {
        let cancelled = self.inner.store.cancel(key).await?;
        if cancelled {
            info!(%key, "Job cancelled");
        }
        Ok(cancelled)
    }

    /// Per filter, the categories it currently excludes (empty sets omitted)
    pub fn paused_categories(&self) -> PausedCategories {
        self.inner
            .filters
            .iter()
            .filter_map(|filter| {
                let excluded = filter.types_to_exclude();
                if excluded.is_empty() {
                    None
                } else {
                    Some((filter.name().to_string(), excluded.into_iter().collect()))
                }
            })
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.inner.occupancy().by_category.values().sum()
    }

    pub fn running_in_category(&self, category: &JobCategory) -> usize {
        self.inner.occupancy().category(category)
    }

    pub fn running_in_group(&self, group: &str) -> usize {
        self.inner.occupancy().group(group)
    }

    /// Resolves once no job is running
    pub async fn wait_idle(&self) {
        loop {
            let finished = self.inner.job_finished.notified();
            if self.running_count() == 0 {
                return;
            }
            finished.await;
        }
    }

    /// Run one scheduling pass
    ///
    /// # Errors
    /// Returns the store error that aborted the pass; jobs dispatched before
    /// it keep running
    pub async fn tick(&self) -> StoreResult<TickReport> {
        let inner = &self.inner;
        let _tick = inner.tick_lock.lock().await;
        let mut report = TickReport::default();
        if inner.shutdown.is_cancelled() {
            return Ok(report);
        }

        let paused = self.paused_categories();
        self.log_pause_changes(&paused);
        report.excluded = paused.into_values().flatten().collect();

        if inner.workers.available_permits() == 0 {
            return Ok(report);
        }

        let mut blocked = report.excluded.clone();
        blocked.extend(self.saturated_categories());

        let due = inner
            .store
            .due_jobs(Utc::now(), &blocked, inner.config.batch_size)
            .await?;

        for job in due {
            let category = job.category().clone();
            if blocked.contains(&category) {
                continue;
            }

            let Some(entry) = inner.registry.entry(&category) else {
                self.fail_unknown(&job).await?;
                continue;
            };
            let info = &entry.info;
            let handler = Arc::clone(&entry.handler);

            let Some(guard) = self.reserve(info) else {
                blocked.insert(category);
                continue;
            };
            let Ok(permit) = Arc::clone(&inner.workers).try_acquire_owned() else {
                break;
            };
            if !inner.store.claim(job.id).await? {
                debug!(key = %job.key, "Job already claimed");
                continue;
            }

            report.dispatched.push(job.key.clone());
            self.spawn(job, handler, guard.with_permit(permit));
        }

        Ok(report)
    }

    /// Tick until `shutdown` fires, then wait for running jobs to finish
    pub async fn run(&self) {
        let inner = &self.inner;
        let mut ticker = tokio::time::interval(inner.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut filter_changes =
            stream::select_all(inner.filters.iter().map(|filter| filter.state_changed()));

        info!(
            workers = inner.config.max_concurrent_jobs,
            job_types = inner.registry.len(),
            filters = inner.filters.len(),
            "Scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                _ = inner.shutdown.cancelled() => break,
                _ = inner.wake.notified() => {}
                Some(()) = filter_changes.next() => {
                    debug!("Acquisition filter state changed");
                }
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.tick().await {
                WorkerError::Store(e).log();
            }
        }

        let running = self.running_count();
        if running > 0 {
            info!(running, "Waiting for running jobs to finish");
        }
        self.wait_idle().await;
        info!("Scheduler stopped");
    }

    fn log_pause_changes(&self, paused: &PausedCategories) {
        let mut last = self.inner.paused.lock().unwrap_or_else(|e| e.into_inner());
        if *last == *paused {
            return;
        }

        for (filter, categories) in paused {
            if last.get(filter) != Some(categories) {
                let categories: Vec<&str> = categories.iter().map(JobCategory::as_str).collect();
                info!(filter = %filter, categories = ?categories, "Job categories paused");
            }
        }
        for filter in last.keys().filter(|filter| !paused.contains_key(*filter)) {
            info!(filter = %filter, "Job categories resumed");
        }
        *last = paused.clone();
    }

    /// Categories that cannot start another job right now
    fn saturated_categories(&self) -> HashSet<JobCategory> {
        let occupancy = self.inner.occupancy();
        self.inner
            .registry
            .categories()
            .into_iter()
            .filter(|category| {
                self.inner
                    .registry
                    .get(category)
                    .is_some_and(|info| !occupancy.has_room(info))
            })
            .collect()
    }

    fn reserve(&self, info: &JobTypeInfo) -> Option<RunningGuard> {
        let mut occupancy = self.inner.occupancy();
        if !occupancy.has_room(info) {
            return None;
        }
        *occupancy
            .by_category
            .entry(info.category.clone())
            .or_default() += 1;
        if let Some(group) = &info.group {
            *occupancy.by_group.entry(group.name.clone()).or_default() += 1;
        }

        Some(RunningGuard {
            inner: Arc::clone(&self.inner),
            category: info.category.clone(),
            group: info.group.as_ref().map(|group| group.name.clone()),
            permit: None,
        })
    }

    async fn fail_unknown(&self, job: &JobRecord) -> StoreResult<()> {
        error!(key = %job.key, "Job has no registered handler");
        if self.inner.store.claim(job.id).await? {
            self.inner
                .store
                .mark_failed(job.id, job.attempts, "unknown job type")
                .await?;
        }
        Ok(())
    }

    fn spawn(&self, job: JobRecord, handler: Arc<dyn JobHandler>, guard: RunningGuard) {
        let inner = Arc::clone(&self.inner);
        let span = info_span!(
            "job",
            id = %job.id,
            category = %job.key.category,
            key = %job.key.dedup_key,
            attempt = job.attempts + 1,
        );

        tokio::spawn(
            async move {
                let _guard = guard;
                let ctx = JobContext::new(&job, inner.shutdown.child_token(), inner.enqueuer.clone());
                debug!("Job started");

                let started = Instant::now();
                let result = AssertUnwindSafe(handler.execute(&job, &ctx))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(JobError::fatal("job panicked")));

                if let Err(e) = finish(&inner, &job, result, started.elapsed()).await {
                    error!(error = %e, "Failed to record job outcome");
                }
            }
            .instrument(span),
        );
    }
}

impl RunningGuard {
    fn with_permit(mut self, permit: OwnedSemaphorePermit) -> Self {
        self.permit = Some(permit);
        self
    }
}

async fn finish(
    inner: &Inner,
    job: &JobRecord,
    result: Result<(), JobError>,
    elapsed: Duration,
) -> StoreResult<()> {
    let elapsed_ms = elapsed.as_millis() as u64;
    let store = &inner.store;

    match result {
        Ok(()) => {
            store.mark_completed(job.id).await?;
            info!(elapsed_ms, "Job completed");
        }
        Err(JobError::Cancelled) => {
            store.requeue(job.id, Utc::now(), job.attempts, None).await?;
            info!(elapsed_ms, "Job cancelled, returned to backlog");
        }
        Err(JobError::Paused(reason)) => {
            store
                .requeue(job.id, Utc::now(), job.attempts, Some(&reason))
                .await?;
            warn!(elapsed_ms, error = %reason, "Job paused by its service, returned to backlog");
        }
        Err(JobError::Retryable(reason)) => {
            let attempts = job.attempts + 1;
            if attempts >= inner.config.max_attempts {
                store.mark_failed(job.id, attempts, &reason).await?;
                error!(attempts, error = %reason, "Job failed after final attempt");
            } else {
                let delay = inner.config.retry_delay(attempts);
                let run_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1));
                store.requeue(job.id, run_at, attempts, Some(&reason)).await?;
                warn!(
                    attempts,
                    retry_in_secs = delay.as_secs(),
                    error = %reason,
                    "Job failed, will retry"
                );
            }
        }
        Err(JobError::Fatal(reason)) => {
            store.mark_failed(job.id, job.attempts + 1, &reason).await?;
            error!(error = %reason, "Job failed permanently");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let config = SchedulerConfig {
            retry_base_delay: Duration::from_secs(60),
            retry_max_delay: Duration::from_secs(300),
            ..SchedulerConfig::default()
        };

        assert_eq!(config.retry_delay(1), Duration::from_secs(60));
        assert_eq!(config.retry_delay(2), Duration::from_secs(120));
        assert_eq!(config.retry_delay(3), Duration::from_secs(240));
        assert_eq!(config.retry_delay(4), Duration::from_secs(300));
        assert_eq!(config.retry_delay(40), Duration::from_secs(300));
    }

    #[test]
    fn test_occupancy_checks_both_caps() {
        use crate::registry::ConcurrencyGroup;

        let info = JobTypeInfo::new("lookup")
            .in_group(ConcurrencyGroup::new("anidb_udp", 1))
            .max_concurrent(2);
        let mut occupancy = Occupancy::default();
        assert!(occupancy.has_room(&info));

        occupancy.by_group.insert("anidb_udp".to_string(), 1);
        assert!(!occupancy.has_room(&info));

        occupancy.by_group.clear();
        occupancy.by_category.insert(JobCategory::new("lookup"), 2);
        assert!(!occupancy.has_room(&info));
    }
}
