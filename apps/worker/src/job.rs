//! Job execution contract
//!
//! A [`JobHandler`] runs one category of work. Each execution receives the
//! stored [`JobRecord`] (payload included) and a [`JobContext`] carrying its
//! cancellation signal and a [`JobEnqueuer`] for follow-up work. Enqueuing
//! from inside a job goes straight to the store and never waits on the
//! scheduler's tick.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{JobError, WorkerError, WorkerResult};
use crate::registry::{JobCategory, JobTypeInfo, JobTypeRegistry, Priority};
use crate::store::{EnqueueOutcome, EnqueueRequest, JobKey, JobRecord, JobStore};

/// Executes one job category
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Static metadata registered for this category
    fn job_type(&self) -> JobTypeInfo;

    /// Run the job; long waits should observe `ctx.cancellation()`
    async fn execute(&self, job: &JobRecord, ctx: &JobContext) -> Result<(), JobError>;
}

/// A job to enqueue
#[derive(Debug, Clone)]
pub struct NewJob {
    pub category: JobCategory,
    pub dedup_key: String,
    pub payload: serde_json::Value,
    /// Defaults to the category's registered priority
    pub priority: Option<Priority>,
    /// Defaults to now
    pub run_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(category: impl Into<JobCategory>, dedup_key: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            dedup_key: dedup_key.into(),
            payload: serde_json::Value::Null,
            priority: None,
            run_at: None,
        }
    }

    /// Serialize `payload` as the job payload
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> WorkerResult<Self> {
        self.payload = serde_json::to_value(payload)?;
        Ok(self)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn key(&self) -> JobKey {
        JobKey::new(self.category.clone(), self.dedup_key.clone())
    }
}

/// Handle for adding work to the backlog
///
/// Cheap to clone; shared by the scheduler and every running job.
#[derive(Clone)]
pub struct JobEnqueuer {
    store: Arc<dyn JobStore>,
    registry: Arc<JobTypeRegistry>,
    wake: Arc<Notify>,
}

impl JobEnqueuer {
    pub(crate) fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<JobTypeRegistry>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            registry,
            wake,
        }
    }

    /// Add a job, or update the Waiting/Running job with the same identity
    ///
    /// # Errors
    /// Returns `WorkerError::UnknownJobType` for unregistered categories and
    /// `WorkerError::Store` if the store rejects the write
    pub async fn enqueue(&self, job: NewJob) -> WorkerResult<EnqueueOutcome> {
        let info = self
            .registry
            .get(&job.category)
            .ok_or_else(|| WorkerError::UnknownJobType(job.category.to_string()))?;

        let key = job.key();
        let request = EnqueueRequest {
            key: key.clone(),
            payload: job.payload,
            priority: job.priority.unwrap_or(info.default_priority),
            run_at: job.run_at.unwrap_or_else(Utc::now),
        };

        let outcome = self.store.upsert(request).await?;
        match outcome {
            EnqueueOutcome::Created(id) => tracing::debug!(%key, %id, "Job enqueued"),
            EnqueueOutcome::Updated(id) => tracing::debug!(%key, %id, "Existing job updated"),
        }
        self.wake.notify_one();
        Ok(outcome)
    }
}

/// Per-execution context handed to a [`JobHandler`]
#[derive(Clone)]
pub struct JobContext {
    id: Uuid,
    key: JobKey,
    attempt: u32,
    cancel: CancellationToken,
    enqueuer: JobEnqueuer,
}

impl JobContext {
    pub(crate) fn new(
        record: &JobRecord,
        cancel: CancellationToken,
        enqueuer: JobEnqueuer,
    ) -> Self {
        Self {
            id: record.id,
            key: record.key.clone(),
            attempt: record.attempts + 1,
            cancel,
            enqueuer,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &JobKey {
        &self.key
    }

    /// 1-based number of this execution
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Fires on worker shutdown
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Enqueue a follow-up job
    pub async fn enqueue(&self, job: NewJob) -> Result<EnqueueOutcome, JobError> {
        self.enqueuer.enqueue(job).await.map_err(JobError::from)
    }
}
