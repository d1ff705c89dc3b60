//! Durable backlog of scheduled jobs
//!
//! The scheduler treats a [`JobStore`] as the only source of truth for the
//! backlog and never caches records across ticks. Implementations guarantee
//! two things the scheduler relies on:
//! - at most one Waiting/Running job per [`JobKey`]; enqueuing an existing
//!   identity updates it in place
//! - [`JobStore::claim`] is atomic, so a Waiting job is claimed at most once

mod memory;
mod postgres;

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::JobError;
use crate::registry::{JobCategory, Priority};

/// Job store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database query failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// No job with this id
    #[error("job {0} not found")]
    NotFound(Uuid),

    /// A stored row could not be interpreted
    #[error("corrupt job record: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Identity of a job: two enqueues with the same key describe the same work
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub category: JobCategory,
    pub dedup_key: String,
}

impl JobKey {
    pub fn new(category: impl Into<JobCategory>, dedup_key: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            dedup_key: dedup_key.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.category, self.dedup_key)
    }
}

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Waiting and Running jobs own their identity key
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Waiting | Self::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(StoreError::Corrupt(format!("unknown job state '{}'", other))),
        }
    }
}

/// One job as stored in the backlog
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: Uuid,
    pub key: JobKey,
    pub priority: Priority,
    pub payload: serde_json::Value,
    pub state: JobState,
    /// Failed attempts so far
    pub attempts: u32,
    /// Earliest time the job may be dispatched
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl JobRecord {
    pub fn category(&self) -> &JobCategory {
        &self.key.category
    }

    /// Deserialize the payload; a malformed payload is a fatal job error
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            JobError::Fatal(format!("invalid payload for {}: {}", self.key, e))
        })
    }
}

/// Fully resolved enqueue, as handed to the store
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub key: JobKey,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub run_at: DateTime<Utc>,
}

/// Whether an enqueue created a job or updated the live one with its key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Created(Uuid),
    Updated(Uuid),
}

impl EnqueueOutcome {
    pub fn id(&self) -> Uuid {
        match self {
            Self::Created(id) | Self::Updated(id) => *id,
        }
    }
}

/// Backlog storage consumed by the scheduler
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a Waiting job, or update payload, priority and trigger time of
    /// the Waiting/Running job that already has this key
    async fn upsert(&self, request: EnqueueRequest) -> StoreResult<EnqueueOutcome>;

    /// Waiting jobs with `run_at <= now`, highest priority first, then
    /// oldest first. Categories in `exclude` may be skipped by the store.
    async fn due_jobs(
        &self,
        now: DateTime<Utc>,
        exclude: &HashSet<JobCategory>,
        limit: usize,
    ) -> StoreResult<Vec<JobRecord>>;

    /// Atomically move a Waiting job to Running; `false` if it was not Waiting
    async fn claim(&self, id: Uuid) -> StoreResult<bool>;

    /// Return a Running job to Waiting
    async fn requeue(
        &self,
        id: Uuid,
        run_at: DateTime<Utc>,
        attempts: u32,
        last_error: Option<&str>,
    ) -> StoreResult<()>;

    async fn mark_completed(&self, id: Uuid) -> StoreResult<()>;

    async fn mark_failed(&self, id: Uuid, attempts: u32, reason: &str) -> StoreResult<()>;

    /// Cancel the Waiting job with this key; Running jobs are not touched
    async fn cancel(&self, key: &JobKey) -> StoreResult<bool>;

    async fn get(&self, id: Uuid) -> StoreResult<Option<JobRecord>>;

    /// The Waiting or Running job with this key
    async fn find_active(&self, key: &JobKey) -> StoreResult<Option<JobRecord>>;

    /// Reset jobs left Running by a previous process; returns how many
    async fn recover_running(&self) -> StoreResult<u64>;

    async fn count(&self, state: JobState) -> StoreResult<u64>;
}
