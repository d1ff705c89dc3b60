//! In-process job store
//!
//! Used by tests and by deployments without a database. The whole backlog
//! lives behind one mutex, which makes every operation (including claim)
//! trivially atomic.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    EnqueueOutcome, EnqueueRequest, JobKey, JobRecord, JobState, JobStore, StoreError,
    StoreResult,
};
use crate::registry::JobCategory;

struct Entry {
    record: JobRecord,
    /// Insertion order, breaks ties between equal `created_at` values
    seq: u64,
}

#[derive(Default)]
struct Backlog {
    jobs: HashMap<Uuid, Entry>,
    active: HashMap<JobKey, Uuid>,
    next_seq: u64,
}

impl Backlog {
    fn running(&mut self, id: Uuid) -> StoreResult<&mut JobRecord> {
        match self.jobs.get_mut(&id) {
            Some(entry) if entry.record.state == JobState::Running => Ok(&mut entry.record),
            Some(entry) => Err(StoreError::Corrupt(format!(
                "job {} is {}, expected running",
                id, entry.record.state
            ))),
            None => Err(StoreError::NotFound(id)),
        }
    }

    fn finish(&mut self, id: Uuid, state: JobState) -> StoreResult<()> {
        let record = self.running(id)?;
        record.state = state;
        record.updated_at = Utc::now();
        let key = record.key.clone();
        if self.active.get(&key) == Some(&id) {
            self.active.remove(&key);
        }
        Ok(())
    }
}

/// [`JobStore`] held in memory
#[derive(Default)]
pub struct MemoryJobStore {
    backlog: Mutex<Backlog>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Backlog> {
        self.backlog.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every job ever stored, in insertion order
    pub fn snapshot(&self) -> Vec<JobRecord> {
        let backlog = self.lock();
        let mut entries: Vec<_> = backlog.jobs.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(|entry| entry.record.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().jobs.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn upsert(&self, request: EnqueueRequest) -> StoreResult<EnqueueOutcome> {
        let mut backlog = self.lock();
        let now = Utc::now();

        if let Some(&id) = backlog.active.get(&request.key) {
            if let Some(entry) = backlog.jobs.get_mut(&id) {
                let record = &mut entry.record;
                record.payload = request.payload;
                record.priority = request.priority;
                record.run_at = request.run_at;
                record.updated_at = now;
                return Ok(EnqueueOutcome::Updated(id));
            }
        }

        let id = Uuid::new_v4();
        let seq = backlog.next_seq;
        backlog.next_seq += 1;
        backlog.active.insert(request.key.clone(), id);
        backlog.jobs.insert(
            id,
            Entry {
                record: JobRecord {
                    id,
                    key: request.key,
                    priority: request.priority,
                    payload: request.payload,
                    state: JobState::Waiting,
                    attempts: 0,
                    run_at: request.run_at,
                    created_at: now,
                    updated_at: now,
                    last_error: None,
                },
                seq,
            },
        );
        Ok(EnqueueOutcome::Created(id))
    }

    async fn due_jobs(
        &self,
        now: DateTime<Utc>,
        exclude: &HashSet<JobCategory>,
        limit: usize,
    ) -> StoreResult<Vec<JobRecord>> {
        let backlog = self.lock();
        let mut due: Vec<&Entry> = backlog
            .jobs
            .values()
            .filter(|entry| {
                entry.record.state == JobState::Waiting
                    && entry.record.run_at <= now
                    && !exclude.contains(entry.record.category())
            })
            .collect();
        due.sort_by(|a, b| {
            b.record
                .priority
                .cmp(&a.record.priority)
                .then(a.record.created_at.cmp(&b.record.created_at))
                .then(a.seq.cmp(&b.seq))
        });
        Ok(due
            .into_iter()
            .take(limit)
            .map(|entry| entry.record.clone())
            .collect())
    }

    async fn claim(&self, id: Uuid) -> StoreResult<bool> {
        let mut backlog = self.lock();
        match backlog.jobs.get_mut(&id) {
            Some(entry) if entry.record.state == JobState::Waiting => {
                entry.record.state = JobState::Running;
                entry.record.updated_at = Utc::now();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn requeue(
        &self,
        id: Uuid,
        run_at: DateTime<Utc>,
        attempts: u32,
        last_error: Option<&str>,
    ) -> StoreResult<()> {
        let mut backlog = self.lock();
        let record = backlog.running(id)?;
        record.state = JobState::Waiting;
        record.run_at = run_at;
        record.attempts = attempts;
        if let Some(reason) = last_error {
            record.last_error = Some(reason.to_string());
        }
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_completed(&self, id: Uuid) -> StoreResult<()> {
        self.lock().finish(id, JobState::Completed)
    }

    async fn mark_failed(&self, id: Uuid, attempts: u32, reason: &str) -> StoreResult<()> {
        let mut backlog = self.lock();
        {
            let record = backlog.running(id)?;
            record.attempts = attempts;
            record.last_error = Some(reason.to_string());
        }
        backlog.finish(id, JobState::Failed)
    }

    async fn cancel(&self, key: &JobKey) -> StoreResult<bool> {
        let mut backlog = self.lock();
        let Some(&id) = backlog.active.get(key) else {
            return Ok(false);
        };
        let Some(entry) = backlog.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if entry.record.state != JobState::Waiting {
            return Ok(false);
        }
        entry.record.state = JobState::Cancelled;
        entry.record.updated_at = Utc::now();
        backlog.active.remove(key);
        Ok(true)
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<JobRecord>> {
        Ok(self.lock().jobs.get(&id).map(|entry| entry.record.clone()))
    }

    async fn find_active(&self, key: &JobKey) -> StoreResult<Option<JobRecord>> {
        let backlog = self.lock();
        Ok(backlog
            .active
            .get(key)
            .and_then(|id| backlog.jobs.get(id))
            .map(|entry| entry.record.clone()))
    }

    async fn recover_running(&self) -> StoreResult<u64> {
        let mut backlog = self.lock();
        let now = Utc::now();
        let mut recovered = 0;
        for entry in backlog.jobs.values_mut() {
            if entry.record.state == JobState::Running {
                entry.record.state = JobState::Waiting;
                entry.record.updated_at = now;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn count(&self, state: JobState) -> StoreResult<u64> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|entry| entry.record.state == state)
            .count() as u64)
    }
}
