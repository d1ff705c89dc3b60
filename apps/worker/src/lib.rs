//! tsundoku background job worker
//!
//! Schedules deferred work (AniDB lookups and MyList updates) against a
//! durable backlog while keeping the AniDB API happy:
//! - [`registry`]: job categories, their dependencies, concurrency groups and
//!   default priorities
//! - [`filters`]: which categories are paused right now (storage, network and
//!   AniDB ban/session state)
//! - [`scheduler`]: the dispatcher that starts admissible jobs by priority
//!   within their caps, and retries failures with exponential backoff
//! - [`store`]: the backlog, in memory or in PostgreSQL
//! - [`jobs`]: the concrete AniDB jobs
//!
//! # Environment Variables
//!
//! - `DATABASE_URL`: PostgreSQL connection string
//! - `WORKER_POLL_INTERVAL`: scheduler tick interval in seconds (default 5)
//! - `WORKER_MAX_CONCURRENT_JOBS`: worker pool size (default 4)
//! - `WORKER_MAX_RETRIES`: attempts before a job fails for good (default 3)
//! - `WORKER_RETRY_DELAY` / `WORKER_RETRY_MAX_DELAY`: retry backoff base and
//!   cap in seconds (defaults 60 and 3600)
//! - `WORKER_CONNECTIVITY_PROBES`: comma-separated `host:port` probe targets
//! - `WORKER_STORAGE_PROBE_INTERVAL`: seconds between database probes
//!   (default 30)

pub mod config;
pub mod error;
pub mod filters;
pub mod job;
pub mod jobs;
pub mod monitors;
pub mod registry;
pub mod scheduler;
pub mod sink;
pub mod store;

pub use config::Config;
pub use error::{ErrorSeverity, JobError, WorkerError, WorkerResult};
pub use filters::{AcquisitionFilter, AniDbFilter, NetworkFilter, StorageFilter};
pub use job::{JobContext, JobEnqueuer, JobHandler, NewJob};
pub use monitors::{ConnectivityMonitor, StorageMonitor, StorageStatus, TcpConnectivityMonitor};
pub use registry::{ConcurrencyGroup, Dependency, JobCategory, JobTypeInfo, JobTypeRegistry, Priority};
pub use scheduler::{PausedCategories, Scheduler, SchedulerConfig, TickReport};
pub use sink::{AniDbAnime, AniDbFile, MetadataSink, MyListEntry, TracingSink};
pub use store::{
    EnqueueOutcome, EnqueueRequest, JobKey, JobRecord, JobState, JobStore, MemoryJobStore,
    PgJobStore, StoreError,
};
