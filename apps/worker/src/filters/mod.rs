//! Acquisition filters: which job categories may not be dispatched right now
//!
//! Each filter watches exactly one external signal and answers from memory.
//! The scheduler takes the union of every filter's exclusions on each tick and
//! re-runs immediately when any filter's [`AcquisitionFilter::state_changed`]
//! stream yields.

mod anidb;
mod network;
mod storage;

pub use anidb::AniDbFilter;
pub use network::NetworkFilter;
pub use storage::StorageFilter;

use std::collections::HashSet;

use futures_util::stream::BoxStream;

use crate::registry::JobCategory;

/// Derives the set of categories that must not start right now
pub trait AcquisitionFilter: Send + Sync {
    /// Stable name used in logs and [`crate::Scheduler::paused_categories`]
    fn name(&self) -> &str;

    /// Categories to exclude; must not block or perform I/O
    fn types_to_exclude(&self) -> HashSet<JobCategory>;

    /// Yields whenever the underlying signal may have changed
    fn state_changed(&self) -> BoxStream<'static, ()>;
}
