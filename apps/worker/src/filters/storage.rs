use std::collections::HashSet;
use std::sync::Arc;

use futures_util::stream::{BoxStream, StreamExt};
use tokio_stream::wrappers::WatchStream;

use super::AcquisitionFilter;
use crate::monitors::StorageMonitor;
use crate::registry::{Dependency, JobCategory, JobTypeRegistry};

/// Holds back storage-dependent work unless storage is online and unblocked
pub struct StorageFilter {
    monitor: Arc<StorageMonitor>,
    categories: HashSet<JobCategory>,
}

impl StorageFilter {
    pub fn new(monitor: Arc<StorageMonitor>, registry: &JobTypeRegistry) -> Self {
        Self {
            monitor,
            categories: registry.categories_requiring(Dependency::Storage),
        }
    }
}

impl AcquisitionFilter for StorageFilter {
    fn name(&self) -> &str {
        "storage"
    }

    fn types_to_exclude(&self) -> HashSet<JobCategory> {
        if self.monitor.status().is_available() {
            HashSet::new()
        } else {
            self.categories.clone()
        }
    }

    fn state_changed(&self) -> BoxStream<'static, ()> {
        WatchStream::from_changes(self.monitor.subscribe())
            .map(|_| ())
            .boxed()
    }
}
