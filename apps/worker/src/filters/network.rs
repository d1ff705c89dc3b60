use std::collections::HashSet;
use std::sync::Arc;

use futures_util::stream::{self, BoxStream, StreamExt};
use tokio_stream::wrappers::WatchStream;

use super::AcquisitionFilter;
use crate::monitors::ConnectivityMonitor;
use crate::registry::{Dependency, JobCategory, JobTypeRegistry};

/// Holds back network-dependent work while no monitor reports a connection
pub struct NetworkFilter {
    monitors: Vec<Arc<dyn ConnectivityMonitor>>,
    categories: HashSet<JobCategory>,
}

impl NetworkFilter {
    pub fn new(monitors: Vec<Arc<dyn ConnectivityMonitor>>, registry: &JobTypeRegistry) -> Self {
        Self {
            monitors,
            categories: registry.categories_requiring(Dependency::Network),
        }
    }

    pub fn monitors(&self) -> &[Arc<dyn ConnectivityMonitor>] {
        &self.monitors
    }

    pub fn is_connected(&self) -> bool {
        self.monitors.iter().any(|monitor| monitor.has_connected())
    }
}

impl AcquisitionFilter for NetworkFilter {
    fn name(&self) -> &str {
        "network"
    }

    fn types_to_exclude(&self) -> HashSet<JobCategory> {
        if self.is_connected() {
            HashSet::new()
        } else {
            self.categories.clone()
        }
    }

    fn state_changed(&self) -> BoxStream<'static, ()> {
        stream::select_all(
            self.monitors
                .iter()
                .map(|monitor| WatchStream::from_changes(monitor.subscribe())),
        )
        .map(|_| ())
        .boxed()
    }
}
