use std::collections::HashSet;
use std::sync::Arc;

use futures_util::stream::{BoxStream, StreamExt};
use tokio_stream::wrappers::BroadcastStream;
use tsundoku_anidb_client::{ConnectionHandler, PauseReason};

use super::AcquisitionFilter;
use crate::registry::{Dependency, JobCategory, JobTypeRegistry};

/// Holds back one AniDB protocol's work while its handler is paused
///
/// The session filter pauses on bans, server backoff and invalid sessions;
/// the stateless handler only ever reports bans.
pub struct AniDbFilter {
    name: &'static str,
    handler: Arc<dyn ConnectionHandler>,
    categories: HashSet<JobCategory>,
}

impl AniDbFilter {
    /// Filter for categories that need the UDP session
    pub fn session(handler: Arc<dyn ConnectionHandler>, registry: &JobTypeRegistry) -> Self {
        Self {
            name: "anidb_udp",
            handler,
            categories: registry.categories_requiring(Dependency::SessionProtocol),
        }
    }

    /// Filter for categories that need the HTTP API
    pub fn stateless(handler: Arc<dyn ConnectionHandler>, registry: &JobTypeRegistry) -> Self {
        Self {
            name: "anidb_http",
            handler,
            categories: registry.categories_requiring(Dependency::StatelessProtocol),
        }
    }

    pub fn pause_reason(&self) -> Option<PauseReason> {
        self.handler.pause_reason()
    }
}

impl AcquisitionFilter for AniDbFilter {
    fn name(&self) -> &str {
        self.name
    }

    fn types_to_exclude(&self) -> HashSet<JobCategory> {
        match self.handler.pause_reason() {
            Some(_) => self.categories.clone(),
            None => HashSet::new(),
        }
    }

    fn state_changed(&self) -> BoxStream<'static, ()> {
        // A lagged receiver still means something changed
        BroadcastStream::new(self.handler.subscribe())
            .map(|_| ())
            .boxed()
    }
}
