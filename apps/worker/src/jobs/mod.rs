//! AniDB jobs
//!
//! - `anidb_get_file`: identify a local file by size and ed2k hash (UDP)
//! - `anidb_add_to_mylist`: add an identified file to the user's MyList (UDP)
//! - `anidb_get_anime`: fetch anime details (HTTP)
//!
//! Every AniDB job needs storage and network. Jobs on the same protocol share
//! a concurrency group with a cap of 1, matching the one-request-in-flight
//! nature of the AniDB API.

mod add_to_mylist;
mod get_anime;
mod get_file;

pub use add_to_mylist::{AddToMyListJob, AddToMyListPayload, ADD_TO_MYLIST};
pub use get_anime::{GetAnimeJob, GetAnimePayload, GET_ANIME};
pub use get_file::{GetFileJob, GetFilePayload, GET_FILE};

use std::sync::Arc;

use tsundoku_anidb_client::{HttpConnectionHandler, UdpConnectionHandler};

use crate::error::WorkerResult;
use crate::registry::{ConcurrencyGroup, Dependency, JobTypeInfo, JobTypeRegistry};
use crate::sink::MetadataSink;

/// Concurrency group of jobs that talk to the UDP API
pub const UDP_GROUP: &str = "anidb_udp";

/// Concurrency group of jobs that talk to the HTTP API
pub const HTTP_GROUP: &str = "anidb_http";

fn udp_job(category: &str) -> JobTypeInfo {
    JobTypeInfo::new(category)
        .requires(Dependency::Storage)
        .requires(Dependency::Network)
        .requires(Dependency::SessionProtocol)
        .in_group(ConcurrencyGroup::new(UDP_GROUP, 1))
}

fn http_job(category: &str) -> JobTypeInfo {
    JobTypeInfo::new(category)
        .requires(Dependency::Storage)
        .requires(Dependency::Network)
        .requires(Dependency::StatelessProtocol)
        .in_group(ConcurrencyGroup::new(HTTP_GROUP, 1))
}

/// Register every AniDB job
pub fn register_anidb_jobs(
    registry: &mut JobTypeRegistry,
    udp: Arc<UdpConnectionHandler>,
    http: Arc<HttpConnectionHandler>,
    sink: Arc<dyn MetadataSink>,
) -> WorkerResult<()> {
    registry.register(Arc::new(GetFileJob::new(Arc::clone(&udp), Arc::clone(&sink))))?;
    registry.register(Arc::new(AddToMyListJob::new(udp, Arc::clone(&sink))))?;
    registry.register(Arc::new(GetAnimeJob::new(http, sink)))?;
    Ok(())
}
