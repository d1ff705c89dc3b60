use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tsundoku_anidb_client::HttpConnectionHandler;

use super::http_job;
use crate::error::{JobError, WorkerResult};
use crate::job::{JobContext, JobHandler, NewJob};
use crate::registry::{JobTypeInfo, Priority};
use crate::sink::{AniDbAnime, MetadataSink};
use crate::store::JobRecord;

pub const GET_ANIME: &str = "anidb_get_anime";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetAnimePayload {
    pub aid: u64,
}

/// Fetch anime details from the HTTP API
pub struct GetAnimeJob {
    http: Arc<HttpConnectionHandler>,
    sink: Arc<dyn MetadataSink>,
}

impl GetAnimeJob {
    pub fn new(http: Arc<HttpConnectionHandler>, sink: Arc<dyn MetadataSink>) -> Self {
        Self { http, sink }
    }

    pub fn job(aid: u64) -> WorkerResult<NewJob> {
        NewJob::new(GET_ANIME, aid.to_string()).with_payload(&GetAnimePayload { aid })
    }
}

/// Text of the `<title type="main">` element
fn main_title(xml: &str) -> Option<String> {
    let start = xml.find(r#"type="main""#)?;
    let rest = &xml[start..];
    let open_end = rest.find('>')?;
    let rest = &rest[open_end + 1..];
    let close = rest.find("</title>")?;
    let title = rest[..close].trim();
    (!title.is_empty()).then(|| title.to_string())
}

#[async_trait]
impl JobHandler for GetAnimeJob {
    fn job_type(&self) -> JobTypeInfo {
        http_job(GET_ANIME).priority(Priority::NORMAL)
    }

    async fn execute(&self, job: &JobRecord, ctx: &JobContext) -> Result<(), JobError> {
        let payload: GetAnimePayload = job.payload_as()?;
        let xml = self.http.get_anime(payload.aid, ctx.cancellation()).await?;

        let anime = AniDbAnime {
            aid: payload.aid,
            title: main_title(&xml),
            xml,
        };
        self.sink.anime_updated(&anime).await?;
        Ok(())
    }
}
