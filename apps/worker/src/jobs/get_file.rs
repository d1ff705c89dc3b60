use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use tsundoku_anidb_client::{AniDbError, Command, ReturnCode, UdpConnectionHandler};

use super::{udp_job, GetAnimeJob};
use crate::error::{JobError, WorkerResult};
use crate::job::{JobContext, JobHandler, NewJob};
use crate::registry::{JobTypeInfo, Priority};
use crate::sink::{AniDbFile, MetadataSink};
use crate::store::JobRecord;

pub const GET_FILE: &str = "anidb_get_file";

/// File fields requested: aid, eid, gid (fid is always first)
const FILE_FMASK: &str = "7000000000";
const FILE_AMASK: &str = "00000000";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetFilePayload {
    pub size: u64,
    pub ed2k: String,
}

impl GetFilePayload {
    fn validate(&self) -> Result<(), JobError> {
        if self.size == 0 {
            return Err(JobError::fatal("file size must be positive"));
        }
        if self.ed2k.len() != 32 || !self.ed2k.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(JobError::fatal(format!("invalid ed2k hash '{}'", self.ed2k)));
        }
        Ok(())
    }
}

/// Identify a local file with a FILE lookup, then queue its anime
pub struct GetFileJob {
    udp: Arc<UdpConnectionHandler>,
    sink: Arc<dyn MetadataSink>,
}

impl GetFileJob {
    pub fn new(udp: Arc<UdpConnectionHandler>, sink: Arc<dyn MetadataSink>) -> Self {
        Self { udp, sink }
    }

    /// Job for one file, deduplicated by its hash
    pub fn job(size: u64, ed2k: &str) -> WorkerResult<NewJob> {
        let ed2k = ed2k.to_ascii_lowercase();
        NewJob::new(GET_FILE, ed2k.clone()).with_payload(&GetFilePayload { size, ed2k })
    }
}

fn parse_file(fields: &[&str], payload: &GetFilePayload) -> Result<AniDbFile, AniDbError> {
    let field = |index: usize| -> Result<u64, AniDbError> {
        fields
            .get(index)
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| {
                AniDbError::UnexpectedResponse(format!("FILE reply field {} missing", index))
            })
    };

    Ok(AniDbFile {
        fid: field(0)?,
        aid: field(1)?,
        eid: field(2)?,
        gid: field(3)?,
        size: payload.size,
        ed2k: payload.ed2k.clone(),
    })
}

#[async_trait]
impl JobHandler for GetFileJob {
    fn job_type(&self) -> JobTypeInfo {
        udp_job(GET_FILE).priority(Priority::HIGH)
    }

    async fn execute(&self, job: &JobRecord, ctx: &JobContext) -> Result<(), JobError> {
        let payload: GetFilePayload = job.payload_as()?;
        payload.validate()?;

        let command = Command::new("FILE")
            .param("size", payload.size)
            .param("ed2k", &payload.ed2k)
            .param("fmask", FILE_FMASK)
            .param("amask", FILE_AMASK);
        let response = self.udp.send(command, ctx.cancellation()).await?;

        match response.code {
            ReturnCode::File => {
                let file = parse_file(&response.fields(), &payload)?;
                debug!(fid = file.fid, aid = file.aid, "FILE lookup matched");
                self.sink.file_identified(&file).await?;
                ctx.enqueue(GetAnimeJob::job(file.aid)?).await?;
                Ok(())
            }
            ReturnCode::NoSuchFile => {
                self.sink.file_unknown(payload.size, &payload.ed2k).await?;
                Ok(())
            }
            other => Err(JobError::retryable(format!(
                "unexpected reply {} to FILE",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_validation() {
        let valid = GetFilePayload {
            size: 1024,
            ed2k: "0123456789abcdef0123456789abcdef".to_string(),
        };
        assert!(valid.validate().is_ok());

        let empty = GetFilePayload { size: 0, ..valid.clone() };
        assert!(matches!(empty.validate(), Err(JobError::Fatal(_))));

        let short = GetFilePayload {
            ed2k: "abc".to_string(),
            ..valid
        };
        assert!(matches!(short.validate(), Err(JobError::Fatal(_))));
    }

    #[test]
    fn test_job_is_keyed_by_lowercase_hash() {
        let job = GetFileJob::job(10, "0123456789ABCDEF0123456789ABCDEF").unwrap();
        assert_eq!(job.dedup_key, "0123456789abcdef0123456789abcdef");
        assert_eq!(job.payload["size"], 10);
    }

    #[test]
    fn test_parse_file_requires_all_ids() {
        let payload = GetFilePayload {
            size: 1,
            ed2k: "0123456789abcdef0123456789abcdef".to_string(),
        };
        let file = parse_file(&["10", "20", "30", "40"], &payload).unwrap();
        assert_eq!((file.fid, file.aid, file.eid, file.gid), (10, 20, 30, 40));

        assert!(parse_file(&["10", "20"], &payload).is_err());
        assert!(parse_file(&["10", "x", "30", "40"], &payload).is_err());
    }
}
