use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tsundoku_anidb_client::{Command, ReturnCode, UdpConnectionHandler};

use super::udp_job;
use crate::error::{JobError, WorkerResult};
use crate::job::{JobContext, JobHandler, NewJob};
use crate::registry::{JobTypeInfo, Priority};
use crate::sink::{MetadataSink, MyListEntry};
use crate::store::JobRecord;

pub const ADD_TO_MYLIST: &str = "anidb_add_to_mylist";

/// MyList storage state "on HDD"
const STATE_ON_HDD: u8 = 1;

fn default_state() -> u8 {
    STATE_ON_HDD
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddToMyListPayload {
    pub fid: u64,
    #[serde(default)]
    pub watched: bool,
    #[serde(default = "default_state")]
    pub state: u8,
}

/// Add a file to the user's MyList with MYLISTADD
pub struct AddToMyListJob {
    udp: Arc<UdpConnectionHandler>,
    sink: Arc<dyn MetadataSink>,
}

impl AddToMyListJob {
    pub fn new(udp: Arc<UdpConnectionHandler>, sink: Arc<dyn MetadataSink>) -> Self {
        Self { udp, sink }
    }

    pub fn job(fid: u64, watched: bool) -> WorkerResult<NewJob> {
        NewJob::new(ADD_TO_MYLIST, fid.to_string()).with_payload(&AddToMyListPayload {
            fid,
            watched,
            state: STATE_ON_HDD,
        })
    }
}

#[async_trait]
impl JobHandler for AddToMyListJob {
    fn job_type(&self) -> JobTypeInfo {
        udp_job(ADD_TO_MYLIST).priority(Priority::LOW)
    }

    async fn execute(&self, job: &JobRecord, ctx: &JobContext) -> Result<(), JobError> {
        let payload: AddToMyListPayload = job.payload_as()?;
        if payload.fid == 0 {
            return Err(JobError::fatal("file id must be positive"));
        }

        let command = Command::new("MYLISTADD")
            .param("fid", payload.fid)
            .param("state", payload.state)
            .param("viewed", u8::from(payload.watched));
        let response = self.udp.send(command, ctx.cancellation()).await?;

        let entry = match response.code {
            ReturnCode::MylistEntryAdded => MyListEntry {
                fid: payload.fid,
                lid: response.lines.first().and_then(|line| line.trim().parse().ok()),
                already_listed: false,
            },
            ReturnCode::FileAlreadyInMylist => MyListEntry {
                fid: payload.fid,
                lid: response.fields().first().and_then(|lid| lid.parse().ok()),
                already_listed: true,
            },
            ReturnCode::NoSuchFile => {
                return Err(JobError::fatal(format!("AniDB has no file {}", payload.fid)));
            }
            other => {
                return Err(JobError::retryable(format!(
                    "unexpected reply {} to MYLISTADD",
                    other
                )));
            }
        };

        self.sink.mylist_updated(&entry).await?;
        Ok(())
    }
}
