//! Destination for metadata the AniDB jobs retrieve
//!
//! Persisting entities is not the scheduler's concern; jobs hand their
//! results to a [`MetadataSink`] and treat a sink error as retryable.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::WorkerResult;

/// A local file matched against AniDB
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AniDbFile {
    pub fid: u64,
    pub aid: u64,
    pub eid: u64,
    pub gid: u64,
    pub size: u64,
    pub ed2k: String,
}

/// Anime details from the HTTP API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AniDbAnime {
    pub aid: u64,
    /// Main title, if the document has one
    pub title: Option<String>,
    pub xml: String,
}

/// Result of adding a file to the user's MyList
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MyListEntry {
    pub fid: u64,
    /// MyList id, when AniDB reported it
    pub lid: Option<u64>,
    pub already_listed: bool,
}

/// Receives metadata produced by jobs
#[async_trait]
pub trait MetadataSink: Send + Sync {
    async fn file_identified(&self, file: &AniDbFile) -> WorkerResult<()>;

    /// AniDB does not know a file with this size and hash
    async fn file_unknown(&self, size: u64, ed2k: &str) -> WorkerResult<()>;

    async fn anime_updated(&self, anime: &AniDbAnime) -> WorkerResult<()>;

    async fn mylist_updated(&self, entry: &MyListEntry) -> WorkerResult<()>;
}

/// Sink that only logs what it receives
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl MetadataSink for TracingSink {
    async fn file_identified(&self, file: &AniDbFile) -> WorkerResult<()> {
        info!(fid = file.fid, aid = file.aid, eid = file.eid, gid = file.gid, "File identified");
        Ok(())
    }

    async fn file_unknown(&self, size: u64, ed2k: &str) -> WorkerResult<()> {
        info!(size, ed2k, "File not known to AniDB");
        Ok(())
    }

    async fn anime_updated(&self, anime: &AniDbAnime) -> WorkerResult<()> {
        info!(aid = anime.aid, title = ?anime.title, "Anime updated");
        Ok(())
    }

    async fn mylist_updated(&self, entry: &MyListEntry) -> WorkerResult<()> {
        info!(
            fid = entry.fid,
            lid = ?entry.lid,
            already_listed = entry.already_listed,
            "MyList updated"
        );
        Ok(())
    }
}
