//! Canned AniDB responses

/// Successful FILE reply carrying `fid|aid|eid|gid`
pub fn file_reply(fid: u64, aid: u64, eid: u64, gid: u64) -> String {
    format!("220 FILE\n{}|{}|{}|{}\n", fid, aid, eid, gid)
}

/// Minimal anime document as served by the HTTP API
pub fn anime_xml(aid: u64, title: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<anime id="{aid}" restricted="false">
  <type>TV Series</type>
  <episodecount>12</episodecount>
  <titles>
    <title xml:lang="x-jat" type="main">{title}</title>
  </titles>
</anime>"#
    )
}

/// Body the HTTP API serves to a banned client
pub fn banned_xml() -> &'static str {
    r#"<?xml version="1.0" encoding="UTF-8"?><error code="500">Banned</error>"#
}
