use crate::mpd::Reply;
use serde::Serialize;
use uuid::Uuid;

/// One playable item from the daemon's catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub file: String,
    pub artist: Option<String>,
    pub title: Option<String>,
    pub album: Option<String>,
}

impl CatalogEntry {
    /// Decodes a `file` record; directory and playlist records yield `None`.
    pub fn from_record(record: &Reply) -> Option<Self> {
        let file = record.get("file")?;
        Some(Self {
            file: file.to_string(),
            artist: record.get("Artist").map(str::to_string),
            title: record.get("Title").map(str::to_string),
            album: record.get("Album").map(str::to_string),
        })
    }
}

const LISTING_BOUNDARIES: &[&str] = &["file", "directory", "playlist"];

/// Catalog entries of a `listallinfo` reply in daemon order.
pub fn catalog_from_reply(reply: &Reply) -> Vec<CatalogEntry> {
    reply
        .records(LISTING_BOUNDARIES)
        .iter()
        .filter_map(CatalogEntry::from_record)
        .collect()
}

/// Queue contents as read from `playlistinfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub items: Vec<String>,
}

impl QueueSnapshot {
    pub fn from_reply(reply: &Reply) -> Self {
        let items = reply
            .pairs()
            .iter()
            .filter(|(k, _)| k == "file")
            .map(|(_, v)| v.clone())
            .collect();
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "failures")]
pub enum LinkState {
    Connected,
    Degraded(u32),
    Reconnecting,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub link: LinkState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub reconnects: u64,
    pub session_id: Uuid,
    pub session_closed: bool,
    pub endpoint: String,
}
