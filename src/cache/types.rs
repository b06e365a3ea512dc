//! Snapshot record types shared between the cache and the wire protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What triggered a content update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    /// First capture after the page context loaded
    Init,
    /// DOM mutated in place
    Mutation,
    /// The page navigated to a new document
    Navigation,
    /// User-requested re-capture
    Manual,
}

/// One versioned capture of a page's extracted content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub page_id: u64,
    pub url: String,
    pub title: String,
    pub content: String,
    /// Strictly increasing per page, starting at 1; resets only on navigation
    /// to a different URL.
    pub version: u64,
    /// Cheap non-cryptographic hash, used only for change detection.
    pub content_hash: u64,
    pub timestamp: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub change_type: ChangeType,
}

/// An inbound content update from a page context.
#[derive(Debug, Clone)]
pub struct ContentUpdate {
    pub page_id: u64,
    pub url: String,
    /// Absent on delta updates; the previous title is kept.
    pub title: Option<String>,
    pub content: String,
    pub change_type: ChangeType,
    pub timestamp: DateTime<Utc>,
}
