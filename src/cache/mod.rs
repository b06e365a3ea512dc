//! Content snapshot cache.
//!
//! Stores a short, bounded history of extracted content versions per page.
//! Dynamic pages change faster than a user can ask about them; keeping a few
//! versions lets context assembly reconstruct "what changed" without unbounded
//! growth. The newest version is never evicted, so a page always has something
//! to answer with even if it has gone stale.

mod types;

pub use types::{ChangeType, ContentUpdate, Snapshot};

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;

/// Marker appended when content exceeds the size cap.
pub const TRUNCATION_MARKER: &str = "\n[content truncated]";

/// Cache tunables.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Retained versions per page; the oldest are dropped first.
    pub max_versions: usize,
    /// Content size cap in bytes before the truncation marker is appended.
    pub max_content_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_versions: 5,
            max_content_bytes: 100 * 1024,
        }
    }
}

#[derive(Debug, Default)]
struct PageHistory {
    versions: Vec<Snapshot>,
    /// Monotonic counter; survives eviction, resets only on navigation.
    next_version: u64,
}

/// Versioned, size-bounded store of page content snapshots.
///
/// Exclusively owned and mutated by the coordinating process; page contexts
/// and UI surfaces observe it only through bus channels.
pub struct SnapshotCache {
    config: CacheConfig,
    pages: RwLock<HashMap<u64, PageHistory>>,
}

impl SnapshotCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            pages: RwLock::new(HashMap::new()),
        }
    }

    /// Store a content update, computing the next version for the page.
    ///
    /// A `navigation` update whose URL differs from the previous snapshot's
    /// discards the page's history and restarts versioning at 1.
    pub async fn put(&self, update: ContentUpdate) -> Snapshot {
        let (content, truncated) =
            truncate_content(&update.content, self.config.max_content_bytes);
        if truncated {
            tracing::debug!(
                page_id = update.page_id,
                cap = self.config.max_content_bytes,
                "Snapshot content truncated"
            );
        }

        let mut pages = self.pages.write().await;
        let history = pages.entry(update.page_id).or_default();

        let is_new_document = update.change_type == ChangeType::Navigation
            && history
                .versions
                .last()
                .map(|prev| prev.url != update.url)
                .unwrap_or(false);
        if is_new_document {
            tracing::debug!(page_id = update.page_id, url = %update.url, "Page navigated, discarding history");
            history.versions.clear();
            history.next_version = 0;
        }

        let title = update
            .title
            .or_else(|| history.versions.last().map(|s| s.title.clone()))
            .unwrap_or_default();

        history.next_version += 1;
        let snapshot = Snapshot {
            page_id: update.page_id,
            url: update.url,
            title,
            content_hash: fnv1a(content.as_bytes()),
            content,
            version: history.next_version,
            timestamp: update.timestamp,
            last_accessed: Utc::now(),
            change_type: update.change_type,
        };
        history.versions.push(snapshot.clone());

        // Trim oldest first; the most recent entry is always retained.
        while history.versions.len() > self.config.max_versions.max(1) {
            history.versions.remove(0);
        }

        snapshot
    }

    /// Newest snapshot for a page, bumping its access time.
    pub async fn get_latest(&self, page_id: u64) -> Option<Snapshot> {
        let mut pages = self.pages.write().await;
        let latest = pages.get_mut(&page_id)?.versions.last_mut()?;
        latest.last_accessed = Utc::now();
        Some(latest.clone())
    }

    /// Newest snapshot per requested page, order-preserving, `None` where a
    /// page was never scraped or already evicted.
    pub async fn get_latest_many(&self, page_ids: &[u64]) -> Vec<Option<Snapshot>> {
        let mut pages = self.pages.write().await;
        let now = Utc::now();
        page_ids
            .iter()
            .map(|id| {
                let latest = pages.get_mut(id).and_then(|h| h.versions.last_mut())?;
                latest.last_accessed = now;
                Some(latest.clone())
            })
            .collect()
    }

    /// All retained versions for a page, oldest first.
    pub async fn get_all_snapshots(&self, page_id: u64) -> Vec<Snapshot> {
        let pages = self.pages.read().await;
        pages
            .get(&page_id)
            .map(|h| h.versions.clone())
            .unwrap_or_default()
    }

    /// Latest content verbatim, or all retained versions concatenated
    /// oldest-first with a per-version header.
    pub async fn get_merged(&self, page_id: u64, include_history: bool) -> Option<String> {
        let pages = self.pages.read().await;
        let history = pages.get(&page_id)?;
        let latest = history.versions.last()?;

        if !include_history {
            return Some(latest.content.clone());
        }

        let mut merged = String::new();
        for (i, snapshot) in history.versions.iter().enumerate() {
            if i > 0 {
                merged.push_str("\n\n");
            }
            merged.push_str(&format!(
                "--- Version {} ({}) ---\n",
                i + 1,
                snapshot.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
            ));
            merged.push_str(&snapshot.content);
        }
        Some(merged)
    }

    /// Drop all versions for a page. Idempotent.
    pub async fn clear(&self, page_id: u64) {
        self.pages.write().await.remove(&page_id);
    }

    /// Drop all versions for several pages. Idempotent.
    pub async fn clear_many(&self, page_ids: &[u64]) {
        let mut pages = self.pages.write().await;
        for id in page_ids {
            pages.remove(id);
        }
    }

    /// Periodic sweep: drop versions older than `max_age`, except the single
    /// most recent version of each page, which is retained regardless of age.
    ///
    /// Returns the number of versions dropped.
    pub async fn cleanup(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let mut dropped = 0;
        let mut pages = self.pages.write().await;
        for history in pages.values_mut() {
            let len = history.versions.len();
            if len <= 1 {
                continue;
            }
            let before = len;
            let last_index = len - 1;
            let mut index = 0;
            history.versions.retain(|snapshot| {
                let keep = index == last_index || snapshot.timestamp >= cutoff;
                index += 1;
                keep
            });
            dropped += before - history.versions.len();
        }
        if dropped > 0 {
            tracing::debug!(dropped, "Snapshot cleanup sweep");
        }
        dropped
    }

    /// Newest snapshot of every known page (for page listings).
    pub async fn latest_snapshots(&self) -> Vec<Snapshot> {
        let pages = self.pages.read().await;
        let mut latest: Vec<Snapshot> = pages
            .values()
            .filter_map(|h| h.versions.last().cloned())
            .collect();
        latest.sort_by_key(|s| s.page_id);
        latest
    }
}

/// FNV-1a over the content bytes; only used to detect whether content
/// changed between captures.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Cap content at `max_bytes` (on a char boundary) and append the marker.
fn truncate_content(content: &str, max_bytes: usize) -> (String, bool) {
    if content.len() <= max_bytes {
        return (content.to_string(), false);
    }
    let mut cut = max_bytes;
    while cut > 0 && !content.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut truncated = content[..cut].to_string();
    truncated.push_str(TRUNCATION_MARKER);
    (truncated, true)
}
