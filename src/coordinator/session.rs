//! Active completion sessions.
//!
//! One session per `(connection, session key)` pair. A new prompt under the
//! same key supersedes the running session; the superseded stream is
//! cancelled and emits nothing further.

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::ConnectionId;

/// Identity of a conversation slot on one UI connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub connection: ConnectionId,
    pub key: String,
}

impl SessionKey {
    pub fn new(connection: ConnectionId, key: impl Into<String>) -> Self {
        Self {
            connection,
            key: key.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Streaming,
    Done,
    Error,
    Cancelled,
}

/// One in-flight completion.
#[derive(Debug, Clone)]
pub struct ActiveSession {
    /// Distinguishes this session from a successor under the same key.
    pub id: Uuid,
    pub request_id: String,
    pub page_ids: Vec<u64>,
    pub cancel: CancellationToken,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
}

impl ActiveSession {
    pub fn new(request_id: String, page_ids: Vec<u64>, cancel: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            request_id,
            page_ids,
            cancel,
            state: SessionState::Starting,
            started_at: Utc::now(),
        }
    }
}
