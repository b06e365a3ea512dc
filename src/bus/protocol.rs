//! Wire protocol for the message bus.
//!
//! Every envelope is a `Frame`, a closed tagged union validated at the bus
//! boundary. Malformed or unknown payloads are rejected before they reach a
//! handler. Channel payloads are a second closed union tagged by channel name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::ChangeType;

/// Logical message channels between contexts and the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Channel {
    ContentInit,
    ContentDelta,
    GetContent,
    ListPages,
    UserPrompt,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::ContentInit => "content-init",
            Channel::ContentDelta => "content-delta",
            Channel::GetContent => "get-content",
            Channel::ListPages => "list-pages",
            Channel::UserPrompt => "user-prompt",
        }
    }

    /// No reply expected.
    pub fn is_fire_and_forget(&self) -> bool {
        matches!(self, Channel::ContentInit | Channel::ContentDelta)
    }

    /// One request yields zero-or-more deltas then exactly one terminal frame.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Channel::UserPrompt)
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First capture of a page's content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentInit {
    pub page_id: u64,
    pub url: String,
    pub title: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Subsequent content change on an already-captured page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentDelta {
    pub page_id: u64,
    pub url: String,
    pub content: String,
    pub change_type: ChangeType,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetContentRequest {
    pub page_ids: Vec<u64>,
}

/// One page's latest content in a `get-content` reply; `null` where no
/// snapshot exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageContent {
    pub page_id: u64,
    pub url: String,
    pub title: String,
    pub content: String,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetContentReply {
    /// Order-preserving: one entry per requested page id.
    pub pages: Vec<Option<PageContent>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListPagesRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageListing {
    pub id: u64,
    pub title: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favicon_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListPagesReply {
    pub pages: Vec<PageListing>,
}

/// One user/assistant exchange carried alongside a prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: TurnRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPromptRequest {
    pub prompt: String,
    pub page_ids: Vec<u64>,
    pub session_key: String,
    #[serde(default)]
    pub conversation_history: Vec<HistoryTurn>,
}

/// Request payloads, tagged by channel name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "channel", content = "body", rename_all = "kebab-case")]
pub enum Request {
    ContentInit(ContentInit),
    ContentDelta(ContentDelta),
    GetContent(GetContentRequest),
    ListPages(ListPagesRequest),
    UserPrompt(UserPromptRequest),
}

impl Request {
    pub fn channel(&self) -> Channel {
        match self {
            Request::ContentInit(_) => Channel::ContentInit,
            Request::ContentDelta(_) => Channel::ContentDelta,
            Request::GetContent(_) => Channel::GetContent,
            Request::ListPages(_) => Channel::ListPages,
            Request::UserPrompt(_) => Channel::UserPrompt,
        }
    }
}

/// Reply payloads, tagged by the channel they answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "channel", content = "body", rename_all = "kebab-case")]
pub enum Reply {
    GetContent(GetContentReply),
    ListPages(ListPagesReply),
}

/// The transport envelope.
///
/// `message` initiates; `reply` answers a request/response call; `delta`,
/// `done` and `error` belong to streaming calls (`done`/`error` are terminal,
/// exactly one arrives); `cancel` flows from initiator to responder and
/// suppresses further emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Message {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        payload: Request,
    },
    Reply {
        request_id: String,
        payload: Reply,
    },
    Delta {
        request_id: String,
        text: String,
    },
    Done {
        request_id: String,
    },
    Error {
        request_id: String,
        message: String,
    },
    Cancel {
        request_id: String,
    },
}
