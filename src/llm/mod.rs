//! Provider client module for streaming chat completions.
//!
//! This module provides a trait-based abstraction over completion providers,
//! with OpenRouter (and any OpenAI-compatible endpoint) as the primary
//! implementation. Completions are consumed as a stream of text deltas so the
//! coordinator can forward them incrementally and abort mid-flight.

mod error;
mod openrouter;

pub use error::{classify_http_status, LlmError, LlmErrorKind};
pub use openrouter::OpenRouterClient;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        ChatMessage {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Optional parameters for chat completions.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    /// Sampling temperature (0 = deterministic).
    pub temperature: Option<f64>,
    /// Top-p nucleus sampling.
    pub top_p: Option<f64>,
    /// Maximum output tokens to generate.
    pub max_tokens: Option<u64>,
}

/// One incremental chunk of a streamed completion.
#[derive(Debug, Clone)]
pub struct StreamDelta {
    pub text: String,
}

/// A streamed completion: zero or more deltas, then end-of-stream.
/// An `Err` item is terminal; no further items follow it.
pub type CompletionStream = BoxStream<'static, Result<StreamDelta, LlmError>>;

/// Trait for streaming completion clients.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Open a streaming chat completion.
    ///
    /// Returns an error if the stream could not be opened at all; errors
    /// during streaming arrive as items on the returned stream.
    async fn stream_chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: ChatOptions,
    ) -> Result<CompletionStream, LlmError>;
}
