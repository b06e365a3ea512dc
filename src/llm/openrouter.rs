//! OpenRouter streaming client (OpenAI-compatible SSE wire format).

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{Error as EsError, Event, EventSource};
use serde::{Deserialize, Serialize};

use super::error::LlmError;
use super::{ChatMessage, ChatOptions, CompletionClient, CompletionStream, StreamDelta};

const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Streaming client for OpenRouter or any OpenAI-compatible endpoint.
pub struct OpenRouterClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenRouterClient {
    /// Create a client against the default OpenRouter endpoint.
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, OPENROUTER_BASE_URL.to_string())
    }

    /// Create a client against a custom OpenAI-compatible endpoint.
    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url,
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl CompletionClient for OpenRouterClient {
    async fn stream_chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: ChatOptions,
    ) -> Result<CompletionStream, LlmError> {
        if self.api_key.is_empty() {
            return Err(LlmError::config_error(
                "No provider API key configured".to_string(),
            ));
        }

        let request = CompletionRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            stream: true,
            temperature: options.temperature,
            top_p: options.top_p,
            max_tokens: options.max_tokens,
        };

        tracing::debug!(model = %model, messages = messages.len(), "Opening completion stream");

        let builder = self
            .client
            .post(self.completions_url())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", "https://github.com/pagelens")
            .header("X-Title", "pagelens")
            .json(&request);

        let mut source = EventSource::new(builder)
            .map_err(|e| LlmError::network_error(format!("Failed to open stream: {}", e)))?;

        let stream = async_stream::stream! {
            while let Some(event) = source.next().await {
                match event {
                    Ok(Event::Open) => continue,
                    Ok(Event::Message(message)) => {
                        if message.data.trim() == "[DONE]" {
                            source.close();
                            break;
                        }
                        match serde_json::from_str::<CompletionChunk>(&message.data) {
                            Ok(chunk) => {
                                let text = chunk
                                    .choices
                                    .into_iter()
                                    .next()
                                    .and_then(|c| c.delta.content);
                                if let Some(text) = text {
                                    if !text.is_empty() {
                                        yield Ok(StreamDelta { text });
                                    }
                                }
                            }
                            Err(e) => {
                                yield Err(LlmError::parse_error(format!(
                                    "Failed to parse stream chunk: {}",
                                    e
                                )));
                                source.close();
                                break;
                            }
                        }
                    }
                    Err(EsError::StreamEnded) => break,
                    Err(EsError::InvalidStatusCode(status, response)) => {
                        let body = response.text().await.unwrap_or_default();
                        yield Err(LlmError::from_status(status.as_u16(), body));
                        source.close();
                        break;
                    }
                    Err(e) => {
                        yield Err(LlmError::network_error(format!("Stream failed: {}", e)));
                        source.close();
                        break;
                    }
                }
            }
        };

        Ok(stream.boxed())
    }
}

/// Chat completions request (OpenAI-compatible).
#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
}

/// One SSE chunk of a streamed completion.
#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    #[allow(dead_code)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_parsing() {
        let data = r#"{"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#;
        let chunk: CompletionChunk = serde_json::from_str(data).unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hel"));
    }

    #[test]
    fn test_chunk_parsing_without_content() {
        // First chunk often carries only the role
        let data = r#"{"choices":[{"delta":{"role":"assistant"},"finish_reason":null}]}"#;
        let chunk: CompletionChunk = serde_json::from_str(data).unwrap();
        assert!(chunk.choices[0].delta.content.is_none());
    }

    #[test]
    fn test_completions_url() {
        let client = OpenRouterClient::with_base_url(
            "key".to_string(),
            "https://example.com/v1/".to_string(),
        );
        assert_eq!(client.completions_url(), "https://example.com/v1/chat/completions");
    }
}
