//! Official chat-completions API client (API-key mode)
//!
//! Streams `/chat/completions` over SSE. The API itself is stateless, so the
//! client keeps every turn in a [`MessageStore`] and rebuilds history from the
//! `parentMessageId` chain, trimmed to the model's token budget.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    ChatBackend, ChatMessage, MessageStore, ProgressSink, Role, SendOptions, SseDecoder, SseEvent,
    StoredMessage, UpstreamError, estimate_tokens, http_error,
};

/// Connection and model settings for the official API
#[derive(Clone)]
pub struct OfficialApiSettings {
    /// Process-wide default key, used when a call carries no override
    pub api_key: String,
    /// Base URL including the `/v1` suffix
    pub api_base_url: String,
    pub model: String,
    pub max_model_tokens: usize,
    pub max_response_tokens: usize,
    /// Trace request/response payloads at debug level
    pub debug: bool,
}

impl std::fmt::Debug for OfficialApiSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfficialApiSettings")
            .field("api_base_url", &self.api_base_url)
            .field("model", &self.model)
            .field("max_model_tokens", &self.max_model_tokens)
            .field("max_response_tokens", &self.max_response_tokens)
            .field("debug", &self.debug)
            .finish_non_exhaustive()
    }
}

/// Chat-completion request body
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: usize,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

/// One streamed chunk
#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    id: String,
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Per-message token overhead of the chat format
const TOKENS_PER_MESSAGE: usize = 4;

pub struct OfficialApiClient {
    client: Client,
    settings: OfficialApiSettings,
    store: MessageStore,
}

impl OfficialApiClient {
    pub fn new(client: Client, settings: OfficialApiSettings) -> Self {
        Self {
            client,
            settings,
            store: MessageStore::default(),
        }
    }

    pub fn settings(&self) -> &OfficialApiSettings {
        &self.settings
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.settings.api_base_url.trim_end_matches('/')
        )
    }

    /// Assemble system prompt, stored history and the new user message
    fn build_messages<'a>(
        &self,
        system_message: Option<&'a str>,
        history: &'a [StoredMessage],
        user_text: &'a str,
    ) -> Vec<Message<'a>> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        if let Some(system) = system_message {
            messages.push(Message {
                role: Role::System.as_str(),
                content: system,
            });
        }
        messages.extend(history.iter().map(|m| Message {
            role: m.role.as_str(),
            content: m.text.as_str(),
        }));
        messages.push(Message {
            role: Role::User.as_str(),
            content: user_text,
        });
        messages
    }
}

#[async_trait]
impl ChatBackend for OfficialApiClient {
    async fn send_message(
        &self,
        message: &str,
        options: SendOptions,
        on_progress: ProgressSink<'_>,
    ) -> Result<ChatMessage, UpstreamError> {
        let cancel = options.cancel.clone();
        let api_key = options
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .unwrap_or(&self.settings.api_key)
            .to_string();
        if api_key.trim().is_empty() {
            return Err(UpstreamError::MissingCredential(
                "no OpenAI API key available".to_string(),
            ));
        }

        let parent_id = options.continuation.field("parentMessageId").map(str::to_string);
        let user_message = StoredMessage {
            id: Uuid::new_v4().to_string(),
            role: Role::User,
            text: message.to_string(),
            parent_message_id: parent_id.clone(),
        };

        let system_message = options.system_message.as_deref();
        let budget = self
            .settings
            .max_model_tokens
            .saturating_sub(self.settings.max_response_tokens);
        let fixed = estimate_tokens(message)
            + system_message.map(estimate_tokens).unwrap_or(0)
            + TOKENS_PER_MESSAGE * 2;
        let (history, history_tokens) = self
            .store
            .history(parent_id.as_deref(), budget.saturating_sub(fixed));
        let prompt_tokens = fixed + history_tokens + TOKENS_PER_MESSAGE * history.len();
        let max_tokens = self
            .settings
            .max_response_tokens
            .min(self.settings.max_model_tokens.saturating_sub(prompt_tokens))
            .max(1);

        let request = ChatCompletionRequest {
            model: &self.settings.model,
            messages: self.build_messages(system_message, &history, message),
            max_tokens,
            stream: true,
        };

        let url = self.completions_url();
        if self.settings.debug {
            debug!(
                url = %url,
                history = history.len(),
                prompt_tokens,
                max_tokens,
                "sendMessage: {}",
                serde_json::to_string(&request).unwrap_or_default()
            );
        }

        let send = self
            .client
            .post(&url)
            .bearer_auth(&api_key)
            .header("Accept", "text/event-stream")
            .json(&request)
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
            response = send => response?,
        };

        if !response.status().is_success() {
            return Err(http_error("OpenAI", response).await);
        }

        let mut result = ChatMessage {
            id: Uuid::new_v4().to_string(),
            role: Role::Assistant,
            parent_message_id: Some(user_message.id.clone()),
            ..Default::default()
        };

        let mut decoder = SseDecoder::new();
        let mut body = response.bytes_stream();
        let mut done = false;

        while !done {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
                next = body.next() => next,
            };

            let events = match next {
                Some(Ok(bytes)) => decoder.push(&bytes),
                Some(Err(e)) => return Err(e.into()),
                None => {
                    done = true;
                    decoder.finish()
                }
            };

            for event in events {
                let data = match event {
                    SseEvent::Done => {
                        done = true;
                        break;
                    }
                    SseEvent::Data(data) => data,
                };

                let detail: Value = match serde_json::from_str(&data) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!("Skipping malformed completion chunk: {e}");
                        continue;
                    }
                };
                let chunk: ChatCompletionChunk = serde_json::from_value(detail.clone())
                    .map_err(|e| UpstreamError::Parse(e.to_string()))?;

                if !chunk.id.is_empty() {
                    result.id = chunk.id;
                }
                let Some(delta) = chunk
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.delta.content)
                else {
                    continue;
                };

                if cancel.is_cancelled() {
                    return Err(UpstreamError::Cancelled);
                }
                result.text.push_str(&delta);
                result.delta = Some(delta);
                result.detail = Some(detail);
                on_progress(&result);
            }
        }

        result.text = result.text.trim().to_string();
        result.delta = None;

        self.store.insert(StoredMessage {
            id: result.id.clone(),
            role: Role::Assistant,
            text: result.text.clone(),
            parent_message_id: Some(user_message.id.clone()),
        });
        self.store.insert(user_message);

        if self.settings.debug {
            debug!(id = %result.id, chars = result.text.len(), "sendMessage complete");
        }
        Ok(result)
    }

    fn name(&self) -> &'static str {
        "official-api"
    }
}
