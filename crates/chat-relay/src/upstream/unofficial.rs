//! Reverse-proxy conversation client (session-token mode)
//!
//! Talks to a reverse proxy in front of the web conversation backend. The
//! provider keeps the conversation state; the client only forwards the
//! `conversationId`/`parentMessageId` it was handed. Each SSE event carries the
//! full text so far, not a delta.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    ChatBackend, ChatMessage, ProgressSink, Role, SendOptions, SseDecoder, SseEvent,
    UpstreamError, http_error,
};

pub const DEFAULT_REVERSE_PROXY_URL: &str = "https://ai.fakeopen.com/api/conversation";
pub const DEFAULT_UNOFFICIAL_MODEL: &str = "text-davinci-002-render-sha";

#[derive(Clone)]
pub struct UnofficialProxySettings {
    /// Session access token, fixed for the process lifetime
    pub access_token: String,
    pub reverse_proxy_url: String,
    pub model: String,
    pub debug: bool,
}

impl std::fmt::Debug for UnofficialProxySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnofficialProxySettings")
            .field("reverse_proxy_url", &self.reverse_proxy_url)
            .field("model", &self.model)
            .field("debug", &self.debug)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
struct ConversationRequest<'a> {
    action: &'static str,
    messages: Vec<ConversationMessage<'a>>,
    model: &'a str,
    parent_message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct ConversationMessage<'a> {
    id: &'a str,
    role: &'static str,
    content: MessageContent<'a>,
}

#[derive(Debug, Serialize)]
struct MessageContent<'a> {
    content_type: &'static str,
    parts: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ConversationEvent {
    message: Option<EventMessage>,
    #[serde(default)]
    conversation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventMessage {
    id: String,
    #[serde(default)]
    content: Option<EventContent>,
}

#[derive(Debug, Deserialize)]
struct EventContent {
    #[serde(default)]
    parts: Vec<Value>,
}

pub struct UnofficialProxyClient {
    client: Client,
    settings: UnofficialProxySettings,
}

impl UnofficialProxyClient {
    pub fn new(client: Client, settings: UnofficialProxySettings) -> Self {
        Self { client, settings }
    }

    pub fn settings(&self) -> &UnofficialProxySettings {
        &self.settings
    }
}

#[async_trait]
impl ChatBackend for UnofficialProxyClient {
    async fn send_message(
        &self,
        message: &str,
        options: SendOptions,
        on_progress: ProgressSink<'_>,
    ) -> Result<ChatMessage, UpstreamError> {
        let cancel = options.cancel.clone();
        if options.system_message.is_some() {
            debug!("Reverse proxy mode ignores system messages");
        }

        let message_id = Uuid::new_v4().to_string();
        let conversation_id = options.continuation.field("conversationId");
        let parent_message_id = options
            .continuation
            .field("parentMessageId")
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let request = ConversationRequest {
            action: "next",
            messages: vec![ConversationMessage {
                id: &message_id,
                role: Role::User.as_str(),
                content: MessageContent {
                    content_type: "text",
                    parts: vec![message],
                },
            }],
            model: &self.settings.model,
            parent_message_id,
            conversation_id,
        };

        if self.settings.debug {
            debug!(
                url = %self.settings.reverse_proxy_url,
                "sendMessage: {}",
                serde_json::to_string(&request).unwrap_or_default()
            );
        }

        let send = self
            .client
            .post(&self.settings.reverse_proxy_url)
            .bearer_auth(&self.settings.access_token)
            .header("Accept", "text/event-stream")
            .json(&request)
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
            response = send => response?,
        };

        if !response.status().is_success() {
            return Err(http_error("ChatGPT", response).await);
        }

        let mut result = ChatMessage {
            id: Uuid::new_v4().to_string(),
            role: Role::Assistant,
            parent_message_id: Some(message_id.clone()),
            conversation_id: conversation_id.map(str::to_string),
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
                        warn!("Skipping malformed conversation event: {e}");
                        continue;
                    }
                };
                let Ok(parsed) = serde_json::from_value::<ConversationEvent>(detail.clone()) else {
                    continue;
                };

                if let Some(conversation_id) = parsed.conversation_id {
                    result.conversation_id = Some(conversation_id);
                }
                let Some(event_message) = parsed.message else {
                    continue;
                };
                let Some(text) = event_message
                    .content
                    .and_then(|c| c.parts.into_iter().next())
                    .and_then(|p| p.as_str().map(str::to_string))
                else {
                    continue;
                };

                if cancel.is_cancelled() {
                    return Err(UpstreamError::Cancelled);
                }
                result.delta = Some(
                    text.strip_prefix(result.text.as_str())
                        .unwrap_or(text.as_str())
                        .to_string(),
                );
                result.id = event_message.id;
                result.text = text;
                result.detail = Some(detail);
                on_progress(&result);
            }
        }

        result.delta = None;
        if self.settings.debug {
            debug!(id = %result.id, chars = result.text.len(), "sendMessage complete");
        }
        Ok(result)
    }

    fn name(&self) -> &'static str {
        "unofficial-proxy"
    }
}
