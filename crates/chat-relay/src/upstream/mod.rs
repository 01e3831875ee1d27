//! Upstream chat provider clients
//!
//! Both provider variants implement [`ChatBackend`]: send one user message,
//! stream partial [`ChatMessage`]s through a progress callback, observe a
//! cancellation token, and return the final message.

mod egress;
mod official;
mod sse;
mod store;
mod unofficial;

pub use egress::{EgressStrategy, build_http_client};
pub use official::{OfficialApiClient, OfficialApiSettings};
pub use sse::{SseDecoder, SseEvent};
pub use store::{MessageStore, StoredMessage};
pub use unofficial::{
    DEFAULT_REVERSE_PROXY_URL, DEFAULT_UNOFFICIAL_MODEL, UnofficialProxyClient,
    UnofficialProxySettings,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    #[default]
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A (partial or final) chat message as relayed to the browser
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub text: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Text added by the most recent chunk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
    /// Raw provider payload behind this message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

/// How a new message links to the previous turn
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Continuation {
    /// First turn of a conversation
    #[default]
    None,
    /// Official API: id of the message being replied to
    ParentMessage(String),
    /// Reverse proxy: provider-opaque object forwarded unchanged
    Opaque(Map<String, Value>),
}

impl Continuation {
    /// Read a string field from whatever shape the continuation has
    pub fn field(&self, name: &str) -> Option<&str> {
        match self {
            Continuation::None => None,
            Continuation::ParentMessage(id) => (name == "parentMessageId").then_some(id.as_str()),
            Continuation::Opaque(map) => map
                .get(name)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty()),
        }
    }
}

/// Per-call options for [`ChatBackend::send_message`]
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// System prompt; ignored by backends that do not support one
    pub system_message: Option<String>,
    pub continuation: Continuation,
    /// Credential for this call only; the backend default is used when absent
    pub api_key: Option<String>,
    /// Cancelled when the call must stop (watchdog expiry or client disconnect)
    pub cancel: CancellationToken,
}

/// Receives each partial result in arrival order
pub type ProgressSink<'a> = &'a mut (dyn FnMut(&ChatMessage) + Send);

/// Errors raised by an upstream call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    /// Provider answered with a non-success status
    #[error("{message}")]
    Http { status: u16, message: String },

    /// The cancellation token fired before the call completed
    #[error("Request cancelled")]
    Cancelled,

    /// Connection-level failure
    #[error("Network error: {0}")]
    Network(String),

    /// Provider sent something we could not understand
    #[error("Invalid upstream response: {0}")]
    Parse(String),

    /// No credential was available for the call
    #[error("Missing credential: {0}")]
    MissingCredential(String),
}

impl UpstreamError {
    /// HTTP status reported by the provider, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            UpstreamError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            UpstreamError::Http {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else if e.is_timeout() {
            UpstreamError::Network(format!("timed out: {e}"))
        } else if e.is_connect() {
            UpstreamError::Network(format!("could not connect: {e}"))
        } else {
            UpstreamError::Network(e.to_string())
        }
    }
}

/// Capability interface shared by both provider variants
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Send one user message and stream the reply
    ///
    /// `on_progress` receives every partial result in order and is never
    /// called after `options.cancel` fires.
    async fn send_message(
        &self,
        message: &str,
        options: SendOptions,
        on_progress: ProgressSink<'_>,
    ) -> Result<ChatMessage, UpstreamError>;

    /// Backend name for logging
    fn name(&self) -> &'static str;
}

/// Rough token estimate (about four characters per token)
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

/// Read a non-success response into an [`UpstreamError::Http`]
///
/// Prefers the provider's `error.message` (or `detail`) field over the raw body.
pub(crate) async fn http_error(provider: &str, response: reqwest::Response) -> UpstreamError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    let reason = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|json| {
            json.pointer("/error/message")
                .or_else(|| json.get("detail"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                status.canonical_reason().unwrap_or("Unknown error").to_string()
            } else {
                body
            }
        });

    UpstreamError::Http {
        status: status.as_u16(),
        message: format!("{provider} error {}: {reason}", status.as_u16()),
    }
}
