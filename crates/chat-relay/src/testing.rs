//! Test utilities for chat-relay - scripted backends and fixtures
//!
//! [`MockBackend`] stands in for a real provider: it replays a fixed list of
//! chunks (optionally spaced out in time), records every call it receives,
//! and then completes, fails or hangs until cancelled.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::provider::{DEFAULT_API_ROOT, Provider, ProviderMode};
use crate::upstream::{
    ChatBackend, ChatMessage, Continuation, ProgressSink, Role, SendOptions, UpstreamError,
};

/// What the mock does after replaying its chunks
#[derive(Debug, Clone)]
pub enum MockEnding {
    Complete,
    Fail(UpstreamError),
    /// Never resolve on its own; only cancellation ends the call
    Hang,
}

/// A call as observed by [`MockBackend`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub message: String,
    pub system_message: Option<String>,
    pub continuation: Continuation,
    pub api_key: Option<String>,
}

/// Scripted [`ChatBackend`]
#[derive(Debug)]
pub struct MockBackend {
    chunks: Vec<String>,
    delay: Duration,
    ending: MockEnding,
    calls: Mutex<Vec<RecordedCall>>,
    emitted: Mutex<usize>,
}

impl MockBackend {
    /// Replays `chunks` with no delay and completes
    pub fn new<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            delay: Duration::ZERO,
            ending: MockEnding::Complete,
            calls: Mutex::new(Vec::new()),
            emitted: Mutex::new(0),
        }
    }

    /// Wait `delay` before each chunk
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self, error: UpstreamError) -> Self {
        self.ending = MockEnding::Fail(error);
        self
    }

    pub fn hanging(mut self) -> Self {
        self.ending = MockEnding::Hang;
        self
    }

    /// Calls received so far
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of chunks handed to progress callbacks across all calls
    pub fn emitted(&self) -> usize {
        *self.emitted.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    async fn send_message(
        &self,
        message: &str,
        options: SendOptions,
        on_progress: ProgressSink<'_>,
    ) -> Result<ChatMessage, UpstreamError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedCall {
                message: message.to_string(),
                system_message: options.system_message.clone(),
                continuation: options.continuation.clone(),
                api_key: options.api_key.clone(),
            });

        let cancel = options.cancel;
        let mut result = ChatMessage {
            id: "mock-reply".to_string(),
            role: Role::Assistant,
            parent_message_id: options
                .continuation
                .field("parentMessageId")
                .map(str::to_string),
            ..Default::default()
        };

        for chunk in &self.chunks {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }
            result.text.push_str(chunk);
            result.delta = Some(chunk.clone());
            *self.emitted.lock().unwrap_or_else(PoisonError::into_inner) += 1;
            on_progress(&result);
        }

        match &self.ending {
            MockEnding::Complete => {
                result.delta = None;
                Ok(result)
            }
            MockEnding::Fail(error) => Err(error.clone()),
            MockEnding::Hang => {
                cancel.cancelled().await;
                Err(UpstreamError::Cancelled)
            }
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Wrap a backend in a [`Provider`] for the given mode
///
/// Official mode gets the default key `sk-default`.
pub fn mock_provider(mode: ProviderMode, backend: Arc<dyn ChatBackend>) -> Arc<Provider> {
    let default_key = match mode {
        ProviderMode::OfficialApi => Some("sk-default".to_string()),
        ProviderMode::UnofficialProxy => None,
    };
    Arc::new(Provider::new(
        mode,
        backend,
        reqwest::Client::new(),
        default_key,
        DEFAULT_API_ROOT,
    ))
}
