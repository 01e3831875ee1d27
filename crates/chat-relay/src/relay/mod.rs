//! Chat relay engine
//!
//! Shapes a single chat turn for the active provider mode and relays it:
//! - resolves the persona into a system message (official API only)
//! - injects the per-call credential (official API only)
//! - attaches the continuation context in the mode's shape
//! - arms a watchdog that cancels the upstream call when the stream stalls
//! - forwards every partial result, then folds the outcome into
//!   [`RelayOutcome`] so no error crosses this boundary

mod errors;

pub use errors::{FALLBACK_ERROR_MESSAGE, failure_message, status_message, timeout_message};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::crypto::KeyCipher;
use crate::persona::PersonaRegistry;
use crate::provider::{Provider, ProviderMode};
use crate::upstream::{ChatMessage, Continuation, SendOptions};
use crate::watchdog::Watchdog;

/// One incoming chat turn
#[derive(Debug, Clone, Default)]
pub struct ChatTurnRequest {
    pub message: String,
    /// Continuation context returned to the client by the previous turn
    pub last_context: Option<Map<String, Value>>,
    /// Persona key, or literal system prompt when the key is not registered
    pub system_message_key: Option<String>,
    /// Encrypted client-supplied API key
    pub api_key_override: Option<String>,
}

/// Result of a relayed chat turn
#[derive(Debug, Clone, PartialEq)]
pub enum RelayOutcome {
    Success(ChatMessage),
    Fail { message: String },
}

impl RelayOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RelayOutcome::Success(_))
    }
}

/// Relays chat turns to the selected provider
#[derive(Clone)]
pub struct ChatRelay {
    provider: Arc<Provider>,
    personas: Arc<PersonaRegistry>,
    cipher: Arc<dyn KeyCipher>,
    timeout: Option<Duration>,
}

impl ChatRelay {
    /// `timeout_ms == 0` disables the watchdog
    pub fn new(
        provider: Arc<Provider>,
        personas: Arc<PersonaRegistry>,
        cipher: Arc<dyn KeyCipher>,
        timeout_ms: u64,
    ) -> Self {
        Self {
            provider,
            personas,
            cipher,
            timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
        }
    }

    pub fn provider(&self) -> &Arc<Provider> {
        &self.provider
    }

    pub fn personas(&self) -> &Arc<PersonaRegistry> {
        &self.personas
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Relay one chat turn
    ///
    /// `on_progress` receives each partial result together with the active
    /// watchdog (if a timeout is configured) so the caller can reset it on
    /// every chunk.
    pub async fn relay<F>(&self, request: ChatTurnRequest, on_progress: F) -> RelayOutcome
    where
        F: FnMut(&ChatMessage, Option<&Watchdog>) + Send,
    {
        self.relay_with_abort(request, CancellationToken::new(), on_progress)
            .await
    }

    /// Relay one chat turn, additionally stopping when `abort` is cancelled
    pub async fn relay_with_abort<F>(
        &self,
        request: ChatTurnRequest,
        abort: CancellationToken,
        mut on_progress: F,
    ) -> RelayOutcome
    where
        F: FnMut(&ChatMessage, Option<&Watchdog>) + Send,
    {
        let mode = self.provider.mode();
        info!(
            mode = %mode,
            persona = request.system_message_key.is_some(),
            continuation = request.last_context.is_some(),
            api_key_override = request.api_key_override.is_some(),
            "Relaying chat turn"
        );

        let api_key = match self.resolve_api_key(mode, request.api_key_override.as_deref()) {
            Ok(key) => key,
            Err(message) => return RelayOutcome::Fail { message },
        };

        let cancel = abort.child_token();
        let watchdog = self.timeout.map(|window| {
            let token = cancel.clone();
            Watchdog::started(window, move || token.cancel())
        });

        let options = SendOptions {
            system_message: self.system_message(mode, request.system_message_key.as_deref()),
            continuation: continuation_for(mode, request.last_context),
            api_key,
            cancel: cancel.clone(),
        };

        let mut chunks = 0usize;
        let mut sink = |partial: &ChatMessage| {
            if cancel.is_cancelled() {
                return;
            }
            chunks += 1;
            on_progress(partial, watchdog.as_ref());
        };

        let result = self
            .provider
            .backend()
            .send_message(&request.message, options, &mut sink)
            .await;

        let client_gone = abort.is_cancelled();
        let timed_out = !client_gone && watchdog.as_ref().is_some_and(Watchdog::has_fired);
        if let Some(watchdog) = &watchdog {
            watchdog.cancel();
        }

        match result {
            Ok(message) => {
                debug!(chunks, id = %message.id, "Chat turn complete");
                RelayOutcome::Success(message)
            }
            Err(e) => {
                let timeout = if timed_out { self.timeout } else { None };
                if client_gone {
                    info!(chunks, "Upstream call cancelled by client");
                } else if timed_out {
                    warn!(chunks, "Upstream call cancelled by watchdog");
                } else {
                    error!(
                        error_type = "upstream",
                        status = ?e.status(),
                        error_message = %e,
                        "Chat turn failed"
                    );
                }
                RelayOutcome::Fail {
                    message: failure_message(&e, timeout),
                }
            }
        }
    }

    /// Persona text plus the current date; reverse-proxy mode sends no system message
    fn system_message(&self, mode: ProviderMode, key: Option<&str>) -> Option<String> {
        match mode {
            ProviderMode::OfficialApi => {
                let persona = self.personas.resolve(key);
                let current_date = Utc::now().format("%Y-%m-%d");
                Some(format!("{persona}\nCurrent date: {current_date}"))
            }
            ProviderMode::UnofficialProxy => None,
        }
    }

    /// Per-call credential: decrypted override, else the process default
    fn resolve_api_key(
        &self,
        mode: ProviderMode,
        override_key: Option<&str>,
    ) -> std::result::Result<Option<String>, String> {
        match mode {
            ProviderMode::OfficialApi => match override_key.filter(|k| !k.trim().is_empty()) {
                Some(cipher_text) => self.cipher.decrypt(cipher_text).map(Some).map_err(|e| {
                    warn!(error_message = %e, "Failed to decrypt client API key");
                    format!("Invalid API key: {e}")
                }),
                None => Ok(self.provider.default_api_key().map(str::to_string)),
            },
            ProviderMode::UnofficialProxy => Ok(None),
        }
    }
}

/// Shape the continuation context for the active mode
///
/// Official API keeps only `parentMessageId`; the reverse proxy gets the whole
/// object unchanged.
pub fn continuation_for(mode: ProviderMode, last_context: Option<Map<String, Value>>) -> Continuation {
    let Some(context) = last_context else {
        return Continuation::None;
    };

    match mode {
        ProviderMode::OfficialApi => context
            .get("parentMessageId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(|id| Continuation::ParentMessage(id.to_string()))
            .unwrap_or_default(),
        ProviderMode::UnofficialProxy => Continuation::Opaque(context),
    }
}
