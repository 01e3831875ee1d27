//! Integration tests for the chat relay engine
//!
//! Drives [`ChatRelay`] against the scripted [`MockBackend`] to check:
//! - persona and system-message shaping per provider mode
//! - continuation and credential injection
//! - status-code failure mapping
//! - watchdog timeout and reset-on-chunk liveness

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use chat_relay::crypto::{AesGcmCipher, KeyCipher, PassthroughCipher};
use chat_relay::persona::{DEFAULT_PERSONA_KEY, PersonaRegistry};
use chat_relay::provider::ProviderMode;
use chat_relay::relay::{ChatRelay, ChatTurnRequest, RelayOutcome, status_message};
use chat_relay::testing::{MockBackend, mock_provider};
use chat_relay::upstream::{ChatMessage, Continuation, UpstreamError};

// =============================================================================
// Helpers
// =============================================================================

fn relay_with(
    mode: ProviderMode,
    backend: Arc<MockBackend>,
    cipher: Arc<dyn KeyCipher>,
    timeout_ms: u64,
) -> ChatRelay {
    ChatRelay::new(
        mock_provider(mode, backend),
        Arc::new(PersonaRegistry::default()),
        cipher,
        timeout_ms,
    )
}

fn simple_relay(mode: ProviderMode, backend: Arc<MockBackend>) -> ChatRelay {
    relay_with(mode, backend, Arc::new(PassthroughCipher), 30_000)
}

fn turn(message: &str) -> ChatTurnRequest {
    ChatTurnRequest {
        message: message.to_string(),
        ..Default::default()
    }
}

fn context(value: Value) -> Option<Map<String, Value>> {
    value.as_object().cloned()
}

fn today_line() -> String {
    format!("\nCurrent date: {}", chrono::Utc::now().format("%Y-%m-%d"))
}

fn fail_message(outcome: RelayOutcome) -> String {
    match outcome {
        RelayOutcome::Fail { message } => message,
        RelayOutcome::Success(m) => panic!("expected failure, got {m:?}"),
    }
}

// =============================================================================
// Persona resolution
// =============================================================================

mod persona_tests {
    use super::*;

    #[tokio::test]
    async fn test_registered_persona_with_date_line() {
        let backend = Arc::new(MockBackend::new(["ok"]));
        let relay = simple_relay(ProviderMode::OfficialApi, backend.clone());
        let registry = PersonaRegistry::default();

        let mut request = turn("Hello");
        request.system_message_key = Some("translator".to_string());
        let outcome = relay.relay(request, |_, _| {}).await;
        assert!(outcome.is_success());

        let expected = format!("{}{}", registry.lookup("translator").unwrap(), today_line());
        assert_eq!(backend.calls()[0].system_message.as_deref(), Some(expected.as_str()));
    }

    #[tokio::test]
    async fn test_unknown_key_is_used_literally() {
        let backend = Arc::new(MockBackend::new(["ok"]));
        let relay = simple_relay(ProviderMode::OfficialApi, backend.clone());

        let mut request = turn("Hello");
        request.system_message_key = Some("You are a pirate.".to_string());
        relay.relay(request, |_, _| {}).await;

        let expected = format!("You are a pirate.{}", today_line());
        assert_eq!(backend.calls()[0].system_message.as_deref(), Some(expected.as_str()));
    }

    #[tokio::test]
    async fn test_missing_key_uses_default_persona() {
        let backend = Arc::new(MockBackend::new(["ok"]));
        let relay = simple_relay(ProviderMode::OfficialApi, backend.clone());
        let registry = PersonaRegistry::default();

        relay.relay(turn("Hello"), |_, _| {}).await;

        let system = backend.calls()[0].system_message.clone().unwrap();
        assert!(system.starts_with(registry.lookup(DEFAULT_PERSONA_KEY).unwrap()));
        assert!(system.ends_with(&today_line()));
    }

    #[tokio::test]
    async fn test_proxy_mode_never_sends_system_message() {
        for key in [None, Some("translator"), Some("literal prompt")] {
            let backend = Arc::new(MockBackend::new(["ok"]));
            let relay = simple_relay(ProviderMode::UnofficialProxy, backend.clone());

            let mut request = turn("Hello");
            request.system_message_key = key.map(str::to_string);
            relay.relay(request, |_, _| {}).await;

            assert_eq!(backend.calls()[0].system_message, None, "key {key:?}");
        }
    }
}

// =============================================================================
// Continuation and credentials
// =============================================================================

mod context_tests {
    use super::*;

    #[tokio::test]
    async fn test_official_keeps_only_parent_message_id() {
        let backend = Arc::new(MockBackend::new(["ok"]));
        let relay = simple_relay(ProviderMode::OfficialApi, backend.clone());

        let mut request = turn("Again");
        request.last_context = context(json!({
            "parentMessageId": "msg-1",
            "conversationId": "conv-1",
            "extra": true
        }));
        relay.relay(request, |_, _| {}).await;

        assert_eq!(
            backend.calls()[0].continuation,
            Continuation::ParentMessage("msg-1".to_string())
        );
    }

    #[tokio::test]
    async fn test_proxy_forwards_context_unchanged() {
        let backend = Arc::new(MockBackend::new(["ok"]));
        let relay = simple_relay(ProviderMode::UnofficialProxy, backend.clone());
        let value = json!({"parentMessageId": "msg-1", "conversationId": "conv-1", "nested": {"a": [1, 2]}});

        let mut request = turn("Again");
        request.last_context = context(value.clone());
        relay.relay(request, |_, _| {}).await;

        match &backend.calls()[0].continuation {
            Continuation::Opaque(map) => assert_eq!(Value::Object(map.clone()), value),
            other => panic!("unexpected continuation {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_override_key_is_decrypted_per_call() {
        let cipher = Arc::new(AesGcmCipher::new("shared-secret"));
        let encrypted = cipher.encrypt("sk-user").unwrap();
        let backend = Arc::new(MockBackend::new(["ok"]));
        let relay = relay_with(ProviderMode::OfficialApi, backend.clone(), cipher, 30_000);

        let mut request = turn("Hello");
        request.api_key_override = Some(encrypted);
        relay.relay(request, |_, _| {}).await;
        relay.relay(turn("Hello again"), |_, _| {}).await;

        let calls = backend.calls();
        assert_eq!(calls[0].api_key.as_deref(), Some("sk-user"));
        assert_eq!(calls[1].api_key.as_deref(), Some("sk-default"));
    }

    #[tokio::test]
    async fn test_undecryptable_key_fails_without_upstream_call() {
        let backend = Arc::new(MockBackend::new(["ok"]));
        let relay = relay_with(
            ProviderMode::OfficialApi,
            backend.clone(),
            Arc::new(AesGcmCipher::new("shared-secret")),
            30_000,
        );

        let mut request = turn("Hello");
        request.api_key_override = Some("not-a-ciphertext".to_string());
        let message = fail_message(relay.relay(request, |_, _| {}).await);

        assert!(message.contains("Invalid API key"));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_proxy_mode_ignores_override_key() {
        let backend = Arc::new(MockBackend::new(["ok"]));
        let relay = simple_relay(ProviderMode::UnofficialProxy, backend.clone());

        let mut request = turn("Hello");
        request.api_key_override = Some("sk-user".to_string());
        relay.relay(request, |_, _| {}).await;

        assert_eq!(backend.calls()[0].api_key, None);
    }
}

// =============================================================================
// Streaming and failure mapping
// =============================================================================

mod outcome_tests {
    use super::*;

    #[tokio::test]
    async fn test_partials_forwarded_in_order() {
        let backend = Arc::new(MockBackend::new(["Hel", "lo", " there"]));
        let relay = simple_relay(ProviderMode::OfficialApi, backend);

        let mut seen = Vec::new();
        let outcome = relay
            .relay(turn("Hello"), |partial: &ChatMessage, _| seen.push(partial.text.clone()))
            .await;

        assert_eq!(seen, vec!["Hel", "Hello", "Hello there"]);
        match outcome {
            RelayOutcome::Success(message) => assert_eq!(message.text, "Hello there"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_known_statuses_map_to_fixed_messages() {
        for status in [401u16, 403, 500, 502, 503, 504] {
            let backend = Arc::new(MockBackend::new(Vec::<String>::new()).failing(
                UpstreamError::Http {
                    status,
                    message: "raw upstream text".to_string(),
                },
            ));
            let relay = simple_relay(ProviderMode::OfficialApi, backend);

            let message = fail_message(relay.relay(turn("Hello"), |_, _| {}).await);
            assert_eq!(Some(message.as_str()), status_message(status), "status {status}");
        }
    }

    #[tokio::test]
    async fn test_unknown_error_passes_message_through() {
        let backend = Arc::new(
            MockBackend::new(Vec::<String>::new())
                .failing(UpstreamError::Network("connection reset".to_string())),
        );
        let relay = simple_relay(ProviderMode::UnofficialProxy, backend);

        let message = fail_message(relay.relay(turn("Hello"), |_, _| {}).await);
        assert_eq!(message, "Network error: connection reset");
    }
}

// =============================================================================
// Watchdog wiring
// =============================================================================

mod timeout_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_hanging_upstream_times_out() {
        let backend = Arc::new(MockBackend::new(["partial"]).hanging());
        let relay = relay_with(
            ProviderMode::OfficialApi,
            backend.clone(),
            Arc::new(PassthroughCipher),
            1_000,
        );

        let started = tokio::time::Instant::now();
        let seen = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&seen);
        let outcome = relay
            .relay(turn("Hello"), move |_, _| *counter.lock().unwrap() += 1)
            .await;
        let elapsed = started.elapsed();

        assert_eq!(
            fail_message(outcome),
            "[OpenAI] 请求超时 | Request timed out after 1000 ms"
        );
        assert!(elapsed >= Duration::from_millis(1_000), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1_100), "{elapsed:?}");
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_on_chunk_keeps_slow_stream_alive() {
        let chunks: Vec<String> = (0..8).map(|i| format!("c{i} ")).collect();
        let backend = Arc::new(MockBackend::new(chunks).with_delay(Duration::from_millis(600)));
        let relay = relay_with(
            ProviderMode::OfficialApi,
            backend.clone(),
            Arc::new(PassthroughCipher),
            1_000,
        );

        let outcome = relay
            .relay(turn("Hello"), |_, watchdog| {
                if let Some(watchdog) = watchdog {
                    watchdog.reset();
                }
            })
            .await;

        assert!(outcome.is_success(), "{outcome:?}");
        assert_eq!(backend.emitted(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_reset_stream_times_out_and_stops() {
        let chunks: Vec<String> = (0..8).map(|i| format!("c{i} ")).collect();
        let backend = Arc::new(MockBackend::new(chunks).with_delay(Duration::from_millis(600)));
        let relay = relay_with(
            ProviderMode::OfficialApi,
            backend.clone(),
            Arc::new(PassthroughCipher),
            1_000,
        );

        let mut seen = 0usize;
        let outcome = relay.relay(turn("Hello"), |_, _| seen += 1).await;

        assert!(fail_message(outcome).contains("timed out"));
        assert_eq!(seen, 1);
        assert_eq!(backend.emitted(), 1);
    }

    #[tokio::test]
    async fn test_zero_timeout_disables_watchdog() {
        let backend = Arc::new(MockBackend::new(["a", "b"]));
        let relay = relay_with(
            ProviderMode::OfficialApi,
            backend,
            Arc::new(PassthroughCipher),
            0,
        );
        assert!(relay.timeout().is_none());

        let mut handed_watchdog = false;
        relay
            .relay(turn("Hello"), |_, watchdog| handed_watchdog |= watchdog.is_some())
            .await;
        assert!(!handed_watchdog);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_is_not_reported_as_timeout() {
        let backend = Arc::new(MockBackend::new(Vec::<String>::new()).hanging());
        let relay = simple_relay(ProviderMode::OfficialApi, backend);

        let abort = CancellationToken::new();
        let trigger = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let message = fail_message(relay.relay_with_abort(turn("Hello"), abort, |_, _| {}).await);
        assert_eq!(message, "Request cancelled");
    }
}
