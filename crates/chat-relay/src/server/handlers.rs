//! Route handlers

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::response::Response;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::AppState;
use super::response::ApiResponse;
use super::stream::chat_process_response;
use crate::balance::BalanceReport;
use crate::provider::ProviderMode;
use crate::relay::ChatTurnRequest;

/// Body of `POST /chat-process`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatProcessRequest {
    pub prompt: String,
    #[serde(default)]
    pub options: Option<Map<String, Value>>,
    #[serde(default)]
    pub system_message: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl From<ChatProcessRequest> for ChatTurnRequest {
    fn from(request: ChatProcessRequest) -> Self {
        Self {
            message: request.prompt,
            last_context: request.options,
            system_message_key: request.system_message,
            api_key_override: request.api_key,
        }
    }
}

/// Body of `POST /config`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigRequest {
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Body of `POST /verify`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VerifyRequest {
    #[serde(default)]
    pub token: Option<String>,
}

/// `data` of the `/session` response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    pub auth: bool,
    pub model: ProviderMode,
    pub roles: Vec<String>,
}

/// Parse an optional JSON body; empty or malformed bodies yield the default
fn lenient_body<T: DeserializeOwned + Default>(body: &Bytes) -> T {
    if body.iter().all(u8::is_ascii_whitespace) {
        return T::default();
    }
    serde_json::from_slice(body).unwrap_or_else(|e| {
        tracing::debug!("Ignoring malformed request body: {e}");
        T::default()
    })
}

pub(super) async fn chat_process(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatProcessRequest>,
) -> Response {
    chat_process_response(state.relay.clone(), request.into())
}

pub(super) async fn config(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Json<ApiResponse<BalanceReport>> {
    let request: ConfigRequest = lenient_body(&body);
    let report = state.balance.get_config(request.api_key.as_deref()).await;
    Json(ApiResponse::success(report))
}

pub(super) async fn session(State(state): State<Arc<AppState>>) -> Json<ApiResponse<SessionData>> {
    Json(ApiResponse::success(SessionData {
        auth: state.auth_secret_key.is_some(),
        model: state.relay.provider().mode(),
        roles: state.personas.list_keys(),
    }))
}

pub(super) async fn verify(State(state): State<Arc<AppState>>, body: Bytes) -> Json<ApiResponse<()>> {
    let request: VerifyRequest = lenient_body(&body);
    let token = request.token.unwrap_or_default();

    let response = if token.is_empty() {
        ApiResponse::fail("Secret key is empty")
    } else if state.auth_secret_key.as_deref() != Some(token.as_str()) {
        ApiResponse::fail("密钥无效 | Secret key is invalid")
    } else {
        ApiResponse::ok("Verify successfully")
    };
    Json(response)
}

/// Health check endpoint - returns JSON status
pub(super) async fn health() -> Json<Value> {
    Json(serde_json::json!({"status": "ok"}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_process_request_maps_to_turn() {
        let request: ChatProcessRequest = serde_json::from_value(serde_json::json!({
            "prompt": "Hello",
            "options": {"parentMessageId": "p1"},
            "systemMessage": "translator",
            "apiKey": "enc"
        }))
        .unwrap();

        let turn = ChatTurnRequest::from(request);
        assert_eq!(turn.message, "Hello");
        assert_eq!(turn.system_message_key.as_deref(), Some("translator"));
        assert_eq!(turn.api_key_override.as_deref(), Some("enc"));
        assert_eq!(
            turn.last_context.unwrap().get("parentMessageId"),
            Some(&Value::from("p1"))
        );
    }

    #[test]
    fn test_lenient_body() {
        let empty: ConfigRequest = lenient_body(&Bytes::new());
        assert!(empty.api_key.is_none());

        let garbage: VerifyRequest = lenient_body(&Bytes::from_static(b"{not json"));
        assert!(garbage.token.is_none());

        let parsed: VerifyRequest = lenient_body(&Bytes::from_static(br#"{"token":"abc"}"#));
        assert_eq!(parsed.token.as_deref(), Some("abc"));
    }
}
