//! Provider client selection
//!
//! Runs once at startup, before the listener is bound, and picks exactly one
//! upstream strategy from the configured credentials. The resulting
//! [`Provider`] is immutable and shared by every request.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{Config, non_blank};
use crate::error::{RelayError, Result};
use crate::upstream::{
    ChatBackend, DEFAULT_REVERSE_PROXY_URL, DEFAULT_UNOFFICIAL_MODEL, OfficialApiClient,
    OfficialApiSettings, UnofficialProxyClient, UnofficialProxySettings, build_http_client,
};

pub const DEFAULT_API_ROOT: &str = "https://api.openai.com";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_MAX_MODEL_TOKENS: usize = 4000;
pub const DEFAULT_MAX_RESPONSE_TOKENS: usize = 1000;

/// Which upstream strategy is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderMode {
    #[serde(rename = "ChatGPTAPI")]
    OfficialApi,
    #[serde(rename = "ChatGPTUnofficialProxyAPI")]
    UnofficialProxy,
}

impl std::fmt::Display for ProviderMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderMode::OfficialApi => write!(f, "ChatGPTAPI"),
            ProviderMode::UnofficialProxy => write!(f, "ChatGPTUnofficialProxyAPI"),
        }
    }
}

/// Context/response token limits for a model name
///
/// 32k variants of gpt-4 get 32768/8192, other gpt-4 models 8192/2048,
/// everything else the provider defaults.
pub fn token_limits(model: &str) -> (usize, usize) {
    let model = model.to_lowercase();
    if model.contains("gpt-4") {
        if model.contains("32k") {
            (32768, 8192)
        } else {
            (8192, 2048)
        }
    } else {
        (DEFAULT_MAX_MODEL_TOKENS, DEFAULT_MAX_RESPONSE_TOKENS)
    }
}

/// The selected upstream client plus the process-wide defaults it was built with
pub struct Provider {
    mode: ProviderMode,
    backend: Arc<dyn ChatBackend>,
    http: reqwest::Client,
    default_api_key: Option<String>,
    api_root: String,
}

impl Provider {
    /// Assemble a provider around an existing backend
    pub fn new(
        mode: ProviderMode,
        backend: Arc<dyn ChatBackend>,
        http: reqwest::Client,
        default_api_key: Option<String>,
        api_root: impl Into<String>,
    ) -> Self {
        Self {
            mode,
            backend,
            http,
            default_api_key,
            api_root: api_root.into(),
        }
    }

    /// Choose and configure the upstream client from `config`
    ///
    /// API key → official API; else access token → reverse proxy; else a
    /// configuration error, and the process must not serve requests.
    pub fn select(config: &Config) -> Result<Self> {
        let provider = &config.provider;
        let http = build_http_client(&config.egress)?;
        let debug = !provider.disable_debug;
        let api_root = non_blank(&provider.api_base_url)
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_API_ROOT.to_string());

        if let Some(api_key) = non_blank(&provider.api_key) {
            let model = non_blank(&provider.api_model)
                .unwrap_or(DEFAULT_MODEL)
                .to_string();
            let (max_model_tokens, max_response_tokens) = token_limits(&model);

            tracing::info!(
                model = %model,
                max_model_tokens,
                max_response_tokens,
                base_url = %api_root,
                "Using official API mode"
            );

            let settings = OfficialApiSettings {
                api_key: api_key.to_string(),
                api_base_url: format!("{api_root}/v1"),
                model,
                max_model_tokens,
                max_response_tokens,
                debug,
            };

            return Ok(Self::new(
                ProviderMode::OfficialApi,
                Arc::new(OfficialApiClient::new(http.clone(), settings)),
                http,
                Some(api_key.to_string()),
                api_root,
            ));
        }

        if let Some(access_token) = non_blank(&provider.access_token) {
            let settings = UnofficialProxySettings {
                access_token: access_token.to_string(),
                reverse_proxy_url: non_blank(&provider.reverse_proxy_url)
                    .unwrap_or(DEFAULT_REVERSE_PROXY_URL)
                    .to_string(),
                model: non_blank(&provider.api_model)
                    .unwrap_or(DEFAULT_UNOFFICIAL_MODEL)
                    .to_string(),
                debug,
            };

            tracing::info!(
                model = %settings.model,
                reverse_proxy = %settings.reverse_proxy_url,
                "Using reverse proxy mode"
            );

            return Ok(Self::new(
                ProviderMode::UnofficialProxy,
                Arc::new(UnofficialProxyClient::new(http.clone(), settings)),
                http,
                None,
                api_root,
            ));
        }

        Err(RelayError::Config(
            "Missing OPENAI_API_KEY or OPENAI_ACCESS_TOKEN environment variable".to_string(),
        ))
    }

    pub fn mode(&self) -> ProviderMode {
        self.mode
    }

    pub fn backend(&self) -> &Arc<dyn ChatBackend> {
        &self.backend
    }

    /// Client carrying the configured egress proxy
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Process-wide API key (official mode only)
    pub fn default_api_key(&self) -> Option<&str> {
        self.default_api_key.as_deref()
    }

    /// API root without the `/v1` suffix
    pub fn api_root(&self) -> &str {
        &self.api_root
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("mode", &self.mode)
            .field("backend", &self.backend.name())
            .field("api_root", &self.api_root)
            .finish_non_exhaustive()
    }
}
