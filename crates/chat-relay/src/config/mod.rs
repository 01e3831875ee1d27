use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{RelayError, Result};

/// Main configuration structure for the relay
///
/// Values come from an optional TOML file and are then overridden by
/// environment variables (see [`Config::apply_env`]).
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// HTTP listener configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Upstream chat provider credentials and tuning
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Outbound proxy configuration for upstream traffic
    #[serde(default)]
    pub egress: EgressConfig,
}

/// HTTP listener configuration
#[derive(Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "0.0.0.0:3002")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Shared secret checked by `/verify`; `/session` reports whether one is set
    #[serde(default)]
    pub auth_secret_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            auth_secret_key: None,
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("listen_addr", &self.listen_addr)
            .field("auth_secret_key", &self.auth_secret_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:3002".to_string()
}

/// Upstream chat provider configuration
#[derive(Clone, Deserialize)]
pub struct ProviderConfig {
    /// Official API key; selects the official API mode when present
    #[serde(default)]
    pub api_key: Option<String>,
    /// Session access token; selects the reverse-proxy mode when no API key is set
    #[serde(default)]
    pub access_token: Option<String>,
    /// Base URL override for the official API (without the `/v1` suffix)
    #[serde(default)]
    pub api_base_url: Option<String>,
    /// Model override
    #[serde(default)]
    pub api_model: Option<String>,
    /// Conversation endpoint of the reverse proxy
    #[serde(default)]
    pub reverse_proxy_url: Option<String>,
    /// Watchdog window in milliseconds; 0 disables the timeout
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Suppress upstream payload traces
    #[serde(default)]
    pub disable_debug: bool,
    /// Secret for decrypting per-request API keys; unset means keys arrive in plaintext
    #[serde(default)]
    pub crypto_secret: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            access_token: None,
            api_base_url: None,
            api_model: None,
            reverse_proxy_url: None,
            timeout_ms: default_timeout_ms(),
            disable_debug: false,
            crypto_secret: None,
        }
    }
}

// Credentials are redacted from debug output.
impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("api_base_url", &self.api_base_url)
            .field("api_model", &self.api_model)
            .field("reverse_proxy_url", &self.reverse_proxy_url)
            .field("timeout_ms", &self.timeout_ms)
            .field("disable_debug", &self.disable_debug)
            .field("crypto_secret", &self.crypto_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// Outbound proxy configuration
///
/// SOCKS takes precedence over an HTTP(S) proxy; at most one is used.
#[derive(Clone, Deserialize, Default)]
pub struct EgressConfig {
    #[serde(default)]
    pub socks_host: Option<String>,
    #[serde(default)]
    pub socks_port: Option<String>,
    #[serde(default)]
    pub socks_username: Option<String>,
    #[serde(default)]
    pub socks_password: Option<String>,
    #[serde(default)]
    pub https_proxy: Option<String>,
    #[serde(default)]
    pub all_proxy: Option<String>,
}

impl EgressConfig {
    /// `host:port` of the SOCKS proxy when both parts are configured
    pub fn socks_addr(&self) -> Option<String> {
        match (non_blank(&self.socks_host), non_blank(&self.socks_port)) {
            (Some(host), Some(port)) => Some(format!("{host}:{port}")),
            _ => None,
        }
    }

    /// HTTP(S) proxy URL, preferring `HTTPS_PROXY` over `ALL_PROXY`
    pub fn https_proxy_url(&self) -> Option<String> {
        non_blank(&self.https_proxy)
            .or_else(|| non_blank(&self.all_proxy))
            .map(str::to_string)
    }
}

impl std::fmt::Debug for EgressConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EgressConfig")
            .field("socks_addr", &self.socks_addr())
            .field("socks_username", &self.socks_username)
            .field("socks_password", &self.socks_password.as_ref().map(|_| "<redacted>"))
            .field("https_proxy", &self.https_proxy_url())
            .finish()
    }
}

impl Config {
    /// Load configuration: TOML file (explicit path or default locations), then environment
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = match config_path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_paths().into_iter().find(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => {
                    tracing::info!("No config file found, using defaults");
                    Self::default()
                }
            },
        };

        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Parse a TOML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        tracing::info!("Loading config from: {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        toml::from_str(&content)
            .map_err(|e| RelayError::Config(format!("Failed to parse config: {e}")))
    }

    /// Override fields from environment-style variables
    ///
    /// Blank values count as unset. `lookup` is injectable so tests do not
    /// have to mutate the process environment.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let set = |slot: &mut Option<String>, name: &str| {
            if let Some(value) = var(name) {
                *slot = Some(value);
            }
        };

        set(&mut self.server.auth_secret_key, "AUTH_SECRET_KEY");
        if let Some(addr) = var("LISTEN_ADDR") {
            self.server.listen_addr = addr;
        }

        set(&mut self.provider.api_key, "OPENAI_API_KEY");
        set(&mut self.provider.access_token, "OPENAI_ACCESS_TOKEN");
        set(&mut self.provider.api_base_url, "OPENAI_API_BASE_URL");
        set(&mut self.provider.api_model, "OPENAI_API_MODEL");
        set(&mut self.provider.reverse_proxy_url, "API_REVERSE_PROXY");
        set(&mut self.provider.crypto_secret, "CRYPTO_SECRET");
        if let Some(raw) = var("TIMEOUT_MS") {
            self.provider.timeout_ms = parse_timeout_ms(&raw);
        }
        if let Some(flag) = var("OPENAI_API_DISABLE_DEBUG") {
            self.provider.disable_debug = flag.trim() == "true";
        }

        set(&mut self.egress.socks_host, "SOCKS_PROXY_HOST");
        set(&mut self.egress.socks_port, "SOCKS_PROXY_PORT");
        set(&mut self.egress.socks_username, "SOCKS_PROXY_USERNAME");
        set(&mut self.egress.socks_password, "SOCKS_PROXY_PASSWORD");
        set(&mut self.egress.https_proxy, "HTTPS_PROXY");
        set(&mut self.egress.all_proxy, "ALL_PROXY");
    }
}

fn default_config_paths() -> Vec<PathBuf> {
    [
        Some(PathBuf::from("config.toml")),
        dirs::config_dir().map(|c| c.join("chat-relay").join("config.toml")),
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// Parse a millisecond timeout; non-numeric input keeps the default, negatives disable it
fn parse_timeout_ms(raw: &str) -> u64 {
    match raw.trim().parse::<f64>() {
        Ok(ms) if ms.is_finite() && ms > 0.0 => ms as u64,
        Ok(ms) if ms.is_finite() => 0,
        _ => default_timeout_ms(),
    }
}

/// Borrow a non-blank optional string
pub fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}
