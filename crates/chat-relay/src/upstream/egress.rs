//! Outbound HTTP client construction with optional proxy tunnelling

use std::time::Duration;

use reqwest::{Client, Proxy};
use url::Url;

use crate::config::{EgressConfig, non_blank};
use crate::error::{RelayError, Result};

/// Which proxy (if any) carries upstream traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EgressStrategy {
    Direct,
    Socks {
        host: String,
        port: String,
        username: Option<String>,
        password: Option<String>,
    },
    Https(String),
}

impl EgressStrategy {
    /// SOCKS wins when host and port are both set; otherwise HTTPS/ALL proxy; otherwise direct
    pub fn from_config(config: &EgressConfig) -> Self {
        if let (Some(host), Some(port)) = (non_blank(&config.socks_host), non_blank(&config.socks_port)) {
            return EgressStrategy::Socks {
                host: host.to_string(),
                port: port.to_string(),
                username: non_blank(&config.socks_username).map(str::to_string),
                password: non_blank(&config.socks_password).map(str::to_string),
            };
        }

        match config.https_proxy_url() {
            Some(url) => EgressStrategy::Https(url),
            None => EgressStrategy::Direct,
        }
    }

    /// Proxy URL handed to reqwest, with credentials percent-encoded
    pub fn proxy_url(&self) -> Result<Option<Url>> {
        match self {
            EgressStrategy::Direct => Ok(None),
            EgressStrategy::Socks {
                host,
                port,
                username,
                password,
            } => {
                // socks5h resolves hostnames on the proxy side.
                let mut url = Url::parse(&format!("socks5h://{host}:{port}"))
                    .map_err(|e| RelayError::Config(format!("Invalid SOCKS proxy address: {e}")))?;
                if let Some(username) = username {
                    url.set_username(username).map_err(|_| {
                        RelayError::Config("Invalid SOCKS proxy username".to_string())
                    })?;
                }
                if let Some(password) = password {
                    url.set_password(Some(password)).map_err(|_| {
                        RelayError::Config("Invalid SOCKS proxy password".to_string())
                    })?;
                }
                Ok(Some(url))
            }
            EgressStrategy::Https(raw) => Url::parse(raw)
                .map(Some)
                .map_err(|e| RelayError::Config(format!("Invalid HTTPS proxy URL '{raw}': {e}"))),
        }
    }
}

/// Build the HTTP client shared by every upstream call
///
/// No overall request timeout is set: streamed replies can legitimately run
/// long, and stalls are handled by the watchdog.
pub fn build_http_client(config: &EgressConfig) -> Result<Client> {
    let strategy = EgressStrategy::from_config(config);
    let mut builder = Client::builder().connect_timeout(Duration::from_secs(30));

    if let Some(url) = strategy.proxy_url()? {
        match &strategy {
            EgressStrategy::Socks { host, port, .. } => {
                tracing::info!("Routing upstream traffic through SOCKS proxy {host}:{port}");
            }
            _ => tracing::info!("Routing upstream traffic through HTTPS proxy"),
        }
        let proxy = Proxy::all(url.as_str())
            .map_err(|e| RelayError::Config(format!("Invalid proxy configuration: {e}")))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| RelayError::Config(format!("Failed to create HTTP client: {e}")))
}
