//! Balance/config reporter
//!
//! Assembles the diagnostic snapshot served by `/config`, including the account
//! balance read from the provider's billing endpoints. The lookup never fails:
//! any problem is reported as `"-"`.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{Config, non_blank};
use crate::crypto::KeyCipher;
use crate::provider::{Provider, ProviderMode};
use crate::upstream::{UpstreamError, http_error};

/// Placeholder for unknown or unset values
pub const UNAVAILABLE: &str = "-";

/// Days of usage history included in the balance computation
const USAGE_WINDOW_DAYS: i64 = 90;

/// Upper bound on both billing requests together
pub const BALANCE_LOOKUP_TIMEOUT: StdDuration = StdDuration::from_secs(10);

/// Snapshot returned by `/config`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceReport {
    #[serde(rename = "apiModel")]
    pub provider_mode: ProviderMode,
    #[serde(rename = "reverseProxy")]
    pub reverse_proxy_url: String,
    #[serde(rename = "timeoutMs")]
    pub timeout_ms: u64,
    #[serde(rename = "socksProxy")]
    pub socks_proxy_addr: String,
    #[serde(rename = "httpsProxy")]
    pub https_proxy_addr: String,
    #[serde(rename = "balance")]
    pub remaining_balance: String,
}

#[derive(Debug, Deserialize)]
struct Subscription {
    hard_limit_usd: f64,
}

#[derive(Debug, Deserialize)]
struct Usage {
    /// Cents
    total_usage: f64,
}

/// Builds [`BalanceReport`]s from the startup configuration
#[derive(Clone)]
pub struct BalanceReporter {
    provider: Arc<Provider>,
    cipher: Arc<dyn KeyCipher>,
    reverse_proxy_url: Option<String>,
    timeout_ms: u64,
    socks_proxy_addr: Option<String>,
    https_proxy_addr: Option<String>,
}

impl BalanceReporter {
    pub fn new(config: &Config, provider: Arc<Provider>, cipher: Arc<dyn KeyCipher>) -> Self {
        Self {
            provider,
            cipher,
            reverse_proxy_url: non_blank(&config.provider.reverse_proxy_url).map(str::to_string),
            timeout_ms: config.provider.timeout_ms,
            socks_proxy_addr: config.egress.socks_addr(),
            https_proxy_addr: config.egress.https_proxy_url(),
        }
    }

    /// Assemble a fresh report; the balance is looked up on every call
    pub async fn get_config(&self, api_key_override: Option<&str>) -> BalanceReport {
        let api_key = match api_key_override.filter(|k| !k.trim().is_empty()) {
            Some(cipher_text) => match self.cipher.decrypt(cipher_text) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!(error_message = %e, "Failed to decrypt client API key for balance lookup");
                    None
                }
            },
            None => self.provider.default_api_key().map(str::to_string),
        };

        let remaining_balance = fetch_balance(
            self.provider.http(),
            self.provider.api_root(),
            api_key.as_deref(),
        )
        .await;

        BalanceReport {
            provider_mode: self.provider.mode(),
            reverse_proxy_url: or_unavailable(self.reverse_proxy_url.as_deref()),
            timeout_ms: self.timeout_ms,
            socks_proxy_addr: or_unavailable(self.socks_proxy_addr.as_deref()),
            https_proxy_addr: or_unavailable(self.https_proxy_addr.as_deref()),
            remaining_balance,
        }
    }
}

fn or_unavailable(value: Option<&str>) -> String {
    value.unwrap_or(UNAVAILABLE).to_string()
}

/// Remaining balance formatted to three decimals, or `"-"` on any failure
pub async fn fetch_balance(http: &Client, api_root: &str, api_key: Option<&str>) -> String {
    fetch_balance_within(http, api_root, api_key, BALANCE_LOOKUP_TIMEOUT).await
}

/// [`fetch_balance`] with an explicit deadline; a stalled endpoint yields `"-"`
pub async fn fetch_balance_within(
    http: &Client,
    api_root: &str,
    api_key: Option<&str>,
    limit: StdDuration,
) -> String {
    let Some(api_key) = api_key.filter(|k| !k.trim().is_empty()) else {
        debug!("No API key available for balance lookup");
        return UNAVAILABLE.to_string();
    };

    let lookup = try_fetch_balance(http, api_root, api_key, Utc::now());
    match tokio::time::timeout(limit, lookup).await {
        Ok(Ok(remaining)) => format!("{remaining:.3}"),
        Ok(Err(e)) => {
            warn!(error_message = %e, "Balance lookup failed");
            UNAVAILABLE.to_string()
        }
        Err(_) => {
            warn!(timeout_ms = limit.as_millis() as u64, "Balance lookup timed out");
            UNAVAILABLE.to_string()
        }
    }
}

/// `(start_date, end_date)` of the usage query: 90 days back to one day ahead
pub fn billing_window(now: DateTime<Utc>) -> (String, String) {
    let start = now - Duration::days(USAGE_WINDOW_DAYS);
    let end = now + Duration::days(1);
    (
        start.format("%Y-%m-%d").to_string(),
        end.format("%Y-%m-%d").to_string(),
    )
}

async fn try_fetch_balance(
    http: &Client,
    api_root: &str,
    api_key: &str,
    now: DateTime<Utc>,
) -> Result<f64, UpstreamError> {
    let root = api_root.trim_end_matches('/');
    let (start_date, end_date) = billing_window(now);

    let response = http
        .get(format!("{root}/v1/dashboard/billing/subscription"))
        .bearer_auth(api_key)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(http_error("OpenAI", response).await);
    }
    let subscription: Subscription = response
        .json()
        .await
        .map_err(|e| UpstreamError::Parse(e.to_string()))?;

    let response = http
        .get(format!("{root}/v1/dashboard/billing/usage"))
        .query(&[("start_date", &start_date), ("end_date", &end_date)])
        .bearer_auth(api_key)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(http_error("OpenAI", response).await);
    }
    let usage: Usage = response
        .json()
        .await
        .map_err(|e| UpstreamError::Parse(e.to_string()))?;

    Ok(subscription.hard_limit_usd - usage.total_usage / 100.0)
}
