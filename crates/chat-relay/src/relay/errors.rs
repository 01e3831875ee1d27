//! User-facing failure messages

use std::time::Duration;

use crate::upstream::UpstreamError;

/// Shown when an error carries no usable message
pub const FALLBACK_ERROR_MESSAGE: &str = "Please check the back-end console";

/// Fixed bilingual message for well-known provider statuses
pub fn status_message(status: u16) -> Option<&'static str> {
    match status {
        401 => Some("[OpenAI] 提供错误的API密钥 | Incorrect API key provided"),
        403 => Some("[OpenAI] 服务器拒绝访问，请稍后再试 | Server refused to access, please try again later"),
        500 => Some("[OpenAI] 服务器繁忙，请稍后再试 | Internal Server Error"),
        502 => Some("[OpenAI] 错误的网关 | Bad Gateway"),
        503 => Some("[OpenAI] 服务器繁忙，请稍后再试 | Server is busy, please try again later"),
        504 => Some("[OpenAI] 网关超时 | Gateway Time-out"),
        _ => None,
    }
}

pub fn timeout_message(window: Duration) -> String {
    format!(
        "[OpenAI] 请求超时 | Request timed out after {} ms",
        window.as_millis()
    )
}

/// Map an upstream error to the message relayed to the client
///
/// `timed_out` carries the watchdog window when the watchdog cancelled the call.
pub fn failure_message(err: &UpstreamError, timed_out: Option<Duration>) -> String {
    if let Some(message) = err.status().and_then(status_message) {
        return message.to_string();
    }

    if let (UpstreamError::Cancelled, Some(window)) = (err, timed_out) {
        return timeout_message(window);
    }

    let message = err.to_string();
    if message.trim().is_empty() {
        FALLBACK_ERROR_MESSAGE.to_string()
    } else {
        message
    }
}
