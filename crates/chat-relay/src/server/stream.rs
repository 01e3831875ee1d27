//! Streaming response writer for `/chat-process`
//!
//! The relay runs in its own task and pushes each partial result through an
//! unbounded channel; the response body drains that channel. Lines are JSON
//! documents separated by `\n` with no leading newline. Dropping the body
//! (client gone) cancels the turn through a [`DropGuard`], and a failed write
//! force-expires the watchdog. The sender is owned by the writer alone, so the
//! response ends exactly once, when the relay task finishes.

use std::convert::Infallible;

use axum::body::Body;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use super::response::ApiResponse;
use crate::relay::{ChatRelay, ChatTurnRequest, RelayOutcome};
use crate::upstream::ChatMessage;
use crate::watchdog::Watchdog;

pub const CONTENT_TYPE_NDJSON: &str = "application/octet-stream";

/// Start relaying `request` and return the streaming response
pub fn chat_process_response(relay: ChatRelay, request: ChatTurnRequest) -> Response {
    let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
    let abort = CancellationToken::new();
    let guard: DropGuard = abort.clone().drop_guard();

    tokio::spawn(run_turn(relay, request, ChunkWriter::new(tx), abort));

    let body = UnboundedReceiverStream::new(rx).map(move |chunk| {
        let _disconnect = &guard;
        Ok::<_, Infallible>(chunk)
    });

    (
        [(header::CONTENT_TYPE, CONTENT_TYPE_NDJSON)],
        Body::from_stream(body),
    )
        .into_response()
}

/// Final line written when a turn fails
pub fn error_chunk(message: &str) -> Value {
    let envelope = serde_json::to_string(&ApiResponse::<()>::fail(message)).unwrap_or_default();
    json!({
        "role": "assistant",
        "error": envelope,
        "choices": [{ "delta": {}, "index": 0, "finish_reason": "error" }],
    })
}

async fn run_turn(
    relay: ChatRelay,
    request: ChatTurnRequest,
    mut writer: ChunkWriter,
    abort: CancellationToken,
) {
    let outcome = relay
        .relay_with_abort(request, abort.clone(), |partial, watchdog| {
            writer.on_progress(partial, watchdog, &abort)
        })
        .await;

    let client_gone = abort.is_cancelled() || writer.is_closed();
    match outcome {
        RelayOutcome::Success(_) => {
            debug!(chunks = writer.written(), "Chat stream complete");
        }
        RelayOutcome::Fail { message } if client_gone => {
            info!(chunks = writer.written(), "Client disconnected, dropping failure: {message}");
        }
        RelayOutcome::Fail { message } => {
            writer.write_line(&error_chunk(&message));
        }
    }

    writer.finish();
}

/// Frames lines onto the response channel
struct ChunkWriter {
    tx: Option<UnboundedSender<Bytes>>,
    first: bool,
    written: usize,
    /// Watchdog handed over by the relay with the first chunk
    watchdog: Option<Watchdog>,
}

impl ChunkWriter {
    fn new(tx: UnboundedSender<Bytes>) -> Self {
        Self {
            tx: Some(tx),
            first: true,
            written: 0,
            watchdog: None,
        }
    }

    fn on_progress(
        &mut self,
        partial: &ChatMessage,
        watchdog: Option<&Watchdog>,
        abort: &CancellationToken,
    ) {
        if let Some(watchdog) = watchdog {
            watchdog.reset();
            if self.watchdog.is_none() {
                self.watchdog = Some(watchdog.clone());
            }
        }

        if !self.write_line(partial) {
            self.disconnect(abort);
        }
    }

    /// Write one JSON line; returns `false` once the client is gone
    fn write_line<T: Serialize>(&mut self, value: &T) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };

        let json = match serde_json::to_string(value) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to encode chat chunk: {e}");
                return true;
            }
        };
        let line = if self.first { json } else { format!("\n{json}") };

        if tx.send(Bytes::from(line)).is_err() {
            self.tx = None;
            return false;
        }
        self.first = false;
        self.written += 1;
        true
    }

    fn disconnect(&mut self, abort: &CancellationToken) {
        info!(chunks = self.written, "Client disconnected, cancelling upstream call");
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.time_out();
        }
        abort.cancel();
    }

    fn is_closed(&self) -> bool {
        self.tx.as_ref().is_none_or(UnboundedSender::is_closed)
    }

    fn written(&self) -> usize {
        self.written
    }

    /// Close the response
    fn finish(mut self) {
        self.tx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(text: &str) -> ChatMessage {
        ChatMessage {
            id: "m1".to_string(),
            text: text.to_string(),
            ..Default::default()
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> String {
        let mut out = String::new();
        while let Ok(bytes) = rx.try_recv() {
            out.push_str(std::str::from_utf8(&bytes).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_lines_are_newline_separated_without_leading_newline() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut writer = ChunkWriter::new(tx);
        let abort = CancellationToken::new();

        writer.on_progress(&message("a"), None, &abort);
        writer.on_progress(&message("ab"), None, &abort);
        writer.finish();

        let body = drain(&mut rx);
        assert!(!body.starts_with('\n'));
        let lines: Vec<&str> = body.split('\n').collect();
        assert_eq!(lines.len(), 2);
        let second: ChatMessage = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.text, "ab");
        assert!(!abort.is_cancelled());
    }

    #[tokio::test]
    async fn test_closed_receiver_cancels_and_expires_watchdog() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut writer = ChunkWriter::new(tx);
        let abort = CancellationToken::new();
        let watchdog = Watchdog::new(std::time::Duration::from_secs(30));
        watchdog.set_on_timeout(|| {});

        writer.on_progress(&message("a"), Some(&watchdog), &abort);
        assert!(watchdog.is_active());
        drop(rx);

        writer.on_progress(&message("ab"), Some(&watchdog), &abort);
        assert!(abort.is_cancelled());
        assert!(watchdog.has_fired());
        assert!(!watchdog.is_active());
        assert!(writer.is_closed());
        assert_eq!(writer.written(), 1);
    }

    #[test]
    fn test_error_chunk_shape() {
        let chunk = error_chunk("boom");
        assert_eq!(chunk["role"], "assistant");
        assert_eq!(chunk["choices"][0]["finish_reason"], "error");
        assert_eq!(chunk["choices"][0]["index"], 0);
        assert_eq!(chunk["choices"][0]["delta"], json!({}));

        let envelope: Value = serde_json::from_str(chunk["error"].as_str().unwrap()).unwrap();
        assert_eq!(envelope, json!({"status": "Fail", "message": "boom", "data": null}));
    }
}
