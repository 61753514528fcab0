//! Re-encodes an upstream chat-completion SSE stream into OpenAI-compatible
//! frames.
//!
//! Upstream chunks lack the `object` discriminator OpenAI clients key on, so
//! every JSON `data:` line gets `"object": "chat.completion.chunk"` when it is
//! missing. Lines that do not parse are forwarded untouched. The caller
//! always sees exactly one `data: [DONE]` frame at the end of a successful
//! stream, whether or not upstream sent its own.

use crate::upstream::read_text;
use axum::body::Body;
use axum::http::StatusCode;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub const DONE_FRAME: &str = "data: [DONE]\n\n";
pub const CHUNK_OBJECT: &str = "chat.completion.chunk";
/// Frames the pump may hold ahead of a slow caller.
pub const STREAM_READ_AHEAD: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EncoderState {
    Streaming,
    Closed,
}

enum LineKind<'a> {
    Done,
    Data(&'a str),
    Other,
}

fn classify(line: &str) -> LineKind<'_> {
    let Some(rest) = line.strip_prefix("data:") else {
        return LineKind::Other;
    };
    let payload = rest.strip_prefix(' ').unwrap_or(rest);
    if payload.trim() == "[DONE]" {
        LineKind::Done
    } else {
        LineKind::Data(payload)
    }
}

/// Outcome of trying to patch one `data:` payload.
#[derive(Debug, PartialEq)]
pub enum ChunkRewrite {
    /// Parsed as a JSON object; carries the re-serialized chunk.
    Patched(String),
    /// Not a JSON object; the original line goes out unchanged.
    Raw,
}

pub fn rewrite_chunk(payload: &str) -> ChunkRewrite {
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(mut obj)) => {
            if !obj.contains_key("object") {
                obj.insert("object".to_string(), Value::String(CHUNK_OBJECT.to_string()));
            }
            ChunkRewrite::Patched(Value::Object(obj).to_string())
        }
        Ok(_) | Err(_) => ChunkRewrite::Raw,
    }
}

/// Per-request state machine turning upstream lines into output frames.
pub struct ChunkEncoder {
    state: EncoderState,
    sentinel_sent: bool,
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkEncoder {
    pub fn new() -> Self {
        Self {
            state: EncoderState::Streaming,
            sentinel_sent: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == EncoderState::Closed
    }

    /// Frame for one upstream line, or `None` for blank lines and anything
    /// arriving after the terminal sentinel.
    pub fn encode_line(&mut self, line: &str) -> Option<String> {
        if self.is_closed() {
            return None;
        }
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.trim().is_empty() {
            return None;
        }
        match classify(line) {
            LineKind::Done => {
                self.state = EncoderState::Closed;
                self.sentinel_sent = true;
                Some(DONE_FRAME.to_string())
            }
            LineKind::Data(payload) => match rewrite_chunk(payload) {
                ChunkRewrite::Patched(chunk) => Some(format!("data: {chunk}\n\n")),
                ChunkRewrite::Raw => Some(format!("{line}\n\n")),
            },
            LineKind::Other => Some(format!("{line}\n\n")),
        }
    }

    /// Closes the encoder, returning the terminal sentinel unless upstream's
    /// own was already forwarded.
    pub fn finish(&mut self) -> Option<String> {
        self.state = EncoderState::Closed;
        if self.sentinel_sent {
            return None;
        }
        self.sentinel_sent = true;
        Some(DONE_FRAME.to_string())
    }
}

/// Splits a byte stream into lines. Partial lines are buffered until the
/// next chunk completes them.
#[derive(Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                self.pending.clear();
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}

pub fn error_frame(status: StatusCode, body: &str) -> String {
    let payload = json!({
        "error": {
            "message": body,
            "status": status.as_u16(),
        }
    });
    format!("data: {payload}\n\n")
}

/// Wraps an upstream streaming response into a `text/event-stream` response.
/// Reading happens on a spawned task that stops as soon as the caller goes
/// away, dropping the upstream connection with it. `read_timeout` bounds each
/// wait for upstream bytes, not the length of the whole stream.
pub fn stream_response(upstream: reqwest::Response, read_timeout: Duration) -> Response {
    let (tx, rx) = mpsc::channel::<Bytes>(STREAM_READ_AHEAD);
    tokio::spawn(forward_upstream(upstream, tx, read_timeout));
    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/event-stream"), (CACHE_CONTROL, "no-cache")],
        body,
    )
        .into_response()
}

async fn forward_upstream(
    upstream: reqwest::Response,
    tx: mpsc::Sender<Bytes>,
    read_timeout: Duration,
) {
    let status = upstream.status();
    tracing::debug!(status = status.as_u16(), "upstream stream opened");
    if status != StatusCode::OK {
        let body = match read_text(upstream, read_timeout).await {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(
                    status = status.as_u16(),
                    error = %err,
                    "failed to read upstream stream error body"
                );
                err.message
            }
        };
        tracing::warn!(
            status = status.as_u16(),
            body = %truncate(&body, 500),
            "upstream stream rejected"
        );
        metrics::counter!("gateway_upstream_errors_total", "kind" => "stream_http").increment(1);
        let _ = tx.send(Bytes::from(error_frame(status, &body))).await;
        return;
    }
    pump_lines(upstream.bytes_stream(), &tx, read_timeout).await;
}

/// Drives one upstream body through a fresh [`ChunkEncoder`], sending frames
/// in arrival order. Returns early if the receiver is dropped.
///
/// A read error or a gap longer than `read_timeout` ends the stream with an
/// error frame ahead of the terminal sentinel, so a cut-off reply is never
/// mistaken for a complete one.
pub async fn pump_lines<S, E>(body: S, tx: &mpsc::Sender<Bytes>, read_timeout: Duration)
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let mut body = std::pin::pin!(body);
    let mut encoder = ChunkEncoder::new();
    let mut splitter = LineSplitter::default();
    let mut interrupted = None;

    'read: loop {
        let chunk = match tokio::time::timeout(read_timeout, body.next()).await {
            Ok(Some(Ok(chunk))) => chunk,
            Ok(Some(Err(err))) => {
                tracing::warn!("upstream stream read failed: {err}");
                metrics::counter!("gateway_upstream_errors_total", "kind" => "stream_read")
                    .increment(1);
                interrupted = Some(format!("upstream stream interrupted: {err}"));
                break;
            }
            Ok(None) => break,
            Err(_) => {
                tracing::warn!(
                    timeout_secs = read_timeout.as_secs_f32(),
                    "upstream stream went idle"
                );
                metrics::counter!("gateway_upstream_errors_total", "kind" => "stream_idle")
                    .increment(1);
                interrupted = Some(format!(
                    "upstream sent nothing for {}s",
                    read_timeout.as_secs_f32()
                ));
                break;
            }
        };
        for line in splitter.push(&chunk) {
            if let Some(frame) = encoder.encode_line(&line) {
                if tx.send(Bytes::from(frame)).await.is_err() {
                    tracing::debug!("client went away mid-stream");
                    return;
                }
            }
            if encoder.is_closed() {
                break 'read;
            }
        }
    }

    if let Some(rest) = splitter.finish() {
        if let Some(frame) = encoder.encode_line(&rest) {
            if tx.send(Bytes::from(frame)).await.is_err() {
                return;
            }
        }
    }
    if let Some(message) = interrupted {
        let frame = error_frame(StatusCode::BAD_GATEWAY, &message);
        if tx.send(Bytes::from(frame)).await.is_err() {
            return;
        }
    }
    if let Some(frame) = encoder.finish() {
        let _ = tx.send(Bytes::from(frame)).await;
    }
}

pub(crate) fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
