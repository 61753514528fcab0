use crate::config::FORWARDED_CHAT_FIELDS;
use axum::http::StatusCode;
use futures_util::StreamExt;
use serde_json::{Map, Value};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Http,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            message,
        }
    }

    /// Upstream refused the model on policy or entitlement grounds.
    pub fn is_policy_rejection(&self) -> bool {
        self.kind == UpstreamErrorKind::Http
            && is_policy_rejection(self.status.unwrap_or(StatusCode::OK), &self.message)
    }
}

pub fn is_policy_rejection(status: StatusCode, body: &str) -> bool {
    status == StatusCode::FORBIDDEN || body.to_ascii_lowercase().contains("forbidden")
}

/// Builds the outbound chat payload: `model`, `messages` and `stream` are
/// always present, allow-listed optional fields are copied when the caller
/// sent them, everything else is dropped.
pub fn build_chat_payload(body: &Map<String, Value>, upstream_model: &str, stream: bool) -> Value {
    let mut payload = Map::new();
    payload.insert("model".to_string(), Value::String(upstream_model.to_string()));
    payload.insert(
        "messages".to_string(),
        body.get("messages")
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new())),
    );
    payload.insert("stream".to_string(), Value::Bool(stream));
    for key in FORWARDED_CHAT_FIELDS {
        if let Some(value) = body.get(key) {
            payload.insert(key.to_string(), value.clone());
        }
    }
    Value::Object(payload)
}

pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{path}")
    }
}

pub async fn call_chat_completions(
    client: &reqwest::Client,
    base_url: &str,
    token: &str,
    payload: &Value,
    timeout: Duration,
) -> Result<Value, UpstreamCallError> {
    let resp = post_json(client, base_url, "/chat/completions", token, payload, timeout).await?;
    read_json(resp, timeout).await
}

/// Opens a streaming chat completion. The response is returned whatever its
/// status; the stream re-encoder turns a non-200 into an error frame.
/// `timeout` only bounds the wait for response headers, body reads are
/// bounded one at a time by the re-encoder.
pub async fn open_chat_stream(
    client: &reqwest::Client,
    base_url: &str,
    token: &str,
    payload: &Value,
    timeout: Duration,
) -> Result<reqwest::Response, UpstreamCallError> {
    post_json(client, base_url, "/chat/completions", token, payload, timeout).await
}

pub async fn fetch_models(
    client: &reqwest::Client,
    base_url: &str,
    token: &str,
    timeout: Duration,
) -> Result<Value, UpstreamCallError> {
    let request = client.get(join_url(base_url, "/models")).bearer_auth(token);
    let resp = send_within(request, timeout).await?;
    read_json(resp, timeout).await
}

async fn post_json(
    client: &reqwest::Client,
    base_url: &str,
    path: &str,
    token: &str,
    payload: &Value,
    timeout: Duration,
) -> Result<reqwest::Response, UpstreamCallError> {
    let request = client
        .post(join_url(base_url, path))
        .bearer_auth(token)
        .json(payload);
    send_within(request, timeout).await
}

async fn send_within(
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<reqwest::Response, UpstreamCallError> {
    match tokio::time::timeout(timeout, request.send()).await {
        Ok(result) => result.map_err(network_error),
        Err(_) => Err(timed_out(None, timeout)),
    }
}

/// Reads a whole response body, allowing at most `read_timeout` between
/// consecutive chunks.
pub(crate) async fn read_text(
    resp: reqwest::Response,
    read_timeout: Duration,
) -> Result<String, UpstreamCallError> {
    let status = resp.status();
    let mut body = std::pin::pin!(resp.bytes_stream());
    let mut buf = Vec::new();
    loop {
        match tokio::time::timeout(read_timeout, body.next()).await {
            Ok(Some(Ok(chunk))) => buf.extend_from_slice(&chunk),
            Ok(Some(Err(err))) => {
                return Err(UpstreamCallError::new(
                    UpstreamErrorKind::Network,
                    Some(status),
                    err.to_string(),
                ));
            }
            Ok(None) => break,
            Err(_) => return Err(timed_out(Some(status), read_timeout)),
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

async fn read_json(resp: reqwest::Response, read_timeout: Duration) -> Result<Value, UpstreamCallError> {
    let status = resp.status();
    let text = read_text(resp, read_timeout).await?;
    if status != StatusCode::OK {
        return Err(UpstreamCallError::new(
            UpstreamErrorKind::Http,
            Some(status),
            text,
        ));
    }
    serde_json::from_str(&text).map_err(|err| {
        UpstreamCallError::new(
            UpstreamErrorKind::Http,
            Some(StatusCode::BAD_GATEWAY),
            format!("invalid upstream json: {err}"),
        )
    })
}

fn timed_out(status: Option<StatusCode>, timeout: Duration) -> UpstreamCallError {
    UpstreamCallError::new(
        UpstreamErrorKind::Network,
        status,
        format!("upstream did not respond within {}s", timeout.as_secs_f32()),
    )
}

fn network_error(err: reqwest::Error) -> UpstreamCallError {
    UpstreamCallError::new(UpstreamErrorKind::Network, None, err.to_string())
}
