use crate::app::AppState;
use crate::error::{AppError, AppResult};
use crate::model_registry::merge_model_listing;
use crate::stream::{stream_response, truncate};
use crate::upstream::{self, UpstreamCallError, build_chat_payload};
use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde_json::{Value, json};

pub async fn root() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "Copilot OpenAI Gateway is running"
    }))
}

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

pub async fn render_metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn list_models(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Response> {
    state.auth.authorize(&headers)?;
    let token = state.credentials.get_token().await?;
    let timeouts = state.runtime.timeouts;
    let catalog =
        upstream::fetch_models(&state.http, &state.runtime.api_base, &token, timeouts.models)
            .await
            .map_err(|err| {
                log_upstream_error("models", &err);
                AppError::from(err)
            })?;
    let data = merge_model_listing(&state.models, &catalog);
    Ok(Json(json!({ "object": "list", "data": data })).into_response())
}

pub async fn create_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    raw_body: Bytes,
) -> AppResult<Response> {
    state.auth.authorize(&headers)?;
    let body: Value = serde_json::from_slice(&raw_body).map_err(|err| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "invalid_json",
            format!("request body is not valid json: {err}"),
        )
    })?;
    tracing::debug!(
        body = %truncate(&body.to_string(), 500),
        "incoming chat completion request"
    );
    let obj = body.as_object().ok_or_else(|| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "body must be object",
        )
    })?;
    let token = state.credentials.get_token().await?;
    let model = obj.get("model").and_then(|v| v.as_str()).unwrap_or("");
    let stream = obj.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
    let upstream_model = state.models.resolve(model);
    let payload = build_chat_payload(obj, upstream_model, stream);
    tracing::debug!(model, upstream_model, stream, "forwarding chat completion");
    metrics::counter!(
        "gateway_chat_requests_total",
        "stream" => if stream { "true" } else { "false" }
    )
    .increment(1);

    let timeouts = state.runtime.timeouts;
    if stream {
        let upstream_resp = upstream::open_chat_stream(
            &state.http,
            &state.runtime.api_base,
            &token,
            &payload,
            timeouts.chat_stream,
        )
        .await
        .map_err(|err| {
            log_upstream_error("chat_stream", &err);
            AppError::from(err)
        })?;
        return Ok(stream_response(upstream_resp, timeouts.chat_stream));
    }

    match upstream::call_chat_completions(
        &state.http,
        &state.runtime.api_base,
        &token,
        &payload,
        timeouts.chat,
    )
    .await
    {
        Ok(value) => Ok(Json(value).into_response()),
        Err(err) => {
            log_upstream_error("chat", &err);
            if err.is_policy_rejection() {
                return Err(AppError::model_not_enabled(model));
            }
            Err(err.into())
        }
    }
}

fn log_upstream_error(route: &'static str, err: &UpstreamCallError) {
    metrics::counter!("gateway_upstream_errors_total", "kind" => route).increment(1);
    tracing::warn!(
        route,
        status = ?err.status,
        body = %truncate(&err.message, 500),
        "upstream call failed"
    );
}
