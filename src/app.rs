use crate::auth::AuthState;
use crate::config::{
    CREDENTIAL_COMMAND_TIMEOUT, CREDENTIAL_TTL, DEFAULT_API_BASE, DEFAULT_PORT,
    DEFAULT_PROXY_API_KEY, DEFAULT_TOKEN_COMMAND, ModelMapEntry, UPSTREAM_CONNECT_TIMEOUT,
    UpstreamTimeouts, default_model_map, parse_command, parse_model_map,
};
use crate::credentials::{CommandCredentialSource, CredentialCache, CredentialSource};
use crate::error::{AppError, AppResult};
use crate::model_registry::ModelRegistry;
use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, Once, OnceLock};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub auth: AuthState,
    pub models: ModelRegistry,
    pub credentials: CredentialCache,
    pub http: reqwest::Client,
    pub metrics: PrometheusHandle,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub api_key: String,
    pub api_base: String,
    pub token_command: String,
    pub model_map: Vec<ModelMapEntry>,
    pub metrics_path: String,
    pub timeouts: UpstreamTimeouts,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{DEFAULT_PORT}"),
            api_key: DEFAULT_PROXY_API_KEY.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            token_command: DEFAULT_TOKEN_COMMAND.to_string(),
            model_map: default_model_map(),
            metrics_path: "/metrics".to_string(),
            timeouts: UpstreamTimeouts::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> AppResult<Self> {
        let defaults = Self::default();
        let listen = env_non_empty("GATEWAY_LISTEN").unwrap_or_else(|| {
            let port = env_non_empty("PORT")
                .and_then(|v| v.parse::<u16>().ok())
                .unwrap_or(DEFAULT_PORT);
            format!("0.0.0.0:{port}")
        });
        let model_map = match env_non_empty("GATEWAY_MODEL_MAP") {
            Some(raw) => parse_model_map(&raw).map_err(|err| {
                AppError::new(StatusCode::BAD_REQUEST, "model_map_invalid", err)
            })?,
            None => defaults.model_map,
        };
        Ok(Self {
            listen,
            api_key: env_non_empty("PROXY_API_KEY").unwrap_or(defaults.api_key),
            api_base: env_non_empty("COPILOT_API_BASE").unwrap_or(defaults.api_base),
            token_command: env_non_empty("GATEWAY_TOKEN_COMMAND")
                .unwrap_or(defaults.token_command),
            model_map,
            metrics_path: env_non_empty("GATEWAY_METRICS_PATH").unwrap_or(defaults.metrics_path),
            timeouts: defaults.timeouts,
        })
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()?).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let (program, args) = parse_command(&runtime.token_command).ok_or_else(|| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "token_command_invalid",
            "credential command is empty",
        )
    })?;
    let source = CommandCredentialSource::new(program, args, CREDENTIAL_COMMAND_TIMEOUT);
    load_state_with_credentials(runtime, Arc::new(source)).await
}

pub async fn load_state_with_credentials(
    runtime: RuntimeConfig,
    source: Arc<dyn CredentialSource>,
) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("copilot-gateway/0.1")
        .connect_timeout(UPSTREAM_CONNECT_TIMEOUT)
        .build()
        .map_err(|err| {
            AppError::new(
                StatusCode::BAD_REQUEST,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;
    let metrics = init_metrics()?;

    Ok(AppState {
        auth: AuthState::new(&runtime.api_key),
        models: ModelRegistry::new(runtime.model_map.clone()),
        credentials: CredentialCache::new(source, CREDENTIAL_TTL),
        http,
        metrics,
        runtime: Arc::new(runtime),
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    StatusCode::BAD_REQUEST,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true);
    Router::<AppState>::new()
        .route("/", get(crate::handlers::root))
        .route("/health", get(crate::handlers::health))
        .route("/v1/models", get(crate::handlers::list_models))
        .route(
            "/v1/chat/completions",
            post(crate::handlers::create_chat_completions),
        )
        .route(&metrics_path, get(crate::handlers::render_metrics))
        .with_state(state)
        .layer(cors)
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(TraceLayer::new_for_http())
}
