use crate::error::{AppError, AppResult};
use crate::platforms::PlatformRegistry;
use crate::telemetry::TelemetrySink;
use axum::Router;
use axum::routing::post;
use std::sync::Arc;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Debug, Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub platforms: Arc<PlatformRegistry>,
    pub http: reqwest::Client,
    pub sink: TelemetrySink,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub log_dir: String,
    pub platforms_path: Option<String>,
    pub upstream_timeout_ms: u64,
    pub proxy_url: Option<String>,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let listen = env_or("PROMPTBENCH_LISTEN", "0.0.0.0:3000");
        let log_dir = env_or("PROMPTBENCH_LOG_DIR", "./logs");
        let platforms_path = non_blank_env("PROMPTBENCH_PLATFORMS");
        let upstream_timeout_ms = non_blank_env("PROMPTBENCH_UPSTREAM_TIMEOUT_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(300_000);
        // Egress proxy is wired into the shared client explicitly; no ambient
        // global dispatcher.
        let proxy_url = non_blank_env("HTTPS_PROXY");
        Self {
            listen,
            log_dir,
            platforms_path,
            upstream_timeout_ms,
            proxy_url,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    non_blank_env(key).unwrap_or_else(|| default.to_string())
}

fn non_blank_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env())
}

pub fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let platforms = match &runtime.platforms_path {
        Some(path) => PlatformRegistry::load(path).map_err(|err| {
            AppError::new(
                axum::http::StatusCode::BAD_REQUEST,
                "platforms_load_failed",
                err,
            )
        })?,
        None => PlatformRegistry::builtin(),
    };

    let mut builder = reqwest::Client::builder().user_agent("promptbench/0.1");
    if let Some(proxy_url) = &runtime.proxy_url {
        let proxy = reqwest::Proxy::all(proxy_url).map_err(|err| {
            AppError::new(
                axum::http::StatusCode::BAD_REQUEST,
                "proxy_invalid",
                err.to_string(),
            )
        })?;
        builder = builder.proxy(proxy);
        tracing::info!("egress proxy set to {proxy_url}");
    }
    let http = builder.build().map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "http_client_init_failed",
            err.to_string(),
        )
    })?;

    let sink = TelemetrySink::new(&runtime.log_dir);

    Ok(AppState {
        runtime: Arc::new(runtime),
        platforms: Arc::new(platforms),
        http,
        sink,
    })
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(crate::handlers::create_chat))
        .route("/api/log-batch", post(crate::handlers::log_batch))
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}
