//! Read-only HTTP view of the runner: cache summary, queue and activity log.

use crate::cache::{KindSummary, VillageCache};
use axum::{
    extract::{Query, State},
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use farmhand_engine::{now_ms, Engine, TaskFilter};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, CorsLayer};

/// What the running loop last published about itself.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunnerStatus {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_village: Option<String>,
    pub cache_valid: bool,
    pub fields: Vec<KindSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cycle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at_ms: Option<i64>,
}

impl RunnerStatus {
    pub fn from_cache(cache: &VillageCache, active_village: Option<&str>, last_cycle: Option<&str>) -> Self {
        Self {
            running: true,
            active_village: active_village.map(str::to_string),
            cache_valid: cache.is_valid(),
            fields: cache.summary(),
            last_cycle: last_cycle.map(str::to_string),
            updated_at_ms: Some(now_ms()),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub runner: watch::Receiver<RunnerStatus>,
}

impl AppState {
    /// State for a server that runs without a loop behind it.
    pub fn detached(engine: Engine) -> Self {
        let (_, runner) = watch::channel(RunnerStatus::default());
        Self { engine, runner }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/tasks", get(tasks))
        .route("/api/logs", get(logs))
        .with_state(Arc::new(state))
        // Loopback and Tailscale peers only.
        .layer(middleware::from_fn(ip_allowlist))
        // The bot holds a logged-in game session; never answer arbitrary origins.
        .layer(local_only_cors())
}

struct ApiError(anyhow::Error);

impl<E: Into<anyhow::Error>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        tracing::error!(error = %format!("{:#}", self.0), "status request failed");
        (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn status(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, ApiError> {
    let runner = state.runner.borrow().clone();
    let rev = state.engine.get_rev()?;
    Ok(Json(json!({ "runner": runner, "rev": rev })))
}

#[derive(Debug, Deserialize)]
struct TaskQuery {
    #[serde(default)]
    village: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn tasks(
    State(state): State<Arc<AppState>>,
    Query(q): Query<TaskQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let filter = TaskFilter {
        village: q.village.filter(|v| !v.trim().is_empty()),
    };
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let builds = state.engine.pending_build_tasks(&filter, limit)?;
    let trainings = state.engine.pending_training_tasks(&filter, limit)?;
    Ok(Json(json!({ "builds": builds, "trainings": trainings })))
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    #[serde(default)]
    limit: Option<usize>,
}

async fn logs(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LogQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let entries = state.engine.recent_logs(q.limit.unwrap_or(100).clamp(1, 1000))?;
    Ok(Json(json!({ "logs": entries })))
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_listener(listener, state, async {
        std::future::pending::<()>().await
    })
    .await?;
    Ok(())
}

pub async fn serve_listener(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<SocketAddr> {
    let app = build_router(state);
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "status endpoint listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(addr)
}

async fn ip_allowlist(
    axum::extract::ConnectInfo(peer): axum::extract::ConnectInfo<SocketAddr>,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let ip = peer.ip();
    if is_allowed_peer_ip(ip) {
        return next.run(req).await;
    }
    tracing::warn!(%ip, "status request from outside the allowlist");
    (axum::http::StatusCode::FORBIDDEN, "forbidden").into_response()
}

fn is_allowed_peer_ip(ip: IpAddr) -> bool {
    if ip.is_loopback() {
        return true;
    }
    match ip {
        // 100.64.0.0/10
        IpAddr::V4(v4) => {
            let o = v4.octets();
            o[0] == 100 && (64..=127).contains(&o[1])
        }
        IpAddr::V6(v6) => v6.to_ipv4_mapped().is_some_and(|v4| is_allowed_peer_ip(IpAddr::V4(v4))),
    }
}

fn local_only_cors() -> CorsLayer {
    use axum::http::HeaderValue;
    use axum::http::Method;

    CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_origin(AllowOrigin::predicate(|origin: &HeaderValue, _req| {
            is_allowed_local_origin(origin)
        }))
}

fn is_allowed_local_origin(origin: &axum::http::HeaderValue) -> bool {
    let Ok(s) = origin.to_str() else {
        return false;
    };
    is_http_origin_for_host(s, "localhost") || is_http_origin_for_host(s, "127.0.0.1")
}

fn is_http_origin_for_host(origin: &str, host: &str) -> bool {
    for scheme in ["http://", "https://"] {
        if let Some(rest) = origin.strip_prefix(scheme) {
            if let Some(after) = rest.strip_prefix(host) {
                // scheme://host[:port] and nothing else
                return after.is_empty() || after.starts_with(':');
            }
        }
    }
    false
}
