use std::future::Future;
use std::time::Instant;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{header::HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::liveness;
use crate::registry::{ClientRegistry, RegistryStats};
use crate::ws::{self, SignalingState};

const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;
const REQUEST_ID_HEADER: &str = "x-request-id";

pub fn build_router(state: SignalingState) -> Router {
    let stats_routes = Router::new()
        .route("/v1/stats", get(stats))
        .with_state(state.registry.clone());

    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .merge(stats_routes)
            .merge(ws::router(state)),
    )
}

pub(crate) fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
        .layer(CorsLayer::permissive())
}

/// Serves the relay on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, config: RelayConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let registry = ClientRegistry::new(config.pending);
    let monitor = liveness::spawn(registry.clone(), config.heartbeat_interval);
    let state = SignalingState::new(registry, config.request_username)
        .with_registration_timeout(config.registration_timeout);
    let app = build_router(state);

    let local_addr = listener.local_addr().context("failed to read relay listener address")?;
    info!(listen_addr = %local_addr, "starting relay server");

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("relay server exited unexpectedly");
    monitor.wait().await;
    result
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn stats(State(registry): State<ClientRegistry>) -> Json<RegistryStats> {
    Json(registry.stats().await)
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = next.run(request).await;

    if let Ok(request_id_header) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, request_id_header);
    }

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}
