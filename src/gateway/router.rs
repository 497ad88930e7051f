//! HTTP router and handlers

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tower_http::{
    catch_panic::CatchPanicLayer, compression::CompressionLayer, timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::debug;

use super::pipeline::Pipeline;
use super::plugin::{GatewayMiddleware, PolicyOutcome};
use super::proxy::Proxy;
use crate::context::context_middleware;

/// Shared application state
pub struct AppState {
    /// Pipelines in match order
    pub pipelines: Vec<Pipeline>,
    /// Upstream forwarder
    pub proxy: Proxy,
}

/// Create the router.
///
/// Pipeline traffic goes through the plugins' middleware; `/health` does not.
pub fn create_router(
    state: Arc<AppState>,
    plugin_middleware: Vec<GatewayMiddleware>,
    request_timeout: Duration,
) -> Router {
    let mut pipelines = Router::new()
        .fallback(pipeline_handler)
        .with_state(Arc::clone(&state));

    for wrap in plugin_middleware {
        pipelines = wrap(pipelines);
    }

    // The request context must exist before any plugin middleware runs
    let pipelines = pipelines.layer(middleware::from_fn(context_middleware));

    Router::new()
        .route("/health", get(health_handler))
        .fallback_service(pipelines)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(CatchPanicLayer::new())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "pipelines": state.pipelines.len()
    }))
}

/// Everything except `/health`: find the pipeline, run its policies, proxy.
async fn pipeline_handler(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response {
    let path = request.uri().path().to_string();

    let Some(pipeline) = state.pipelines.iter().find(|p| p.matches(&path)) else {
        debug!(path = %path, "No pipeline matches");
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    };

    match pipeline.run(request).await {
        PolicyOutcome::Continue(request) => state.proxy.forward(request, pipeline.upstream()).await,
        PolicyOutcome::Respond(response) => response,
    }
}
