//! # Worker HTTP API
//!
//! The remote entry point of the fan-out. A worker receives
//! [`FanOutPayload`](crate::fanout::FanOutPayload)s, executes plan sub-trees and single items, and replies
//! with JSON results or an `{errorType, errorMessage}` body.
//!
//! ## Endpoints
//!
//! - `POST /invoke` - Execute a fan-out payload
//! - `GET /status` - Served tasks and graph counts
//! - `GET /health` - Health check
//!
//! ## Security Configuration
//!
//! - `[worker] api_key` / `STRATA_API_KEY`: if set, requires Bearer token authentication
//! - `[worker] rate_limit` / `STRATA_RATE_LIMIT`: requests per second (0 to disable)
//! - `[worker] max_inflight` / `STRATA_MAX_INFLIGHT`: invocations executing at once

mod auth;
mod handlers;
mod middleware;
mod types;

pub use auth::api_key_auth_middleware;
pub use handlers::{health_handler, invoke_handler, status_handler};
pub use middleware::{GlobalRateLimiter, create_rate_limiter, rate_limit_middleware};
pub use types::{HealthResponse, StatusResponse};

use crate::config::WorkerConfig;
use crate::fanout::{Invoker, LocalInvoker, TaskRegistry};
use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};
use std::sync::Arc;
use strata_core::{GraphStore, StrataError};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

// =============================================================================
// SERVER STATE
// =============================================================================

/// Shared worker state.
#[derive(Clone)]
pub struct WorkerState {
    pub tasks: Arc<TaskRegistry>,
    /// Delivers the sub-trees and items of a received plan.
    pub children: Arc<dyn Invoker>,
    pub graph: Arc<dyn GraphStore>,
}

impl WorkerState {
    /// Worker that executes received plans in-process.
    #[must_use]
    pub fn local(tasks: TaskRegistry, graph: Arc<dyn GraphStore>) -> Self {
        let tasks = Arc::new(tasks);
        Self {
            children: Arc::new(LocalInvoker::new(tasks.clone())),
            tasks,
            graph,
        }
    }
}

// =============================================================================
// ROUTER CREATION
// =============================================================================

/// Create the axum router with all endpoints and middleware.
///
/// Middleware stack (outer to inner):
/// 1. Tracing - logs all requests
/// 2. Body limit
/// 3. Rate Limiting - protects against overload (if enabled)
/// 4. Authentication - validates API key (if configured)
/// 5. Concurrency limit - on `/invoke` only
pub fn create_router(state: WorkerState, config: &WorkerConfig) -> Router {
    let invoke = post(handlers::invoke_handler)
        .layer(GlobalConcurrencyLimitLayer::new(config.max_inflight.max(1)));

    let mut router = Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/status", get(handlers::status_handler))
        .route("/invoke", invoke);

    match config.api_key.as_deref().filter(|key| !key.is_empty()) {
        Some(key) => {
            tracing::info!("API key authentication enabled");
            let expected: Arc<str> = Arc::from(key);
            router = router.layer(axum_middleware::from_fn_with_state(
                expected,
                auth::api_key_auth_middleware,
            ));
        }
        None => {
            tracing::warn!(
                "API key authentication DISABLED - any client can submit work. \
                 Set STRATA_API_KEY to enable authentication."
            );
        }
    }

    if config.rate_limit > 0 {
        tracing::info!("Rate limiting enabled: {} requests/second", config.rate_limit);
        router = router.layer(axum_middleware::from_fn_with_state(
            create_rate_limiter(config.rate_limit),
            middleware::rate_limit_middleware,
        ));
    } else {
        tracing::info!("Rate limiting disabled");
    }

    router
        .layer(axum::extract::DefaultBodyLimit::max(8 * 1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// SERVER STARTUP
// =============================================================================

/// Serve the worker API until Ctrl-C.
pub async fn run_worker(state: WorkerState, config: &WorkerConfig) -> Result<(), StrataError> {
    let addr = format!("{}:{}", config.host, config.port);
    let router = create_router(state, config);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| StrataError::IoError(format!("Bind failed: {}", e)))?;

    tracing::info!("strata worker listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                tracing::warn!("cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutting down worker");
        })
        .await
        .map_err(|e| StrataError::IoError(format!("Server error: {}", e)))
}
