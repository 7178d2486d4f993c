//! Ingress HTTP service.
//!
//! Triggers external searches and publishes their results onto the broker
//! topic, where correlators in any subscribed process pick them up.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/search?q=<query>[&search_id=<id>]` | Run a search, publish the result, return its identifier |
//! | `GET`  | `/health` | `healthy`, or `busy` (503) when the publish queue is over threshold |
//!
//! # Error Contract
//!
//! Error responses share one schema:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "invalid request: query parameter q must not be empty" } }
//! ```
//!
//! Codes: `bad_request` (400), `rate_limited` (429), `upstream_search` (502),
//! `broker_publish` (500), `busy` / `canceled` (503), `internal` (500).
//!
//! # Admission
//!
//! `/search` sits behind a token-bucket gate. Rejected requests get `429`
//! before any external call or publish is attempted. `/health` is not gated.

use anyhow::Result;
use axum::{
    extract::{Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::broker::BrokerClient;
use crate::config::Config;
use crate::error::RelayError;
use crate::limiter::TokenBucket;
use crate::models::{SearchIdentifier, SearchRequest, TriggerResponse};
use crate::search::HttpSearchProvider;
use crate::shutdown::ShutdownCoordinator;
use crate::trigger::SearchTrigger;

/// Shared state passed to every handler via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub trigger: Arc<SearchTrigger>,
    pub broker: Arc<BrokerClient>,
    pub limiter: Arc<TokenBucket>,
    /// Outstanding publishes above which `/health` reports busy.
    pub queue_threshold: usize,
}

/// Build the ingress router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/search", get(handle_search))
        .route_layer(middleware::from_fn_with_state(state.clone(), admission_gate))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve `state` on `listener` until `shutdown` is cancelled.
///
/// After cancellation the listener stops accepting connections and
/// in-flight requests are allowed to finish.
pub async fn serve(listener: TcpListener, state: AppState, shutdown: CancellationToken) -> Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Starts the ingress service.
///
/// This is the composition root for `relay serve`: it opens the broker
/// client, builds the search provider and trigger, serves until Ctrl-C, then
/// drains in-flight requests and closes the broker.
pub async fn run_server(config: &Config, in_memory: bool) -> Result<()> {
    let broker = if in_memory {
        BrokerClient::in_memory((&config.broker).into())
    } else {
        BrokerClient::open(&config.broker).await?
    };

    let provider = Arc::new(HttpSearchProvider::new(&config.search)?);
    let state = AppState {
        trigger: Arc::new(SearchTrigger::new(provider, broker.clone())),
        broker: broker.clone(),
        limiter: Arc::new(TokenBucket::from_config(&config.rate_limit)),
        queue_threshold: config.broker.queue_threshold,
    };

    let listener = TcpListener::bind(&config.server.bind).await?;
    info!(addr = %listener.local_addr()?, topic = %broker.topic(), "ingress listening");

    let coordinator = ShutdownCoordinator::new();
    coordinator.cancel_on_ctrl_c();
    let token = coordinator.token();

    let server = tokio::spawn(async move {
        if let Err(e) = serve(listener, state, token).await {
            warn!(error = %e, "ingress server failed");
        }
    });

    coordinator.token().cancelled().await;
    coordinator
        .drain(vec![server], Some(config.broker.drain_timeout()))
        .await;
    broker.close(config.broker.drain_timeout()).await?;

    info!("ingress stopped");
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl From<RelayError> for AppError {
    fn from(err: RelayError) -> Self {
        Self {
            status: err.status(),
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

// ============ Admission ============

async fn admission_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if !state.limiter.try_acquire() {
        return AppError::from(RelayError::RateLimited).into_response();
    }
    next.run(request).await
}

// ============ GET /search ============

/// Handler for `GET /search`.
///
/// Uses the caller's `search_id` when given (so it can register its
/// correlation wait first), otherwise generates one.
async fn handle_search(
    State(state): State<AppState>,
    Query(req): Query<SearchRequest>,
) -> Result<Json<TriggerResponse>, AppError> {
    let id = match req.search_id.as_deref() {
        Some(raw) => SearchIdentifier::parse(raw)
            .ok_or_else(|| RelayError::Validation("search_id must not be blank".to_string()))?,
        None => SearchIdentifier::generate(),
    };

    state.trigger.trigger_with_id(&id, &req.query).await?;

    Ok(Json(TriggerResponse {
        status: "success".to_string(),
        message: "search result published".to_string(),
        search_id: id,
    }))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    outstanding_publishes: usize,
    version: String,
}

/// Handler for `GET /health`.
async fn handle_health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let outstanding = state.broker.outstanding_publishes();
    let (status, label) = if state.broker.is_closed() {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    } else if let Err(e) = state.broker.check_capacity(state.queue_threshold) {
        warn!(error = %e, "reporting busy");
        (StatusCode::SERVICE_UNAVAILABLE, "busy")
    } else {
        (StatusCode::OK, "healthy")
    };

    (
        status,
        Json(HealthResponse {
            status: label.to_string(),
            outstanding_publishes: outstanding,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}
