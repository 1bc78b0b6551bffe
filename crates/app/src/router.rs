use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{json, Value};
use stock_notify_storage::ProductStore;
use tokio_util::sync::CancellationToken;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
    LatencyUnit,
};
use tracing::Level;

use crate::notify::NotificationQueue;
use crate::products::{self, ApiError};
use crate::telemetry;

/// Upper bound for handling one request, matching the server's read/write timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Dependencies shared by every handler. Built once at startup.
#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    store: Arc<dyn ProductStore>,
    queue: NotificationQueue,
    admission: CancellationToken,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl AppState {
    /// `admission` is cancelled by the lifecycle coordinator when graceful
    /// stop begins; creation requests are refused from then on.
    pub fn new(
        metrics: PrometheusHandle,
        store: Arc<dyn ProductStore>,
        queue: NotificationQueue,
        admission: CancellationToken,
    ) -> Self {
        Self {
            metrics,
            store,
            queue,
            admission,
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn store(&self) -> &dyn ProductStore {
        self.store.as_ref()
    }

    pub fn queue(&self) -> &NotificationQueue {
        &self.queue
    }

    pub fn is_stopping(&self) -> bool {
        self.admission.is_cancelled()
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

pub fn app_router(state: AppState) -> Router {
    let create = post(products::create)
        .route_layer(middleware::from_fn_with_state(state.clone(), admission_gate));

    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/products", create)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(
                    DefaultOnResponse::new()
                        .level(Level::INFO)
                        .latency_unit(LatencyUnit::Millis),
                ),
        )
        .with_state(state)
}

/// Refuses new creations once shutdown started, so nothing reaches a queue
/// that is about to close.
async fn admission_gate(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if state.is_stopping() {
        return Err(ApiError::ShuttingDown);
    }
    Ok(next.run(request).await)
}

async fn root() -> Json<Value> {
    Json(json!({
        "message": "product API is running",
        "usage_example": "POST /products with JSON {\"name\":\"Mouse\",\"price\":250000,\"stock\":15}",
    }))
}

async fn healthz(State(state): State<AppState>) -> StatusCode {
    if state.is_stopping() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        Body::from(body),
    )
}
