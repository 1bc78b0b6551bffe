use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use stock_notify_core::{CreateProductRequest, NotificationEvent, Product, ValidationError};
use stock_notify_storage::StoreError;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::notify::EnqueuePath;
use crate::router::AppState;

/// Failures of `POST /products`, answered with a plain-text body.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid payload")]
    InvalidPayload,
    #[error("{0}")]
    InvalidRequest(#[from] ValidationError),
    #[error("failed to store product")]
    Storage(#[source] StoreError),
    #[error("server is shutting down")]
    ShuttingDown,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::InvalidPayload | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            Self::InvalidPayload => "invalid_payload",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Storage(_) => "storage",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        counter!("product_create_failures_total", "reason" => self.reason()).increment(1);
        if let Self::Storage(source) = &self {
            error!(stage = "storage", error = %source, "failed to store product");
        }
        (self.status(), self.to_string()).into_response()
    }
}

/// `POST /products`: validates, persists, then hands the product to the
/// notification queue without waiting for it.
pub async fn create(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<Product>), ApiError> {
    let request: CreateProductRequest = serde_json::from_slice(&body).map_err(|err| {
        debug!(stage = "http", error = %err, "rejecting undecodable product payload");
        ApiError::InvalidPayload
    })?;
    let new_product = request.validate()?;

    let id = state
        .store()
        .insert(&new_product)
        .await
        .map_err(ApiError::Storage)?;
    let product = new_product.into_product(id);
    counter!("products_created_total").increment(1);
    info!(stage = "http", product_id = id, product = %product.name, "product created");

    dispatch_notification(&state, &product);

    Ok((StatusCode::CREATED, Json(product)))
}

/// Queues the stock notification for a persisted product. Never fails the
/// request: the client gets its response whatever happens here.
fn dispatch_notification(state: &AppState, product: &Product) {
    let event = match NotificationEvent::for_product(product, state.now()) {
        Ok(event) => event,
        Err(err) => {
            error!(stage = "queue", error = %err, "refusing to notify about product");
            return;
        }
    };

    match state.queue().submit(event) {
        Ok(EnqueuePath::Direct) => {
            debug!(stage = "queue", product_id = ?product.id, "notification enqueued");
        }
        Ok(path @ EnqueuePath::Deferred) => {
            warn!(
                stage = "queue",
                product_id = ?product.id,
                path = path.as_str(),
                capacity = state.queue().capacity(),
                "notification queue full, deferring enqueue"
            );
        }
        Err(err) => {
            warn!(stage = "queue", error = %err, "notification dropped");
        }
    }
}
