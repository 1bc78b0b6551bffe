use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

/// Largest magnitude below which every integral `f64` is exactly representable.
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Product record as exposed over the API.
///
/// `id` stays `None` until the store has persisted the product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    #[serde(serialize_with = "serialize_price")]
    pub price: f64,
    pub stock: i64,
}

impl Product {
    /// Returns `true` once the store has assigned an identifier.
    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }
}

/// Integral prices are written as JSON integers (`250000` rather than `250000.0`).
fn serialize_price<S: Serializer>(price: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if price.is_finite() && price.fract() == 0.0 && price.abs() < MAX_EXACT_INTEGER {
        serializer.serialize_i64(*price as i64)
    } else {
        serializer.serialize_f64(*price)
    }
}

/// Immutable snapshot of a persisted product handed to the notification worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationEvent {
    product_id: i64,
    product: Product,
    persisted_at: DateTime<Utc>,
}

impl NotificationEvent {
    /// Builds the event for a product that already carries its store identifier.
    pub fn for_product(
        product: &Product,
        persisted_at: DateTime<Utc>,
    ) -> Result<Self, ProductNotPersisted> {
        let product_id = product.id.ok_or(ProductNotPersisted)?;
        Ok(Self {
            product_id,
            product: product.clone(),
            persisted_at,
        })
    }

    pub fn product_id(&self) -> i64 {
        self.product_id
    }

    pub fn product(&self) -> &Product {
        &self.product
    }

    pub fn name(&self) -> &str {
        &self.product.name
    }

    pub fn persisted_at(&self) -> DateTime<Utc> {
        self.persisted_at
    }
}

/// Raised when a notification is requested for a product without an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("product has not been persisted yet")]
pub struct ProductNotPersisted;
