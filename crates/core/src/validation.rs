use serde::Deserialize;
use thiserror::Error;

use crate::types::Product;

/// Payload accepted by `POST /products`.
///
/// Absent fields fall back to their zero values and are then rejected (or
/// accepted) by [`CreateProductRequest::validate`].
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct CreateProductRequest {
    pub name: String,
    pub price: f64,
    pub stock: i64,
}

/// Errors surfaced to the client as `400 Bad Request`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("product name is required")]
    MissingName,
    #[error("price must not be negative")]
    NegativePrice,
    #[error("price must be a finite number")]
    NonFinitePrice,
    #[error("stock must not be negative")]
    NegativeStock,
}

/// A product that passed validation and has not been stored yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewProduct {
    name: String,
    price: f64,
    stock: i64,
}

impl CreateProductRequest {
    pub fn validate(self) -> Result<NewProduct, ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::MissingName);
        }
        if !self.price.is_finite() {
            return Err(ValidationError::NonFinitePrice);
        }
        if self.price < 0.0 {
            return Err(ValidationError::NegativePrice);
        }
        if self.stock < 0 {
            return Err(ValidationError::NegativeStock);
        }

        Ok(NewProduct {
            name: self.name,
            price: self.price,
            stock: self.stock,
        })
    }
}

impl NewProduct {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn price(&self) -> f64 {
        self.price
    }

    pub fn stock(&self) -> i64 {
        self.stock
    }

    /// Attaches the identifier assigned by the store.
    pub fn into_product(self, id: i64) -> Product {
        Product {
            id: Some(id),
            name: self.name,
            price: self.price,
            stock: self.stock,
        }
    }
}
