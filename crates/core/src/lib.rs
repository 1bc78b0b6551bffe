//! Domain types shared between the HTTP layer, the product store and the
//! notification pipeline.

pub mod types;
pub mod validation;

pub use types::{NotificationEvent, Product, ProductNotPersisted};
pub use validation::{CreateProductRequest, NewProduct, ValidationError};
