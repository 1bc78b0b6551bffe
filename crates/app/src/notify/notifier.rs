use std::time::Duration;

use async_trait::async_trait;
use stock_notify_core::NotificationEvent;
use thiserror::Error;

/// Downstream side-effect triggered for every created product.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotifyError>;
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification for product {product_id} failed: {reason}")]
    Failed { product_id: i64, reason: String },
}

/// Stands in for a real stock-notification call by waiting a fixed delay.
#[derive(Debug, Clone)]
pub struct SimulatedNotifier {
    delay: Duration,
}

impl SimulatedNotifier {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Notifier for SimulatedNotifier {
    async fn notify(&self, _event: &NotificationEvent) -> Result<(), NotifyError> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}
