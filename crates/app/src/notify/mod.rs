//! Asynchronous stock-notification pipeline: bounded queue, single worker and
//! the downstream notifier it drives.

pub mod notifier;
pub mod queue;
pub mod worker;

use std::{sync::Arc, time::Duration};

pub use notifier::{Notifier, SimulatedNotifier};
pub use queue::{EnqueuePath, NotificationQueue};
pub use worker::{NotificationWorker, WorkerHandle, WorkerReport};

/// Creates the queue and spawns its worker.
///
/// The worker exists before this returns, so anything enqueued afterwards has
/// a consumer.
pub fn start(
    capacity: usize,
    notifier: Arc<dyn Notifier>,
    deadline: Duration,
) -> (NotificationQueue, WorkerHandle) {
    let (queue, stream) = queue::channel(capacity);
    let worker = NotificationWorker::new(stream, notifier, deadline).spawn();
    (queue, worker)
}
