//! Bounded notification queue shared by request handlers (many producers) and
//! the notification worker (single consumer).
//!
//! Producers go through [`NotificationQueue::submit`], which never blocks: when
//! the buffer is full the event is handed to a deferred enqueue task that waits
//! for capacity. Deferred tasks live on a [`TaskTracker`] so shutdown can wait
//! for them or abandon them. Events that take the deferred path may be
//! reordered relative to events submitted after them.
//!
//! The consumer side is a [`NotificationStream`]. It ends once the queue has
//! been closed, every deferred enqueue has settled and the buffer is empty.

use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, PoisonError, RwLock,
    },
    task::{Context, Poll},
};

use metrics::{counter, gauge};
use stock_notify_core::NotificationEvent;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::{wrappers::ReceiverStream, Stream};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

/// Non-blocking enqueue failure. The rejected event is handed back.
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("notification queue is full")]
    Full(NotificationEvent),
    #[error("notification queue is closed")]
    Closed(NotificationEvent),
}

/// Raised when an event is submitted after the queue was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("notification queue closed, dropped event for product {product_id}")]
pub struct QueueClosed {
    pub product_id: i64,
}

/// Which path an accepted event took into the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueuePath {
    /// Placed in the buffer immediately.
    Direct,
    /// Buffer was full; a tracked task waits for capacity.
    Deferred,
}

impl EnqueuePath {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Deferred => "deferred",
        }
    }
}

struct QueueInner {
    // `None` once closed. Readers hold the lock for the whole try_send so a
    // close can never interleave with an enqueue.
    sender: RwLock<Option<mpsc::Sender<NotificationEvent>>>,
    capacity: usize,
    depth: AtomicUsize,
    abandoned: AtomicUsize,
    closed: CancellationToken,
    abandon: CancellationToken,
    deferred: TaskTracker,
}

impl QueueInner {
    fn depth_added(&self) {
        let depth = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
        gauge!("notification_queue_depth").set(depth as f64);
    }

    fn depth_removed(&self) {
        let depth = self.depth.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        gauge!("notification_queue_depth").set(depth as f64);
    }
}

/// Producer handle. Cheap to clone; every clone refers to the same queue.
#[derive(Clone)]
pub struct NotificationQueue {
    inner: Arc<QueueInner>,
}

/// Creates a queue holding at most `capacity` buffered events.
///
/// # Panics
///
/// Panics when `capacity` is zero.
pub fn channel(capacity: usize) -> (NotificationQueue, NotificationStream) {
    let (sender, receiver) = mpsc::channel(capacity);
    let inner = Arc::new(QueueInner {
        sender: RwLock::new(Some(sender)),
        capacity,
        depth: AtomicUsize::new(0),
        abandoned: AtomicUsize::new(0),
        closed: CancellationToken::new(),
        abandon: CancellationToken::new(),
        deferred: TaskTracker::new(),
    });

    let stream = NotificationStream {
        receiver: ReceiverStream::new(receiver),
        inner: inner.clone(),
    };

    (NotificationQueue { inner }, stream)
}

impl NotificationQueue {
    /// Attempts to buffer `event` without waiting.
    pub fn try_enqueue(&self, event: NotificationEvent) -> Result<(), EnqueueError> {
        let guard = self
            .inner
            .sender
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = guard.as_ref() else {
            return Err(EnqueueError::Closed(event));
        };

        self.inner.depth_added();
        match sender.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                self.inner.depth_removed();
                Err(EnqueueError::Full(event))
            }
            Err(TrySendError::Closed(event)) => {
                self.inner.depth_removed();
                Err(EnqueueError::Closed(event))
            }
        }
    }

    /// Hands `event` to the queue without blocking the caller.
    ///
    /// A full buffer moves the event onto a deferred enqueue task. Only a
    /// closed queue refuses the event.
    pub fn submit(&self, event: NotificationEvent) -> Result<EnqueuePath, QueueClosed> {
        let product_id = event.product_id();
        let event = match self.try_enqueue(event) {
            Ok(()) => {
                counter!("notifications_enqueued_total", "path" => "direct").increment(1);
                return Ok(EnqueuePath::Direct);
            }
            Err(EnqueueError::Full(event)) => event,
            Err(EnqueueError::Closed(_)) => {
                counter!("notifications_dropped_total", "reason" => "closed").increment(1);
                return Err(QueueClosed { product_id });
            }
        };

        let guard = self
            .inner
            .sender
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = guard.as_ref().cloned() else {
            counter!("notifications_dropped_total", "reason" => "closed").increment(1);
            return Err(QueueClosed { product_id });
        };

        // Spawned under the read guard so `close` cannot slip in between the
        // clone and the tracker registration.
        let inner = self.inner.clone();
        self.inner
            .deferred
            .spawn(deferred_enqueue(inner, sender, event));
        drop(guard);

        Ok(EnqueuePath::Deferred)
    }

    /// Stops accepting events. Returns `false` when the queue was already closed.
    ///
    /// Deferred enqueues that started before the call keep waiting for
    /// capacity until they land or [`abandon_deferred`](Self::abandon_deferred)
    /// is called.
    pub fn close(&self) -> bool {
        let sender = self
            .inner
            .sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(sender) = sender else {
            return false;
        };
        drop(sender);

        self.inner.deferred.close();
        self.inner.closed.cancel();
        info!(
            stage = "queue",
            buffered = self.len(),
            deferred = self.deferred_in_flight(),
            "notification queue closed"
        );
        true
    }

    /// Makes every pending deferred enqueue give up and drop its event.
    pub fn abandon_deferred(&self) {
        self.inner.abandon.cancel();
    }

    /// Resolves once every deferred enqueue has finished and the queue is closed.
    pub async fn settle_deferred(&self) {
        self.inner.deferred.wait().await;
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Number of buffered events not yet taken by the consumer.
    pub fn len(&self) -> usize {
        self.inner.depth.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of deferred events dropped without reaching the buffer.
    pub fn abandoned(&self) -> usize {
        self.inner.abandoned.load(Ordering::Acquire)
    }

    /// Number of deferred enqueues still waiting for capacity.
    pub fn deferred_in_flight(&self) -> usize {
        self.inner.deferred.len()
    }
}

async fn deferred_enqueue(
    inner: Arc<QueueInner>,
    sender: mpsc::Sender<NotificationEvent>,
    event: NotificationEvent,
) {
    let product_id = event.product_id();
    debug!(stage = "queue", product_id, "waiting for notification queue capacity");

    let permit = tokio::select! {
        biased;
        () = inner.abandon.cancelled() => None,
        permit = sender.reserve() => permit.ok(),
    };

    match permit {
        Some(permit) => {
            inner.depth_added();
            permit.send(event);
            counter!("notifications_enqueued_total", "path" => "deferred").increment(1);
            debug!(stage = "queue", product_id, "deferred notification enqueued");
        }
        None => {
            inner.abandoned.fetch_add(1, Ordering::AcqRel);
            let err = QueueClosed { product_id };
            counter!("notifications_dropped_total", "reason" => "abandoned").increment(1);
            warn!(
                stage = "queue",
                product_id,
                error = %err,
                "deferred notification dropped during shutdown"
            );
        }
    }
}

/// Consumer side of the queue. Yields events in buffer order.
pub struct NotificationStream {
    receiver: ReceiverStream<NotificationEvent>,
    inner: Arc<QueueInner>,
}

impl NotificationStream {
    /// Token cancelled when the producer side closes the queue.
    pub fn closed_token(&self) -> CancellationToken {
        self.inner.closed.clone()
    }
}

impl Stream for NotificationStream {
    type Item = NotificationEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = Pin::new(&mut self.receiver).poll_next(cx);
        if let Poll::Ready(Some(_)) = &polled {
            self.inner.depth_removed();
        }
        polled
    }
}
