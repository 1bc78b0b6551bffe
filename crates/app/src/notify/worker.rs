use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use metrics::{counter, histogram};
use stock_notify_core::NotificationEvent;
use tokio::{
    sync::watch,
    task::{JoinError, JoinHandle},
    time::timeout,
};
use tokio_stream::StreamExt;
use tracing::{error, info};

use super::{
    notifier::{Notifier, NotifyError},
    queue::NotificationStream,
};

/// Lifecycle of the notification worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting for or processing events while the queue is open.
    Running,
    /// Queue closed; finishing whatever is still buffered.
    Draining,
    /// Queue closed and empty. Terminal.
    Stopped,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

/// Totals returned when the worker stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub processed: u64,
    pub failed: u64,
}

/// Single consumer of the notification queue.
pub struct NotificationWorker {
    stream: NotificationStream,
    notifier: Arc<dyn Notifier>,
    deadline: Duration,
    state: watch::Sender<WorkerState>,
}

impl NotificationWorker {
    /// A notification still pending after `deadline` counts as failed.
    pub fn new(
        stream: NotificationStream,
        notifier: Arc<dyn Notifier>,
        deadline: Duration,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Running);
        Self {
            stream,
            notifier,
            deadline,
            state,
        }
    }

    /// Runs the worker loop in the background.
    pub fn spawn(self) -> WorkerHandle {
        let state = self.state.subscribe();
        let task = tokio::spawn(self.run());
        WorkerHandle { task, state }
    }

    /// Drains the queue until it is closed and empty.
    pub async fn run(mut self) -> WorkerReport {
        info!(stage = "worker", "notification worker started");
        let closed = self.stream.closed_token();
        let mut report = WorkerReport::default();

        loop {
            let next = if *self.state.borrow() == WorkerState::Running {
                tokio::select! {
                    biased;
                    () = closed.cancelled() => {
                        self.transition(WorkerState::Draining);
                        continue;
                    }
                    event = self.stream.next() => event,
                }
            } else {
                self.stream.next().await
            };

            let Some(event) = next else {
                break;
            };
            self.process(&event, &mut report).await;
        }

        self.transition(WorkerState::Stopped);
        info!(
            stage = "worker",
            processed = report.processed,
            failed = report.failed,
            "notification worker stopped"
        );
        report
    }

    async fn process(&self, event: &NotificationEvent, report: &mut WorkerReport) {
        let product_id = event.product_id();
        let start = Instant::now();
        info!(
            stage = "worker",
            product_id,
            product = %event.name(),
            "product created, triggering stock notification"
        );

        let outcome = match timeout(self.deadline, self.notifier.notify(event)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(NotifyError::Failed {
                product_id,
                reason: format!("no response within {:?}", self.deadline),
            }),
        };

        match outcome {
            Ok(()) => {
                report.processed += 1;
                counter!("notifications_processed_total", "result" => "ok").increment(1);
                info!(
                    stage = "worker",
                    product_id,
                    product = %event.name(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "stock notification completed"
                );
            }
            Err(err) => {
                report.failed += 1;
                counter!("notifications_processed_total", "result" => "error").increment(1);
                error!(
                    stage = "worker",
                    product_id,
                    error = %err,
                    "stock notification failed, continuing with next event"
                );
            }
        }

        histogram!("notification_duration_seconds").record(start.elapsed().as_secs_f64());
    }

    fn transition(&self, next: WorkerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(
                stage = "worker",
                from = previous.as_str(),
                to = next.as_str(),
                "notification worker state changed"
            );
        }
    }
}

/// Owner-side handle of a spawned [`NotificationWorker`].
pub struct WorkerHandle {
    task: JoinHandle<WorkerReport>,
    state: watch::Receiver<WorkerState>,
}

impl WorkerHandle {
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Receiver observing every state transition.
    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }

    /// Waits for the worker to stop. Can be called again after a timeout.
    pub async fn wait(&mut self) -> Result<WorkerReport, JoinError> {
        (&mut self.task).await
    }

    /// Force-stops the worker; events still buffered are discarded.
    pub fn abort(&self) {
        self.task.abort();
    }

    #[cfg(test)]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
