//! Process-wide startup/shutdown ordering.
//!
//! Shutdown runs in three steps once the termination signal fires:
//!
//! 1. graceful stop of the HTTP server, bounded by `graceful_timeout`;
//! 2. closing the notification queue;
//! 3. waiting for deferred enqueues and the worker drain, bounded by
//!    `drain_timeout`.
//!
//! A step that overruns its bound is logged and the sequence moves on.

use std::{future::Future, io, time::Duration};

use axum::Router;
use thiserror::Error;
use tokio::{net::TcpListener, task::JoinError, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::notify::{NotificationQueue, WorkerHandle, WorkerReport};

#[derive(Debug, Clone, Copy)]
pub struct ShutdownSettings {
    pub graceful_timeout: Duration,
    pub drain_timeout: Duration,
}

/// Outcome of a completed shutdown sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// The server did not finish in-flight requests in time and was aborted.
    pub server_forced: bool,
    /// The drain overran its bound; the worker was aborted.
    pub drain_timed_out: bool,
    /// Events lost to the drain timeout: those still buffered when the worker
    /// was aborted plus deferred enqueues that never reached the buffer.
    pub abandoned_events: usize,
    /// `None` when the worker was aborted or panicked.
    pub worker: Option<WorkerReport>,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("http server failed: {0}")]
    Server(#[from] io::Error),
    #[error("http server task panicked: {0}")]
    ServerTask(JoinError),
}

/// Which bounded shutdown step overran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ShutdownTimeout {
    #[error("graceful stop exceeded {0:?}")]
    GracefulStop(Duration),
    #[error("notification drain exceeded {0:?}")]
    Drain(Duration),
}

/// Owns the server and the notification pipeline for the lifetime of the process.
pub struct Lifecycle {
    listener: TcpListener,
    router: Router,
    queue: NotificationQueue,
    worker: WorkerHandle,
    admission: CancellationToken,
    settings: ShutdownSettings,
}

impl Lifecycle {
    /// `worker` must already be running so that the first accepted request has
    /// a consumer; `admission` must be the token the router's [`AppState`] was
    /// built with.
    ///
    /// [`AppState`]: crate::router::AppState
    pub fn new(
        listener: TcpListener,
        router: Router,
        queue: NotificationQueue,
        worker: WorkerHandle,
        admission: CancellationToken,
        settings: ShutdownSettings,
    ) -> Self {
        Self {
            listener,
            router,
            queue,
            worker,
            admission,
            settings,
        }
    }

    /// Serves until `signal` resolves, then runs the shutdown sequence.
    ///
    /// Server errors are reported only after the queue has been closed and
    /// drained.
    pub async fn run<F>(self, signal: F) -> Result<ShutdownReport, LifecycleError>
    where
        F: Future<Output = ()> + Send,
    {
        let Self {
            listener,
            router,
            queue,
            mut worker,
            admission,
            settings,
        } = self;

        let stop = admission.clone();
        let mut server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
        });

        let mut report = ShutdownReport::default();

        let early_exit = tokio::select! {
            () = signal => None,
            joined = &mut server => Some(joined),
        };

        // Step 1: graceful stop of the server.
        admission.cancel();
        let server_result = match early_exit {
            Some(joined) => {
                error!(stage = "lifecycle", "http server stopped before shutdown signal");
                flatten(joined)
            }
            None => {
                info!(
                    stage = "lifecycle",
                    timeout_secs = settings.graceful_timeout.as_secs_f64(),
                    "shutdown signal received, stopping http server"
                );
                match timeout(settings.graceful_timeout, &mut server).await {
                    Ok(joined) => flatten(joined),
                    Err(_) => {
                        let err = ShutdownTimeout::GracefulStop(settings.graceful_timeout);
                        warn!(
                            stage = "lifecycle",
                            error = %err,
                            "forcing http server closed with requests still in flight"
                        );
                        server.abort();
                        report.server_forced = true;
                        Ok(())
                    }
                }
            }
        };

        // Step 2: no producer can enqueue past this point.
        if !queue.close() {
            warn!(stage = "lifecycle", "notification queue was already closed");
        }

        // Step 3: let deferred enqueues land and the worker drain.
        let drained = timeout(settings.drain_timeout, async {
            queue.settle_deferred().await;
            worker.wait().await
        })
        .await;

        match drained {
            Ok(Ok(worker_report)) => {
                info!(
                    stage = "lifecycle",
                    processed = worker_report.processed,
                    failed = worker_report.failed,
                    "notification queue drained"
                );
                report.worker = Some(worker_report);
            }
            Ok(Err(err)) => {
                error!(stage = "lifecycle", error = %err, "notification worker panicked");
            }
            Err(_) => {
                let err = ShutdownTimeout::Drain(settings.drain_timeout);
                let worker_state = worker.state();
                queue.abandon_deferred();
                worker.abort();
                queue.settle_deferred().await;
                report.drain_timed_out = true;
                report.abandoned_events = queue.len() + queue.abandoned();
                warn!(
                    stage = "lifecycle",
                    error = %err,
                    worker_state = worker_state.as_str(),
                    abandoned_events = report.abandoned_events,
                    "notification worker force-stopped"
                );
            }
        }

        info!(
            stage = "lifecycle",
            server_forced = report.server_forced,
            drain_timed_out = report.drain_timed_out,
            "shutdown complete"
        );
        server_result.map(|()| report)
    }
}

fn flatten(joined: Result<io::Result<()>, JoinError>) -> Result<(), LifecycleError> {
    match joined {
        Ok(result) => result.map_err(LifecycleError::from),
        Err(err) => Err(LifecycleError::ServerTask(err)),
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(stage = "lifecycle", error = %err, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(stage = "lifecycle", error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!(stage = "lifecycle", "received SIGINT"),
        () = terminate => info!(stage = "lifecycle", "received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{self, Notifier};
    use crate::router::{app_router, AppState};
    use crate::telemetry;
    use crate::test_support::{FakeStore, GatedNotifier, RecordingNotifier};
    use std::{net::SocketAddr, sync::Arc};
    use stock_notify_storage::ProductStore;
    use tokio::sync::oneshot;

    struct Running {
        addr: SocketAddr,
        trigger: oneshot::Sender<()>,
        task: tokio::task::JoinHandle<Result<ShutdownReport, LifecycleError>>,
    }

    async fn launch(
        store: Arc<dyn ProductStore>,
        notifier: Arc<dyn Notifier>,
        capacity: usize,
        settings: ShutdownSettings,
    ) -> Running {
        let metrics = telemetry::init_metrics().expect("metrics init");
        let (queue, worker) = notify::start(capacity, notifier, Duration::from_secs(5));
        let admission = CancellationToken::new();
        let state = AppState::new(metrics, store, queue.clone(), admission.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let lifecycle = Lifecycle::new(
            listener,
            app_router(state),
            queue,
            worker,
            admission,
            settings,
        );

        let (trigger, signal) = oneshot::channel::<()>();
        let task = tokio::spawn(lifecycle.run(async move {
            let _ = signal.await;
        }));

        Running {
            addr,
            trigger,
            task,
        }
    }

    fn settings(graceful_ms: u64, drain_ms: u64) -> ShutdownSettings {
        ShutdownSettings {
            graceful_timeout: Duration::from_millis(graceful_ms),
            drain_timeout: Duration::from_millis(drain_ms),
        }
    }

    async fn create(
        client: &reqwest::Client,
        addr: SocketAddr,
        name: &str,
    ) -> reqwest::Result<reqwest::Response> {
        client
            .post(format!("http://{addr}/products"))
            .json(&serde_json::json!({ "name": name, "price": 1, "stock": 1 }))
            .send()
            .await
    }

    #[tokio::test]
    async fn drains_events_accepted_before_the_signal() {
        let store = Arc::new(FakeStore::default());
        let notifier = Arc::new(RecordingNotifier::with_delay(Duration::from_millis(20)));
        let running = launch(store, notifier.clone(), 8, settings(1_000, 5_000)).await;
        let client = reqwest::Client::new();

        for name in ["a", "b", "c"] {
            let response = create(&client, running.addr, name).await.expect("request");
            assert_eq!(response.status(), reqwest::StatusCode::CREATED);
        }

        running.trigger.send(()).expect("lifecycle alive");
        let report = timeout(Duration::from_secs(5), running.task)
            .await
            .expect("shutdown finishes")
            .expect("lifecycle task")
            .expect("clean shutdown");

        assert!(!report.server_forced);
        assert!(!report.drain_timed_out);
        assert_eq!(report.worker.map(|w| w.processed), Some(3));
        assert_eq!(notifier.ids(), vec![1, 2, 3]);

        let after = create(&reqwest::Client::new(), running.addr, "late").await;
        assert!(after.is_err(), "no request is accepted after shutdown");
    }

    #[tokio::test]
    async fn slow_request_forces_server_closed_and_is_not_notified() {
        let store = Arc::new(FakeStore::slow(Duration::from_millis(500)));
        let notifier = Arc::new(RecordingNotifier::default());
        let running = launch(store.clone(), notifier.clone(), 8, settings(50, 2_000)).await;

        let addr = running.addr;
        let in_flight = tokio::spawn(async move {
            let client = reqwest::Client::new();
            create(&client, addr, "slow").await
        });
        store.entered().await;

        running.trigger.send(()).expect("lifecycle alive");
        let report = timeout(Duration::from_secs(5), running.task)
            .await
            .expect("shutdown finishes")
            .expect("lifecycle task")
            .expect("shutdown reports success");

        assert!(report.server_forced);
        assert_eq!(report.worker.map(|w| w.processed), Some(0));

        // The request still finishes, but its event meets a closed queue.
        let _ = in_flight.await;
        assert!(notifier.ids().is_empty());
    }

    #[tokio::test]
    async fn drain_timeout_abandons_remaining_work() {
        let store = Arc::new(FakeStore::default());
        let notifier = Arc::new(GatedNotifier::default());
        let running = launch(store, notifier.clone(), 2, settings(1_000, 100)).await;
        let client = reqwest::Client::new();

        for name in ["a", "b", "c", "d"] {
            let response = create(&client, running.addr, name).await.expect("request");
            assert_eq!(response.status(), reqwest::StatusCode::CREATED);
        }
        notifier.wait_started(1).await;

        running.trigger.send(()).expect("lifecycle alive");
        let report = timeout(Duration::from_secs(5), running.task)
            .await
            .expect("shutdown finishes")
            .expect("lifecycle task")
            .expect("shutdown reports success");

        assert!(report.drain_timed_out);
        assert!(report.worker.is_none());
        // One event is held by the stalled worker; the buffered and the
        // deferred ones are reported.
        assert_eq!(report.abandoned_events, 3);
        assert!(notifier.ids().is_empty());
    }
}
