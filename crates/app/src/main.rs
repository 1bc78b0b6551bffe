mod lifecycle;
mod notify;
mod products;
mod router;
mod telemetry;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use stock_notify_storage::Database;
use stock_notify_util::{load_env_file, AppConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::lifecycle::{Lifecycle, ShutdownSettings};
use crate::notify::SimulatedNotifier;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;
    info!(stage = "storage", "database connected");

    let notifier = Arc::new(SimulatedNotifier::new(config.notify_delay));
    let (queue, worker) = notify::start(config.queue_capacity, notifier, config.notify_timeout);

    let admission = CancellationToken::new();
    let state = router::AppState::new(
        metrics,
        Arc::new(database.products()),
        queue.clone(),
        admission.clone(),
    );

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(
        stage = "app",
        addr = %config.bind_addr,
        env = %config.environment.as_str(),
        queue_capacity = config.queue_capacity,
        "starting HTTP server"
    );

    let settings = ShutdownSettings {
        graceful_timeout: config.shutdown_timeout,
        drain_timeout: config.drain_timeout,
    };
    let report = Lifecycle::new(
        listener,
        router::app_router(state),
        queue,
        worker,
        admission,
        settings,
    )
    .run(lifecycle::shutdown_signal())
    .await?;

    database.close().await;
    info!(
        stage = "app",
        server_forced = report.server_forced,
        drain_timed_out = report.drain_timed_out,
        abandoned_events = report.abandoned_events,
        "exiting"
    );
    Ok(())
}
