//! Fakes shared by the unit tests of the app crate.

use std::{
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use stock_notify_core::{NewProduct, NotificationEvent, Product};
use stock_notify_storage::{ProductStore, StoreError};
use tokio::sync::{watch, Notify, Semaphore};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;

use crate::notify::{notifier::NotifyError, Notifier};

pub fn event(id: i64) -> NotificationEvent {
    let product = Product {
        id: Some(id),
        name: format!("product-{id}"),
        price: 10.0,
        stock: 1,
    };
    NotificationEvent::for_product(&product, Utc::now()).expect("persisted product")
}

/// Formatted log output of the current thread, kept while the guard lives.
#[derive(Clone, Default)]
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub fn install() -> (Self, DefaultGuard) {
        let capture = Self::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(capture.clone())
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::INFO)
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (capture, guard)
    }

    pub fn lines(&self) -> Vec<String> {
        let buffer = self.buffer.lock().expect("log lock");
        String::from_utf8_lossy(&buffer)
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Index of the first line containing every needle.
    pub fn position(&self, needles: &[&str]) -> Option<usize> {
        self.lines()
            .iter()
            .position(|line| needles.iter().all(|needle| line.contains(needle)))
    }

    pub fn count(&self, needle: &str) -> usize {
        self.lines()
            .iter()
            .filter(|line| line.contains(needle))
            .count()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().expect("log lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// In-memory store handing out sequential ids.
#[derive(Default)]
pub struct FakeStore {
    calls: AtomicUsize,
    stored: Mutex<Vec<NewProduct>>,
    fail: bool,
    delay: Option<Duration>,
    entered: Notify,
}

impl FakeStore {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn stored_names(&self) -> Vec<String> {
        self.stored
            .lock()
            .expect("store lock")
            .iter()
            .map(|product| product.name().to_string())
            .collect()
    }

    /// Resolves once an insert has started.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }
}

#[async_trait]
impl ProductStore for FakeStore {
    async fn insert(&self, product: &NewProduct) -> Result<i64, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        let mut stored = self.stored.lock().expect("store lock");
        stored.push(product.clone());
        Ok(stored.len() as i64)
    }
}

/// Completes every notification immediately and remembers the order.
#[derive(Default)]
pub struct RecordingNotifier {
    ids: Mutex<Vec<i64>>,
    delay: Option<Duration>,
}

impl RecordingNotifier {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            ids: Mutex::default(),
            delay: Some(delay),
        }
    }

    pub fn ids(&self) -> Vec<i64> {
        self.ids.lock().expect("ids lock").clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.ids.lock().expect("ids lock").push(event.product_id());
        Ok(())
    }
}

/// Blocks every notification until the test hands out a permit.
pub struct GatedNotifier {
    permits: Semaphore,
    started: watch::Sender<usize>,
    ids: Mutex<Vec<i64>>,
}

impl Default for GatedNotifier {
    fn default() -> Self {
        let (started, _) = watch::channel(0);
        Self {
            permits: Semaphore::new(0),
            started,
            ids: Mutex::default(),
        }
    }
}

impl GatedNotifier {
    pub fn allow(&self, count: usize) {
        self.permits.add_permits(count);
    }

    pub fn release(&self) {
        self.permits.add_permits(1_000);
    }

    pub async fn wait_started(&self, count: usize) {
        let mut started = self.started.subscribe();
        started
            .wait_for(|started| *started >= count)
            .await
            .expect("notifier alive");
    }

    pub fn ids(&self) -> Vec<i64> {
        self.ids.lock().expect("ids lock").clone()
    }
}

#[async_trait]
impl Notifier for GatedNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        self.started.send_modify(|started| *started += 1);
        self.permits.acquire().await.expect("gate open").forget();
        self.ids.lock().expect("ids lock").push(event.product_id());
        Ok(())
    }
}

/// Fails the notification of one product and succeeds for the rest.
pub struct FlakyNotifier {
    failing_id: i64,
    attempted: Mutex<Vec<i64>>,
}

impl FlakyNotifier {
    pub fn failing_on(failing_id: i64) -> Self {
        Self {
            failing_id,
            attempted: Mutex::default(),
        }
    }

    pub fn attempted(&self) -> Vec<i64> {
        self.attempted.lock().expect("attempted lock").clone()
    }
}

#[async_trait]
impl Notifier for FlakyNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        self.attempted
            .lock()
            .expect("attempted lock")
            .push(event.product_id());
        if event.product_id() == self.failing_id {
            return Err(NotifyError::Failed {
                product_id: event.product_id(),
                reason: "downstream rejected".to_string(),
            });
        }
        Ok(())
    }
}
