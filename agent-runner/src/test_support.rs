//! Shared helpers for unit tests

use agent_broker::{
    Broker, BrokerError, Consumer, ConsumerOptions, MemoryBroker, QueueStatus, Topology,
};
use agent_core::{GraderRequest, GraderResponse, GradingError};
use async_trait::async_trait;
use axum::Router;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;

use crate::grader::Grader;

pub fn memory_broker() -> MemoryBroker {
    MemoryBroker::new(Topology::default())
}

pub async fn publish_all<'a>(broker: &MemoryBroker, payloads: impl IntoIterator<Item = &'a str>) {
    for payload in payloads {
        broker.publish(payload.as_bytes()).await.unwrap();
    }
}

/// Serves `app` on an ephemeral local port
pub async fn spawn_http(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Log output captured for the current thread
pub struct CapturedLogs {
    buffer: LogBuffer,
    _guard: DefaultGuard,
}

impl CapturedLogs {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.0.lock().unwrap()).into_owned()
    }

    pub fn lines_containing(&self, needle: &str) -> Vec<String> {
        self.contents()
            .lines()
            .filter(|line| line.contains(needle))
            .map(str::to_string)
            .collect()
    }
}

/// Captures debug-level logs until the returned value is dropped
///
/// The subscriber is thread-local, which covers tasks spawned on a
/// current-thread test runtime.
pub fn capture_logs() -> CapturedLogs {
    let buffer = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(buffer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();

    CapturedLogs {
        buffer,
        _guard: tracing::subscriber::set_default(subscriber),
    }
}

/// Grader failing every request with the error built by `make_error`
pub struct FailingGrader<F> {
    make_error: F,
}

impl<F: Fn() -> GradingError + Send + Sync> FailingGrader<F> {
    pub fn new(make_error: F) -> Self {
        Self { make_error }
    }
}

#[async_trait]
impl<F: Fn() -> GradingError + Send + Sync> Grader for FailingGrader<F> {
    async fn grade(&self, _request: &GraderRequest) -> Result<GraderResponse, GradingError> {
        Err((self.make_error)())
    }

    fn describe(&self) -> String {
        "FailingGrader".to_string()
    }
}

/// Grader answering synchronously through a closure
pub struct FnGrader<F> {
    grade: F,
}

impl<F> FnGrader<F>
where
    F: Fn(&GraderRequest) -> Result<GraderResponse, GradingError> + Send + Sync,
{
    pub fn new(grade: F) -> Self {
        Self { grade }
    }
}

#[async_trait]
impl<F> Grader for FnGrader<F>
where
    F: Fn(&GraderRequest) -> Result<GraderResponse, GradingError> + Send + Sync,
{
    async fn grade(&self, request: &GraderRequest) -> Result<GraderResponse, GradingError> {
        (self.grade)(request)
    }

    fn describe(&self) -> String {
        "FnGrader".to_string()
    }
}

/// Grader with a fixed delay that records how many calls overlap
#[derive(Default)]
pub struct DelayGrader {
    delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
    calls: AtomicUsize,
}

impl DelayGrader {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Grader for DelayGrader {
    async fn grade(&self, _request: &GraderRequest) -> Result<GraderResponse, GradingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(GraderResponse::success(serde_json::json!("done")))
    }

    fn describe(&self) -> String {
        format!("DelayGrader: {:?}", self.delay)
    }
}

/// Grader that panics on its first `panics` calls, then succeeds
pub struct PanickingGrader {
    remaining: AtomicU32,
}

impl PanickingGrader {
    pub fn new(panics: u32) -> Self {
        Self {
            remaining: AtomicU32::new(panics),
        }
    }
}

#[async_trait]
impl Grader for PanickingGrader {
    async fn grade(&self, _request: &GraderRequest) -> Result<GraderResponse, GradingError> {
        let panicking = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if panicking {
            panic!("grader blew up");
        }
        Ok(GraderResponse::success(serde_json::json!("recovered")))
    }

    fn describe(&self) -> String {
        "PanickingGrader".to_string()
    }
}

/// Broker whose first `failures` consumer openings fail
pub struct FlakyBroker {
    inner: MemoryBroker,
    failures: AtomicU32,
}

impl FlakyBroker {
    pub fn new(inner: MemoryBroker, failures: u32) -> Self {
        Self {
            inner,
            failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl Broker for FlakyBroker {
    async fn open_consumer(
        &self,
        options: ConsumerOptions,
    ) -> agent_broker::Result<Box<dyn Consumer>> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BrokerError::Closed);
        }
        self.inner.open_consumer(options).await
    }

    async fn publish(&self, payload: &[u8]) -> agent_broker::Result<()> {
        self.inner.publish(payload).await
    }

    async fn queue_status(&self) -> agent_broker::Result<QueueStatus> {
        self.inner.queue_status().await
    }

    async fn close(&self) -> agent_broker::Result<()> {
        self.inner.close().await
    }

    fn describe(&self) -> String {
        format!("flaky+{}", self.inner.describe())
    }
}
