//! Service-level scenarios over the in-memory backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use relayq_core::{EntryId, JobId, JobPayload};
use relayq_queue::envelope::JobEnvelope;
use relayq_queue::memory::{InMemoryBackend, InMemoryConnector};
use relayq_queue::store::{
    BackendConnector, DeliveryStream, SchedulerStore, StoreError, StoreResult,
};

use crate::consumer::{ConsumerSettings, JobProcessor};
use crate::promoter::PromoterSettings;
use crate::service::{DispatcherService, ServiceError, ServiceSettings};

/// Connector over one shared in-memory store that can be told to fail the
/// n-th connect, and remembers every handle it handed out.
struct ScriptedConnector {
    backend: InMemoryBackend,
    fail_on_attempt: Option<usize>,
    attempts: AtomicUsize,
    handles: Mutex<Vec<InMemoryBackend>>,
}

impl ScriptedConnector {
    fn new(backend: InMemoryBackend) -> Self {
        Self {
            backend,
            fail_on_attempt: None,
            attempts: AtomicUsize::new(0),
            handles: Mutex::new(Vec::new()),
        }
    }

    fn failing_on(mut self, attempt: usize) -> Self {
        self.fail_on_attempt = Some(attempt);
        self
    }

    fn handles(&self) -> Vec<InMemoryBackend> {
        self.handles.lock().unwrap().clone()
    }
}

#[async_trait]
impl BackendConnector for ScriptedConnector {
    type Backend = InMemoryBackend;

    async fn connect(&self) -> StoreResult<InMemoryBackend> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_attempt == Some(attempt) {
            return Err(StoreError::Connection("injected connect failure".to_string()));
        }
        let handle = self.backend.handle();
        self.handles.lock().unwrap().push(handle.clone());
        Ok(handle)
    }
}

#[derive(Clone, Default)]
struct RecordingProcessor {
    seen: Arc<Mutex<Vec<JobEnvelope>>>,
}

#[async_trait]
impl JobProcessor for RecordingProcessor {
    async fn process(&self, _entry_id: &EntryId, job: &JobEnvelope) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(job.clone());
        Ok(())
    }
}

fn fast_settings() -> ServiceSettings {
    let mut settings = ServiceSettings::new(
        PromoterSettings::default().with_poll_interval(Duration::from_millis(10)),
        ConsumerSettings {
            read_count: 10,
            block: Duration::from_millis(20),
            idle_delay: Duration::from_millis(5),
            error_delay: Duration::from_millis(5),
            failure_delay: Duration::from_millis(5),
        },
    );
    settings.shutdown_timeout = Duration::from_secs(1);
    settings
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn scheduled_jobs_flow_end_to_end() {
    let backend = InMemoryBackend::new();
    let connector = InMemoryConnector::new(backend.handle());
    let processor = RecordingProcessor::default();
    let service = DispatcherService::new(connector.clone(), processor.clone(), fast_settings());

    service.start().await.unwrap();
    assert_eq!(connector.connect_count(), 2);

    let producer = backend.handle();
    producer
        .schedule(
            &JobId::new("appt-1"),
            &JobPayload::new()
                .with("kind", "appointment_reminder")
                .with("to", "+15550100"),
            1, // long overdue
        )
        .await
        .unwrap();

    let seen = processor.seen.clone();
    wait_until(|| !seen.lock().unwrap().is_empty()).await;

    let job = seen.lock().unwrap()[0].clone();
    assert_eq!(job.job_id, JobId::new("appt-1"));
    assert_eq!(job.payload.get("to"), Some("+15550100"));

    // Promoted out of the index, delivered, acknowledged.
    assert_eq!(backend.scheduled_len(), 0);
    tokio::time::timeout(Duration::from_secs(2), async {
        while !backend.pending(10).await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("entry was not acknowledged in time");

    service.stop().await;
    assert!(!service.is_running().await);
}

#[tokio::test]
async fn failed_consumer_connect_rolls_back_the_promoter_connection() {
    let backend = InMemoryBackend::new();
    let connector = Arc::new(ScriptedConnector::new(backend).failing_on(2));
    let service = DispatcherService::new(
        connector.clone(),
        RecordingProcessor::default(),
        fast_settings(),
    );

    let err = service.start().await.unwrap_err();
    assert!(matches!(err, ServiceError::Store(StoreError::Connection(_))));

    // The one successful connection must not leak.
    let handles = connector.handles();
    assert_eq!(handles.len(), 1);
    assert!(handles[0].is_closed());
    assert!(!service.is_running().await);
}

#[tokio::test]
async fn stop_is_idempotent_and_disconnects_once() {
    let backend = InMemoryBackend::new();
    let connector = Arc::new(ScriptedConnector::new(backend));
    let service = DispatcherService::new(
        connector.clone(),
        RecordingProcessor::default(),
        fast_settings(),
    );

    service.start().await.unwrap();
    service.stop().await;
    service.stop().await;

    for handle in connector.handles() {
        assert!(handle.is_closed());
        assert_eq!(handle.close_count(), 1);
    }
}

#[tokio::test]
async fn starting_twice_is_an_error() {
    let backend = InMemoryBackend::new();
    let connector = Arc::new(ScriptedConnector::new(backend));
    let service = DispatcherService::new(
        connector,
        RecordingProcessor::default(),
        fast_settings(),
    );

    service.start().await.unwrap();
    assert!(matches!(
        service.start().await,
        Err(ServiceError::AlreadyRunning)
    ));

    service.stop().await;
}

#[tokio::test]
async fn stop_before_start_is_a_no_op() {
    let backend = InMemoryBackend::new();
    let connector = Arc::new(ScriptedConnector::new(backend));
    let service = DispatcherService::new(
        connector.clone(),
        RecordingProcessor::default(),
        fast_settings(),
    );

    service.stop().await;
    assert!(connector.handles().is_empty());
}
