//! Service orchestration: connects both loops' backends (rolling back a
//! half-started set), supervises them as named tasks, and shuts down in
//! order — signal, bounded wait, abort stragglers, close connections.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relayq_queue::store::{BackendConnector, DeliveryStream, Disconnect, StoreError};

use crate::consumer::{Consumer, ConsumerSettings, JobProcessor};
use crate::promoter::{Promoter, PromoterSettings};

/// Service tuning.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub promoter: PromoterSettings,
    pub consumer: ConsumerSettings,
    /// How long shutdown waits for each loop before aborting it.
    pub shutdown_timeout: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self::new(PromoterSettings::default(), ConsumerSettings::default())
    }
}

impl ServiceSettings {
    pub fn new(promoter: PromoterSettings, consumer: ConsumerSettings) -> Self {
        Self {
            promoter,
            consumer,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("dispatcher service is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Store(#[from] StoreError),
}

struct NamedTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

struct Running<B> {
    cancel: CancellationToken,
    tasks: Vec<NamedTask>,
    /// Connections to close after the tasks stop, in reverse start order.
    backends: Vec<Arc<B>>,
}

/// The dispatcher: one promoter loop and one consumer loop over separate
/// connections to the same backing store.
pub struct DispatcherService<C: BackendConnector, P> {
    connector: C,
    processor: P,
    settings: ServiceSettings,
    state: tokio::sync::Mutex<Option<Running<C::Backend>>>,
}

impl<C, P> DispatcherService<C, P>
where
    C: BackendConnector,
    P: JobProcessor + Clone + 'static,
{
    pub fn new(connector: C, processor: P, settings: ServiceSettings) -> Self {
        Self {
            connector,
            processor,
            settings,
            state: tokio::sync::Mutex::new(None),
        }
    }

    /// Connect both backends and start the loops.
    ///
    /// Connections are rolled back if startup fails partway: a promoter
    /// connection never outlives a failed consumer connect.
    pub async fn start(&self) -> Result<(), ServiceError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(ServiceError::AlreadyRunning);
        }
        info!("starting dispatcher service");

        let promoter_backend = Arc::new(self.connector.connect().await?);
        let consumer_backend = match self.connector.connect().await {
            Ok(backend) => Arc::new(backend),
            Err(e) => {
                promoter_backend.close().await;
                return Err(e.into());
            }
        };

        if let Err(e) = consumer_backend.ensure_group().await {
            consumer_backend.close().await;
            promoter_backend.close().await;
            return Err(e.into());
        }

        let cancel = CancellationToken::new();

        let promoter = Promoter::new(promoter_backend.clone(), self.settings.promoter.clone());
        let promoter_task = spawn_named("promoter", {
            let cancel = cancel.clone();
            async move { promoter.run(cancel).await }
        });

        let consumer = Consumer::new(
            consumer_backend.clone(),
            self.processor.clone(),
            self.settings.consumer.clone(),
        );
        let consumer_task = spawn_named("consumer", {
            let cancel = cancel.clone();
            async move { consumer.run(cancel).await }
        });

        *state = Some(Running {
            cancel,
            tasks: vec![promoter_task, consumer_task],
            backends: vec![promoter_backend, consumer_backend],
        });

        info!("dispatcher service started");
        Ok(())
    }

    /// Stop the service. Idempotent: a second call returns immediately.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        let Some(running) = state.take() else {
            debug!("stop requested but service is not running");
            return;
        };
        info!("stopping dispatcher service");

        // Signal both loops, then give each its current iteration.
        running.cancel.cancel();
        for task in running.tasks {
            let mut handle = task.handle;
            match timeout(self.settings.shutdown_timeout, &mut handle).await {
                Ok(Ok(())) => debug!(task = task.name, "task stopped"),
                Ok(Err(e)) => error!(task = task.name, error = %e, "task failed"),
                Err(_) => {
                    warn!(task = task.name, "task did not finish in time; aborting");
                    handle.abort();
                    let _ = handle.await;
                }
            }
        }

        // Disconnect only after the loops are down, newest first.
        for backend in running.backends.iter().rev() {
            backend.close().await;
        }

        info!("dispatcher service stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.is_some()
    }
}

fn spawn_named(name: &'static str, fut: impl Future<Output = ()> + Send + 'static) -> NamedTask {
    let handle = tokio::spawn(async move {
        fut.await;
        debug!(task = name, "task finished");
    });
    NamedTask { name, handle }
}
