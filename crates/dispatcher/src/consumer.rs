//! Delivery-stream consumer: reads new entries through the consumer group,
//! hands each job to the processor, and acknowledges only on success.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relayq_core::EntryId;
use relayq_queue::envelope::JobEnvelope;
use relayq_queue::store::{DeliveryStream, QueueEntry};

/// Consumer tuning.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Maximum entries per read.
    pub read_count: usize,
    /// How long one read blocks waiting for new entries.
    pub block: Duration,
    /// Delay after an empty read, so an idle stream is not busy-polled.
    pub idle_delay: Duration,
    /// Delay after a failed read, so a down backend is not hammered.
    pub error_delay: Duration,
    /// Delay after a failed job, so an erroring entry does not induce a
    /// tight retry loop.
    pub failure_delay: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            read_count: 25,
            block: Duration::from_secs(2),
            idle_delay: Duration::from_millis(100),
            error_delay: Duration::from_secs(1),
            failure_delay: Duration::from_millis(500),
        }
    }
}

/// The delivery side effect: the seam to the external messaging
/// collaborator.
///
/// An `Err` means the entry is left unacknowledged on the pending list,
/// available for operator-driven recovery; it never stops the loop.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, entry_id: &EntryId, job: &JobEnvelope) -> anyhow::Result<()>;
}

/// Default processor: records the job instead of calling a provider.
/// Stands in for the messaging collaborator in dev and tests.
#[derive(Debug, Clone, Default)]
pub struct DeliveryLogger;

#[async_trait]
impl JobProcessor for DeliveryLogger {
    async fn process(&self, entry_id: &EntryId, job: &JobEnvelope) -> anyhow::Result<()> {
        let rendered = serde_json::to_string(job)?;
        info!(
            entry_id = %entry_id,
            job_id = %job.job_id,
            kind = job.payload.get("kind").unwrap_or_default(),
            job = %rendered,
            "delivering job"
        );
        Ok(())
    }
}

/// Pulls batches from the delivery stream and processes each entry,
/// acknowledging only after the processor succeeded.
pub struct Consumer<Q, P> {
    queue: Arc<Q>,
    processor: P,
    settings: ConsumerSettings,
}

impl<Q: DeliveryStream, P: JobProcessor> Consumer<Q, P> {
    pub fn new(queue: Arc<Q>, processor: P, settings: ConsumerSettings) -> Self {
        Self {
            queue,
            processor,
            settings,
        }
    }

    /// Run until cancelled. Cancellation is checked once per outer
    /// iteration; an in-flight read or job is allowed to complete.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("consumer loop started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self
                .queue
                .read_new(self.settings.read_count, self.settings.block)
                .await
            {
                Ok(entries) if entries.is_empty() => {
                    // Tiny delay to avoid busy spinning when idle.
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.idle_delay) => {}
                    }
                }
                Ok(entries) => {
                    for entry in entries {
                        if !self.handle_entry(&entry).await {
                            tokio::time::sleep(self.settings.failure_delay).await;
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "error reading from delivery stream");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.error_delay) => {}
                    }
                }
            }
        }

        info!("consumer loop stopped");
    }

    /// Process one entry. Returns false when it was left pending.
    async fn handle_entry(&self, entry: &QueueEntry) -> bool {
        let job = JobEnvelope::decode(&entry.fields);
        debug!(entry_id = %entry.id, job_id = %job.job_id, "processing entry");

        if let Err(e) = self.processor.process(&entry.id, &job).await {
            // Not acknowledged: the entry stays on the pending list for
            // recovery, and its siblings are unaffected.
            error!(
                entry_id = %entry.id,
                job_id = %job.job_id,
                error = %format!("{e:#}"),
                "job processing failed; leaving entry pending"
            );
            return false;
        }

        match self.queue.acknowledge(&entry.id).await {
            Ok(true) => {
                debug!(entry_id = %entry.id, "entry acknowledged");
                true
            }
            Ok(false) => {
                warn!(entry_id = %entry.id, "acknowledged entry was not pending");
                true
            }
            Err(e) => {
                // Processed but not acknowledged: it will resurface as
                // pending, and redelivery is the accepted at-least-once
                // outcome.
                error!(entry_id = %entry.id, error = %e, "failed to acknowledge entry");
                false
            }
        }
    }
}
