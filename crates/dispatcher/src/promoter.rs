//! Job promoter: moves due jobs from the scheduled index into the
//! delivery stream.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relayq_core::{JobId, unix_now};
use relayq_queue::envelope::JobEnvelope;
use relayq_queue::store::{SchedulerStore, StoreResult};

/// Promoter tuning.
#[derive(Debug, Clone)]
pub struct PromoterSettings {
    /// How often to scan for due jobs.
    pub poll_interval: Duration,
    /// Maximum index entries fetched per batch.
    pub batch_limit: usize,
}

impl Default for PromoterSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_limit: 200,
        }
    }
}

impl PromoterSettings {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Moves due jobs from the scheduled index into the delivery stream,
/// atomically per job. Transient store errors are logged and retried on
/// the next poll; they never end the loop.
pub struct Promoter<S> {
    store: Arc<S>,
    settings: PromoterSettings,
}

impl<S: SchedulerStore> Promoter<S> {
    pub fn new(store: Arc<S>, settings: PromoterSettings) -> Self {
        Self { store, settings }
    }

    /// Run until cancelled. Each tick drains everything currently due.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(interval = ?self.settings.poll_interval, "promoter loop started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.promote_due(unix_now()).await {
                Ok(moved) if moved > 0 => info!(moved, "promoted due jobs"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "promoter tick failed"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        info!("promoter loop stopped");
    }

    /// One tick: process due jobs in bounded batches so a large backlog
    /// never blocks the scheduler for a long scan. Returns how many jobs
    /// were moved.
    pub async fn promote_due(&self, now: i64) -> StoreResult<u64> {
        let mut total = 0u64;

        loop {
            let batch = self.store.due_jobs(now, self.settings.batch_limit).await?;
            if batch.is_empty() {
                break;
            }
            debug!(count = batch.len(), "processing due jobs");

            let batch_len = batch.len();
            let mut moved_in_batch = 0u64;
            for (job_id, due_time) in batch {
                match self.promote_one(&job_id, due_time).await {
                    Ok(true) => moved_in_batch += 1,
                    Ok(false) => {}
                    Err(e) => {
                        // One job's failure never aborts its siblings.
                        error!(job_id = %job_id, error = %e, "failed to promote job");
                    }
                }
            }
            total += moved_in_batch;

            // A short batch means the index is drained. A batch that made
            // no progress means every entry is erroring or stale; the next
            // poll retries instead of this tick spinning on it.
            if batch_len < self.settings.batch_limit || moved_in_batch == 0 {
                break;
            }

            // Yield between batches.
            tokio::task::yield_now().await;
        }

        Ok(total)
    }

    /// Move a single job. Returns false when the index entry was stale
    /// (payload record gone) and was pruned instead.
    async fn promote_one(&self, job_id: &JobId, due_time: i64) -> StoreResult<bool> {
        let Some(payload) = self.store.job(job_id).await? else {
            warn!(job_id = %job_id, "payload record missing; pruning stale index entry");
            self.store.remove_scheduled(job_id).await?;
            return Ok(false);
        };

        let envelope = JobEnvelope::new(job_id.clone(), due_time, unix_now(), payload);
        self.store.promote(&envelope).await?;
        debug!(job_id = %job_id, "job moved to delivery stream");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use relayq_core::JobPayload;
    use relayq_queue::memory::InMemoryBackend;
    use relayq_queue::store::{DeliveryStream, StoreError};

    use super::*;

    fn promoter(backend: &InMemoryBackend) -> Promoter<InMemoryBackend> {
        Promoter::new(Arc::new(backend.handle()), PromoterSettings::default())
    }

    fn payload() -> JobPayload {
        JobPayload::new().with("kind", "appointment_reminder")
    }

    /// Delegating store that counts index fetches and can fail promotion
    /// of a chosen job.
    struct HookedStore {
        inner: InMemoryBackend,
        due_calls: AtomicUsize,
        fail_promote: Option<JobId>,
    }

    #[async_trait]
    impl SchedulerStore for HookedStore {
        async fn put_job(&self, job_id: &JobId, payload: &JobPayload) -> StoreResult<()> {
            self.inner.put_job(job_id, payload).await
        }

        async fn job(&self, job_id: &JobId) -> StoreResult<Option<JobPayload>> {
            self.inner.job(job_id).await
        }

        async fn schedule(
            &self,
            job_id: &JobId,
            payload: &JobPayload,
            due_time: i64,
        ) -> StoreResult<()> {
            self.inner.schedule(job_id, payload, due_time).await
        }

        async fn due_jobs(&self, now: i64, limit: usize) -> StoreResult<Vec<(JobId, i64)>> {
            self.due_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.due_jobs(now, limit).await
        }

        async fn remove_scheduled(&self, job_id: &JobId) -> StoreResult<bool> {
            self.inner.remove_scheduled(job_id).await
        }

        async fn promote(&self, envelope: &JobEnvelope) -> StoreResult<()> {
            if self.fail_promote.as_ref() == Some(&envelope.job_id) {
                return Err(StoreError::Command("injected promote failure".to_string()));
            }
            self.inner.promote(envelope).await
        }
    }

    #[tokio::test]
    async fn one_pass_moves_every_due_job_exactly_once() {
        let backend = InMemoryBackend::new();
        for (id, due) in [("a", 10), ("b", 20), ("c", 30)] {
            backend.schedule(&JobId::new(id), &payload(), due).await.unwrap();
        }
        backend.schedule(&JobId::new("future"), &payload(), 999).await.unwrap();

        let moved = promoter(&backend).promote_due(30).await.unwrap();

        assert_eq!(moved, 3);
        assert_eq!(backend.stream_len(), 3);
        // Only the future job is still scheduled.
        assert_eq!(backend.due_jobs(999, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn promoted_entries_carry_the_stamps() {
        let backend = InMemoryBackend::new();
        backend
            .schedule(&JobId::new("j1"), &payload().with("to", "+15550100"), 42)
            .await
            .unwrap();
        backend.ensure_group().await.unwrap();

        promoter(&backend).promote_due(100).await.unwrap();

        let entries = backend
            .read_new(10, Duration::from_millis(10))
            .await
            .unwrap();
        let job = JobEnvelope::decode(&entries[0].fields);
        assert_eq!(job.job_id, JobId::new("j1"));
        assert_eq!(job.scheduled_time, 42);
        assert!(job.processed_time > 0);
        assert_eq!(job.payload.get("to"), Some("+15550100"));
    }

    #[tokio::test]
    async fn stale_index_entry_is_pruned_without_a_queue_entry() {
        let backend = InMemoryBackend::new();
        let id = JobId::new("gone");
        backend.schedule(&id, &payload(), 10).await.unwrap();
        backend.delete_job(&id);

        let moved = promoter(&backend).promote_due(100).await.unwrap();

        assert_eq!(moved, 0);
        assert_eq!(backend.stream_len(), 0);
        assert_eq!(backend.scheduled_len(), 0);
    }

    #[tokio::test]
    async fn lingering_index_entry_surfaces_a_duplicate_never_a_loss() {
        // A crash strictly between stream-append and index-removal leaves
        // both the entry and the index behind; the next pass must promote
        // again rather than drop the job.
        let backend = InMemoryBackend::new();
        let id = JobId::new("j1");
        backend.schedule(&id, &payload(), 10).await.unwrap();

        let half_moved = JobEnvelope::new(id.clone(), 10, 11, payload());
        backend.append_raw(half_moved.to_fields().unwrap());
        assert_eq!(backend.scheduled_len(), 1);

        let moved = promoter(&backend).promote_due(100).await.unwrap();

        assert_eq!(moved, 1);
        assert_eq!(backend.stream_len(), 2);
        assert_eq!(backend.scheduled_len(), 0);
    }

    #[tokio::test]
    async fn a_tick_drains_the_backlog_in_capped_batches() {
        let backend = InMemoryBackend::new();
        for i in 0..450 {
            backend
                .schedule(&JobId::new(format!("job-{i:04}")), &payload(), 10)
                .await
                .unwrap();
        }

        let store = Arc::new(HookedStore {
            inner: backend.handle(),
            due_calls: AtomicUsize::new(0),
            fail_promote: None,
        });
        let promoter = Promoter::new(store.clone(), PromoterSettings::default());

        let moved = promoter.promote_due(100).await.unwrap();

        assert_eq!(moved, 450);
        assert_eq!(backend.stream_len(), 450);
        // 200 + 200 + 50: the short final batch ends the tick.
        assert_eq!(store.due_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn a_failing_job_does_not_abort_its_batch() {
        let backend = InMemoryBackend::new();
        backend.schedule(&JobId::new("bad"), &payload(), 10).await.unwrap();
        backend.schedule(&JobId::new("good"), &payload(), 20).await.unwrap();

        let store = Arc::new(HookedStore {
            inner: backend.handle(),
            due_calls: AtomicUsize::new(0),
            fail_promote: Some(JobId::new("bad")),
        });
        let promoter = Promoter::new(store, PromoterSettings::default());

        let moved = promoter.promote_due(100).await.unwrap();

        assert_eq!(moved, 1);
        assert_eq!(backend.stream_len(), 1);
        // The failed job stays scheduled for the next poll.
        assert_eq!(backend.due_jobs(100, 10).await.unwrap(), vec![(JobId::new("bad"), 10)]);
    }

    #[tokio::test]
    async fn run_stops_on_cancellation() {
        let backend = InMemoryBackend::new();
        let promoter = Promoter::new(
            Arc::new(backend),
            PromoterSettings::default().with_poll_interval(Duration::from_millis(5)),
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { promoter.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("promoter did not stop")
            .unwrap();
    }
}
