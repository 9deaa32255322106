//! In-memory backend for tests/dev.
//!
//! Mirrors the production backend's semantics — including the atomicity of
//! [`SchedulerStore::promote`], which happens under a single lock — so the
//! loops can be exercised without a live store. Cloning a backend shares
//! the underlying state (one "server"); [`InMemoryBackend::handle`] hands
//! out an independent connection over that shared state.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use relayq_core::{EntryId, JobId, JobPayload};

use crate::envelope::JobEnvelope;
use crate::store::{
    BackendConnector, DeliveryStream, Disconnect, PendingEntry, QueueEntry, SchedulerStore,
    StoreError, StoreResult,
};

const DEFAULT_CONSUMER: &str = "memory-consumer";

#[derive(Debug)]
struct PendingState {
    consumer: String,
    delivered_at: Instant,
    deliveries: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index into the stream of the next entry to deliver.
    next_index: usize,
    pending: BTreeMap<EntryId, PendingState>,
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, JobPayload>,
    scheduled: BTreeMap<JobId, i64>,
    stream: Vec<(EntryId, BTreeMap<String, String>)>,
    group: Option<GroupState>,
    next_entry: u64,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    /// Bumped on every stream append; blocking readers watch it.
    version: watch::Sender<u64>,
}

/// In-memory job store + index + delivery stream.
#[derive(Debug, Clone)]
pub struct InMemoryBackend {
    shared: Arc<Shared>,
    consumer: String,
    closed: Arc<AtomicBool>,
    closes: Arc<AtomicUsize>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                version,
            }),
            consumer: DEFAULT_CONSUMER.to_string(),
            closed: Arc::new(AtomicBool::new(false)),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    /// An independent connection over the same shared state: its
    /// `close` tracking is its own, the data is not.
    pub fn handle(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            consumer: self.consumer.clone(),
            closed: Arc::new(AtomicBool::new(false)),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Whether this connection handle has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// How many times `close` has been called on this handle.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Number of entries currently in the stream.
    pub fn stream_len(&self) -> usize {
        self.lock().stream.len()
    }

    /// Number of entries currently in the scheduled index.
    pub fn scheduled_len(&self) -> usize {
        self.lock().scheduled.len()
    }

    /// Remove a payload record out-of-band, leaving any index entry behind.
    /// Test hook for the stale-index scenario.
    pub fn delete_job(&self, job_id: &JobId) {
        self.lock().jobs.remove(job_id);
    }

    /// Append raw fields to the stream without touching the index. Test
    /// hook for legacy-format entries and crash simulations.
    pub fn append_raw(&self, fields: BTreeMap<String, String>) -> EntryId {
        let id = {
            let mut state = self.lock();
            let id = Self::next_entry_id(&mut state);
            state.stream.push((id.clone(), fields));
            id
        };
        self.shared.version.send_modify(|v| *v += 1);
        id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.shared.state.lock().expect("in-memory state poisoned")
    }

    fn next_entry_id(state: &mut State) -> EntryId {
        state.next_entry += 1;
        EntryId::new(format!("{:016}-0", state.next_entry))
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SchedulerStore for InMemoryBackend {
    async fn put_job(&self, job_id: &JobId, payload: &JobPayload) -> StoreResult<()> {
        self.lock().jobs.insert(job_id.clone(), payload.clone());
        Ok(())
    }

    async fn job(&self, job_id: &JobId) -> StoreResult<Option<JobPayload>> {
        Ok(self.lock().jobs.get(job_id).cloned())
    }

    async fn schedule(
        &self,
        job_id: &JobId,
        payload: &JobPayload,
        due_time: i64,
    ) -> StoreResult<()> {
        let mut state = self.lock();
        state.jobs.insert(job_id.clone(), payload.clone());
        // Re-scheduling updates the due time; the index never duplicates.
        state.scheduled.insert(job_id.clone(), due_time);
        Ok(())
    }

    async fn due_jobs(&self, now: i64, limit: usize) -> StoreResult<Vec<(JobId, i64)>> {
        let state = self.lock();
        let mut due: Vec<(JobId, i64)> = state
            .scheduled
            .iter()
            .filter(|&(_, &t)| t <= now)
            .map(|(id, &t)| (id.clone(), t))
            .collect();
        due.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        due.truncate(limit);
        Ok(due)
    }

    async fn remove_scheduled(&self, job_id: &JobId) -> StoreResult<bool> {
        Ok(self.lock().scheduled.remove(job_id).is_some())
    }

    async fn promote(&self, envelope: &JobEnvelope) -> StoreResult<()> {
        let fields = envelope
            .to_fields()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        {
            // Append + index removal under one guard: the atomic move.
            let mut state = self.lock();
            let id = Self::next_entry_id(&mut state);
            state.stream.push((id, fields));
            state.scheduled.remove(&envelope.job_id);
        }
        self.shared.version.send_modify(|v| *v += 1);
        Ok(())
    }
}

#[async_trait]
impl DeliveryStream for InMemoryBackend {
    async fn ensure_group(&self) -> StoreResult<()> {
        let mut state = self.lock();
        if state.group.is_none() {
            let tail = state.stream.len();
            state.group = Some(GroupState {
                next_index: tail,
                pending: BTreeMap::new(),
            });
        }
        Ok(())
    }

    async fn read_new(&self, count: usize, block: Duration) -> StoreResult<Vec<QueueEntry>> {
        let deadline = Instant::now() + block;
        loop {
            // Subscribe before checking so an append between the check and
            // the wait still wakes us.
            let mut version = self.shared.version.subscribe();

            {
                let mut state = self.lock();
                let State { stream, group, .. } = &mut *state;
                let group = group.as_mut().ok_or_else(|| {
                    StoreError::Command("consumer group has not been created".to_string())
                })?;

                if group.next_index < stream.len() {
                    let take = count.min(stream.len() - group.next_index);
                    let mut out = Vec::with_capacity(take);
                    for (id, fields) in stream.iter().skip(group.next_index).take(take) {
                        group.pending.insert(
                            id.clone(),
                            PendingState {
                                consumer: self.consumer.clone(),
                                delivered_at: Instant::now(),
                                deliveries: 1,
                            },
                        );
                        out.push(QueueEntry {
                            id: id.clone(),
                            fields: fields.clone(),
                        });
                    }
                    group.next_index += take;
                    return Ok(out);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::select! {
                changed = version.changed() => {
                    if changed.is_err() {
                        return Ok(Vec::new());
                    }
                }
                _ = tokio::time::sleep(deadline - now) => return Ok(Vec::new()),
            }
        }
    }

    async fn acknowledge(&self, entry_id: &EntryId) -> StoreResult<bool> {
        let mut state = self.lock();
        match state.group.as_mut() {
            Some(group) => Ok(group.pending.remove(entry_id).is_some()),
            None => Ok(false),
        }
    }

    async fn pending(&self, count: usize) -> StoreResult<Vec<PendingEntry>> {
        let state = self.lock();
        let Some(group) = state.group.as_ref() else {
            return Ok(Vec::new());
        };
        Ok(group
            .pending
            .iter()
            .take(count)
            .map(|(id, p)| PendingEntry {
                id: id.clone(),
                consumer: p.consumer.clone(),
                idle_ms: p.delivered_at.elapsed().as_millis() as u64,
                deliveries: p.deliveries,
            })
            .collect())
    }
}

#[async_trait]
impl Disconnect for InMemoryBackend {
    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
        debug!("in-memory backend connection closed");
    }
}

/// Connector handing out independent handles over one shared backend.
#[derive(Debug, Clone)]
pub struct InMemoryConnector {
    backend: InMemoryBackend,
    connects: Arc<AtomicUsize>,
}

impl InMemoryConnector {
    pub fn new(backend: InMemoryBackend) -> Self {
        Self {
            backend,
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendConnector for InMemoryConnector {
    type Backend = InMemoryBackend;

    async fn connect(&self) -> StoreResult<InMemoryBackend> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.backend.handle())
    }
}
