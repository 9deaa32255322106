//! Backend seams for the dispatch pipeline.
//!
//! The promoter and the consumer loops never share in-process state: each
//! holds its own backend connection and all coordination goes through the
//! store's atomic primitives. These traits are the two loops' views of
//! that store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use relayq_core::{EntryId, JobId, JobPayload};

use crate::envelope::JobEnvelope;

/// Result type used across the storage layer.
pub type StoreResult<T> = Result<T, StoreError>;

/// Storage layer error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

/// An entry read from the delivery stream: the backend-assigned id plus the
/// raw field map (decoded into a [`JobEnvelope`] by the consumer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: EntryId,
    pub fields: BTreeMap<String, String>,
}

/// A delivered-but-unacknowledged entry, for operator inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: EntryId,
    pub consumer: String,
    pub idle_ms: u64,
    pub deliveries: u64,
}

/// The promoter's (and producer's) view of the backing store: job payload
/// records plus the scheduled-time index.
#[async_trait]
pub trait SchedulerStore: Send + Sync {
    /// Idempotent upsert of a job payload. Side effect only; payload
    /// lifetime is controlled by the producer, not the store.
    async fn put_job(&self, job_id: &JobId, payload: &JobPayload) -> StoreResult<()>;

    /// Fetch a payload. Absence is `Ok(None)`, never an error: it signals a
    /// stale index entry that the promoter prunes.
    async fn job(&self, job_id: &JobId) -> StoreResult<Option<JobPayload>>;

    /// Producer entry point: write the payload record and the scheduling
    /// entry together, so neither can exist without the other having been
    /// attempted. Re-scheduling an id updates its due time in place.
    async fn schedule(
        &self,
        job_id: &JobId,
        payload: &JobPayload,
        due_time: i64,
    ) -> StoreResult<()>;

    /// Up to `limit` index entries with due time <= `now`, ascending by due
    /// time.
    async fn due_jobs(&self, now: i64, limit: usize) -> StoreResult<Vec<(JobId, i64)>>;

    /// Remove a scheduling entry. Returns whether it existed.
    async fn remove_scheduled(&self, job_id: &JobId) -> StoreResult<bool>;

    /// Atomically append the envelope to the delivery stream AND remove the
    /// job from the scheduled index. All-or-nothing: a crash may surface
    /// the job again (at-least-once) but never lose it.
    async fn promote(&self, envelope: &JobEnvelope) -> StoreResult<()>;
}

/// The consumer's view of the backing store: the delivery stream read
/// through a named consumer group.
#[async_trait]
pub trait DeliveryStream: Send + Sync {
    /// Create the consumer group at the stream tail ("only new entries"),
    /// creating the stream itself if absent. Idempotent: "already exists"
    /// is success and never resets the group's cursor.
    async fn ensure_group(&self) -> StoreResult<()>;

    /// Wait cooperatively up to `block` for new entries and return up to
    /// `count` of them. An empty vec means the block elapsed with nothing
    /// new. Returned entries go onto this consumer's pending list until
    /// acknowledged.
    async fn read_new(&self, count: usize, block: Duration) -> StoreResult<Vec<QueueEntry>>;

    /// Mark an entry done for this consumer group. Returns whether it was
    /// actually pending (false if already acknowledged or unknown).
    async fn acknowledge(&self, entry_id: &EntryId) -> StoreResult<bool>;

    /// Delivered-but-unacknowledged entries for the group, oldest first.
    /// Inspection only; claim/replay tooling lives outside this crate.
    async fn pending(&self, count: usize) -> StoreResult<Vec<PendingEntry>>;
}

/// Connection release. Safe to call more than once.
#[async_trait]
pub trait Disconnect: Send + Sync {
    async fn close(&self);
}

/// Factory for per-loop backend connections.
///
/// The service connects the promoter's backend and the consumer's backend
/// separately at startup, and rolls the first back if the second fails, so
/// `connect` must hand out independent connections.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    type Backend: SchedulerStore + DeliveryStream + Disconnect + Send + Sync + 'static;

    async fn connect(&self) -> StoreResult<Self::Backend>;
}

#[async_trait]
impl<C: BackendConnector> BackendConnector for Arc<C> {
    type Backend = C::Backend;

    async fn connect(&self) -> StoreResult<Self::Backend> {
        (**self).connect().await
    }
}
