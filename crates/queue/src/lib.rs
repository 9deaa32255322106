//! Durable job-dispatch abstractions.
//!
//! ## Design
//!
//! - Jobs are free-form payloads with an id and a due time
//! - A scheduled-time index orders jobs by when they become deliverable
//! - Promotion moves a due job into an append-only delivery stream,
//!   atomically with its removal from the index
//! - A consumer group tracks delivery and acknowledgement per entry;
//!   unacknowledged entries stay pending for operator recovery
//! - At-least-once: a crash between stream-append and index-removal may
//!   surface a duplicate, never a loss
//!
//! ## Components
//!
//! - `JobEnvelope`: the wire shape of a promoted job
//! - `SchedulerStore` / `DeliveryStream`: backend seams for the two loops
//! - `BackendConnector`: per-loop connection factory with rollback support
//! - `InMemoryBackend`: reference implementation for tests/dev

pub mod envelope;
pub mod memory;
pub mod store;

pub use envelope::JobEnvelope;
pub use memory::InMemoryBackend;
pub use store::{
    BackendConnector, DeliveryStream, Disconnect, PendingEntry, QueueEntry, SchedulerStore,
    StoreError, StoreResult,
};
