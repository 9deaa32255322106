//! `relayq-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure
//! concerns): identifiers, job payloads, and epoch-time helpers shared by
//! every layer.

pub mod id;
pub mod payload;
pub mod time;

pub use id::{EntryId, JobId};
pub use payload::JobPayload;
pub use time::unix_now;
