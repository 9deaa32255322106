//! relayq dispatcher: the two delivery loops and their orchestration.
//!
//! ## Design
//!
//! - The `Promoter` polls the scheduled index and moves due jobs into the
//!   delivery stream, atomically per job
//! - The `Consumer` reads new stream entries through a consumer group and
//!   acknowledges each only after its delivery side effect succeeded
//! - The loops share only the backing store; each holds its own
//!   connection, so a failure domain is one named task, never the process
//! - `DispatcherService` wires both up: startup with rollback, cooperative
//!   ordered shutdown, idempotent stop

pub mod consumer;
pub mod promoter;
pub mod service;

#[cfg(test)]
mod integration_tests;

pub use consumer::{Consumer, ConsumerSettings, DeliveryLogger, JobProcessor};
pub use promoter::{Promoter, PromoterSettings};
pub use service::{DispatcherService, ServiceError, ServiceSettings};
