//! Infrastructure layer: configuration and the Redis backend.

pub mod config;
pub mod redis_backend;

pub use config::{Config, ConfigError};
pub use redis_backend::{RedisBackend, RedisConnector};
