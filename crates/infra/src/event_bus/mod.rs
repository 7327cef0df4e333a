//! Infrastructure event publisher implementations.
//!
//! The publisher contract and the in-memory bus live in `companies-events`.
//! This module provides broker-backed implementations (e.g. Redis).

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsError, RedisStreamsPublisher};
