//! Broker-backed order transports.
//!
//! The transport abstractions (`OrderSource`, `PublishSink`) live in `orderflow-stream` as
//! pure mechanics. This module provides infrastructure-backed implementations (Redis).

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsConsumer, RedisStreamsPublisher, stream_key};
