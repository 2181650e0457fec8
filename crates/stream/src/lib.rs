//! Order stream abstractions (mechanics only).
//!
//! The pipeline consumes orders through [`OrderSource`] and publishes through
//! [`PublishSink`]. Broker-backed implementations live in `orderflow-infra`; the
//! in-memory broker here is for tests and local runs.

pub mod error;
pub mod in_memory;
pub mod partition;
pub mod sink;
pub mod source;

pub use error::StreamError;
pub use in_memory::{InMemoryBroker, InMemoryConsumer};
pub use partition::partition_for;
pub use sink::{Ack, PublishSink};
pub use source::{OrderSource, Waker};
