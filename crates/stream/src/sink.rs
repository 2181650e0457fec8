//! Publishing side of an order stream.

use std::sync::Arc;

use orderflow_core::{Order, OrderId};

use crate::error::StreamError;

/// Acknowledgment of a published order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub destination: String,
    pub partition: u32,
    /// Transport-specific position of the record (offset, stream entry id, ...).
    pub position: String,
}

/// Synchronous publish capability.
///
/// `publish` returns only once the transport has acknowledged the write, so a
/// failure is always observable by the caller. Used by the producer and by the
/// dead-letter router.
///
/// Implementations must be `Send + Sync`; several threads may publish concurrently.
pub trait PublishSink: Send + Sync {
    fn publish(&self, destination: &str, key: &OrderId, order: &Order) -> Result<Ack, StreamError>;
}

impl<K> PublishSink for Arc<K>
where
    K: PublishSink + ?Sized,
{
    fn publish(&self, destination: &str, key: &OrderId, order: &Order) -> Result<Ack, StreamError> {
        (**self).publish(destination, key, order)
    }
}
