//! Dead-letter routing for orders that exhausted their retries.

use thiserror::Error;
use tracing::{error, info, instrument};

use orderflow_core::{Order, OrderId};
use orderflow_stream::{Ack, PublishSink, StreamError};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("failed to dead-letter order {order_id} to {destination}: {source}")]
pub struct DeadLetterError {
    pub order_id: OrderId,
    pub destination: String,
    #[source]
    pub source: StreamError,
}

/// Publishes orders, unchanged and keyed by their id, to the dead-letter destination.
///
/// Publishing waits for the transport's acknowledgment. A failed publish is logged and
/// returned; the order is **not** requeued, so this is the one path where an order is
/// lost.
#[derive(Debug)]
pub struct DeadLetterRouter<K> {
    sink: K,
    destination: String,
}

impl<K> DeadLetterRouter<K> {
    pub fn new(sink: K, destination: impl Into<String>) -> Self {
        Self {
            sink,
            destination: destination.into(),
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }
}

impl<K> DeadLetterRouter<K>
where
    K: PublishSink,
{
    #[instrument(skip(self, order), fields(order_id = %order.order_id(), destination = %self.destination))]
    pub fn send(&self, order: &Order) -> Result<Ack, DeadLetterError> {
        match self.sink.publish(&self.destination, order.order_id(), order) {
            Ok(ack) => {
                info!(partition = ack.partition, position = %ack.position, "order sent to dead-letter stream");
                Ok(ack)
            }
            Err(e) => {
                error!(error = %e, "ORDER LOST: dead-letter publish failed, order dropped");
                Err(DeadLetterError {
                    order_id: order.order_id().clone(),
                    destination: self.destination.clone(),
                    source: e,
                })
            }
        }
    }
}
