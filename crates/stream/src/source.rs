//! Consuming side of an order stream.

use std::sync::Arc;
use std::time::Duration;

use orderflow_core::Order;

use crate::error::StreamError;

/// A batch-oriented, at-least-once source of orders.
///
/// ## Contract
///
/// - `poll` returns up to a transport-defined number of orders, blocking for at most
///   `timeout` when nothing is available. An empty batch is a normal result.
/// - `commit` acknowledges **everything returned by `poll` since the last commit**.
///   Orders that were polled but never committed are redelivered to the next
///   consumer of the same group (e.g. after a crash or an interrupted batch).
/// - A source is owned by one consumer thread; it is `Send` but not shared.
///
/// Sources that can be woken from a blocked `poll` hand out a [`Waker`]. Sources
/// that can't rely on their bounded poll timeout instead.
pub trait OrderSource: Send {
    fn poll(&mut self, timeout: Duration) -> Result<Vec<Order>, StreamError>;

    fn commit(&mut self) -> Result<(), StreamError>;

    fn waker(&self) -> Option<Waker> {
        None
    }
}

impl<S> OrderSource for Box<S>
where
    S: OrderSource + ?Sized,
{
    fn poll(&mut self, timeout: Duration) -> Result<Vec<Order>, StreamError> {
        (**self).poll(timeout)
    }

    fn commit(&mut self) -> Result<(), StreamError> {
        (**self).commit()
    }

    fn waker(&self) -> Option<Waker> {
        (**self).waker()
    }
}

/// Thread-safe handle that unblocks a pending [`OrderSource::poll`].
#[derive(Clone)]
pub struct Waker(Arc<dyn Fn() + Send + Sync>);

impl Waker {
    pub fn new(wake: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(wake))
    }

    pub fn wake(&self) {
        (self.0)()
    }
}

impl core::fmt::Debug for Waker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Waker").finish_non_exhaustive()
    }
}
