//! The processing step applied to each order.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::warn;

use orderflow_core::Order;

/// Explicit result of processing one order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Success,
    /// The step ran but reported failure (retried like an error).
    Failure(String),
}

/// The processing step raised an error (retried like an explicit failure).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("processing failed: {0}")]
pub struct ProcessError(pub String);

impl ProcessError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Business step run for every consumed order.
///
/// Errors and `ProcessOutcome::Failure` are treated the same way by the dispatcher.
pub trait OrderProcessor: Send {
    fn process(&self, order: &Order) -> Result<ProcessOutcome, ProcessError>;
}

impl<F> OrderProcessor for F
where
    F: Fn(&Order) -> Result<ProcessOutcome, ProcessError> + Send,
{
    fn process(&self, order: &Order) -> Result<ProcessOutcome, ProcessError> {
        self(order)
    }
}

/// Stand-in processing step for demos and load runs: fails at random, otherwise
/// spends a fixed amount of work time.
#[derive(Debug, Clone)]
pub struct SimulatedProcessor {
    failure_rate: f64,
    work: Duration,
}

impl SimulatedProcessor {
    pub fn new(failure_rate: f64, work: Duration) -> Self {
        let failure_rate = if failure_rate.is_nan() {
            0.0
        } else {
            failure_rate.clamp(0.0, 1.0)
        };
        Self { failure_rate, work }
    }

    pub fn failure_rate(&self) -> f64 {
        self.failure_rate
    }
}

impl Default for SimulatedProcessor {
    fn default() -> Self {
        Self::new(0.1, Duration::from_millis(50))
    }
}

impl OrderProcessor for SimulatedProcessor {
    fn process(&self, order: &Order) -> Result<ProcessOutcome, ProcessError> {
        if rand::thread_rng().gen_bool(self.failure_rate) {
            warn!(order_id = %order.order_id(), "simulated temporary failure");
            return Ok(ProcessOutcome::Failure("simulated temporary failure".to_string()));
        }
        if !self.work.is_zero() {
            std::thread::sleep(self.work);
        }
        Ok(ProcessOutcome::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use orderflow_core::{OrderId, Price};

    fn order() -> Order {
        Order::new(OrderId::new(), "Item1", Price::from_cents(100).unwrap(), Utc::now()).unwrap()
    }

    #[test]
    fn zero_failure_rate_always_succeeds() {
        let p = SimulatedProcessor::new(0.0, Duration::ZERO);
        for _ in 0..100 {
            assert_eq!(p.process(&order()).unwrap(), ProcessOutcome::Success);
        }
    }

    #[test]
    fn full_failure_rate_always_fails() {
        let p = SimulatedProcessor::new(1.0, Duration::ZERO);
        for _ in 0..100 {
            assert!(matches!(p.process(&order()).unwrap(), ProcessOutcome::Failure(_)));
        }
    }

    #[test]
    fn failure_rate_is_clamped() {
        assert_eq!(SimulatedProcessor::new(7.0, Duration::ZERO).failure_rate(), 1.0);
        assert_eq!(SimulatedProcessor::new(-1.0, Duration::ZERO).failure_rate(), 0.0);
    }

    #[test]
    fn closures_are_processors() {
        let p = |o: &Order| {
            if o.product() == "Item1" {
                Err(ProcessError::new("boom"))
            } else {
                Ok(ProcessOutcome::Success)
            }
        };
        assert_eq!(p.process(&order()), Err(ProcessError::new("boom")));
    }
}
