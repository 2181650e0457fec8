//! Wiring for the `order-consumer` and `order-producer` executables.

pub mod consumer;
pub mod generator;

pub use consumer::{ConsumerPool, PoolReport, PoolStopper, WorkerOutcome, assign_partitions};
pub use generator::{OrderFactory, ProducerReport, run_producer};
