//! Order consumption pipeline: retrying dispatcher, dead-letter routing and live
//! price statistics.
//!
//! ## Components
//!
//! - `PriceAggregator`: thread-safe count / average / min / max over successful orders
//! - `RetryTracker`: per-order attempt counts and the bounded-retry decision
//! - `DeadLetterRouter`: publishes exhausted orders, unchanged, to a secondary stream
//! - `Dispatcher`: poll → handle (retry / dead-letter) → commit loop
//! - `spawn_dispatcher`: runs a dispatcher on its own thread behind a `DispatcherHandle`

pub mod aggregator;
pub mod dead_letter;
pub mod dispatcher;
pub mod processor;
pub mod retry;
pub mod shutdown;
pub mod worker;


pub use aggregator::{PriceAggregator, PriceSnapshot};
pub use dead_letter::{DeadLetterError, DeadLetterRouter};
pub use dispatcher::{DispatchError, Dispatcher, DispatcherConfig, DispatcherStats, Resolution};
pub use processor::{OrderProcessor, ProcessError, ProcessOutcome, SimulatedProcessor};
pub use retry::{BackoffStrategy, RetryPolicy, RetryTracker};
pub use shutdown::{ShutdownSignal, SleepOutcome};
pub use worker::{DispatcherHandle, spawn_dispatcher};
