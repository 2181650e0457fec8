//! Order consumption loop with bounded retries and dead-lettering.
//!
//! ## Loop
//!
//! ```text
//! loop (until stop requested)
//!   ↓
//! 1. Poll a bounded batch (blocks up to poll_timeout)
//!   ↓
//! 2. Handle every order in pull order:
//!      process → success  → aggregator, clear retry entry
//!              → failure  → record failure
//!                             < max_retries → backoff, process again
//!                             otherwise     → dead-letter, clear retry entry
//!   ↓
//! 3. Commit the batch once, after every order reached a terminal state
//! ```
//!
//! ## Guarantees
//!
//! - **No partial commits**: a batch is committed only when each of its orders was
//!   processed, dead-lettered or dropped. A crash mid-batch means redelivery.
//! - **Head-of-line blocking**: retries are synchronous, so an order that always fails
//!   holds its batch for `(max_retries - 1) × backoff` before it is dead-lettered.
//! - **Stops at batch boundaries**: a graceful stop lets the batch in hand finish,
//!   retries included. An interrupt aborts the current backoff; the order and the rest
//!   of its batch stay uncommitted and are redelivered to the next consumer.
//! - **Transport failures don't kill the loop**: poll/commit errors are logged and backed
//!   off exponentially; only a run of `max_consecutive_transport_failures` ends it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use orderflow_core::Order;
use orderflow_stream::{OrderSource, PublishSink, StreamError, Waker};

use crate::aggregator::PriceAggregator;
use crate::dead_letter::DeadLetterRouter;
use crate::processor::{OrderProcessor, ProcessOutcome};
use crate::retry::{RetryPolicy, RetryTracker};
use crate::shutdown::{ShutdownSignal, SleepOutcome};

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Name for logging
    pub name: String,
    /// Longest time a single poll may block
    pub poll_timeout: Duration,
    /// Per-order retry policy
    pub retry: RetryPolicy,
    /// Backoff after a failed poll or commit
    pub transport_backoff: RetryPolicy,
    /// Give up after this many poll/commit failures in a row (0 = never)
    pub max_consecutive_transport_failures: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "dispatcher".to_string(),
            poll_timeout: Duration::from_millis(1_000),
            retry: RetryPolicy::default(),
            transport_backoff: RetryPolicy::exponential(
                0,
                Duration::from_millis(500),
                Duration::from_secs(30),
            ),
            max_consecutive_transport_failures: 10,
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_transport_backoff(mut self, policy: RetryPolicy) -> Self {
        self.transport_backoff = policy;
        self
    }

    pub fn with_max_consecutive_transport_failures(mut self, max: u32) -> Self {
        self.max_consecutive_transport_failures = max;
        self
    }
}

/// Dispatcher runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub batches: u64,
    pub batches_committed: u64,
    pub orders_handled: u64,
    pub orders_succeeded: u64,
    /// Backoffs started (one per failed attempt that was retried)
    pub retries: u64,
    pub dead_lettered: u64,
    pub dead_letter_failures: u64,
    pub interrupted: u64,
    pub transport_failures: u64,
}

/// Terminal (or aborted) state of one order after `Dispatcher::handle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Processed { attempts: u32 },
    DeadLettered { attempts: u32 },
    /// Dead-letter publish failed; the order is lost.
    Dropped { attempts: u32 },
    /// Backoff was interrupted; the order is left for redelivery.
    Interrupted { attempts: u32 },
}

impl Resolution {
    pub fn attempts(&self) -> u32 {
        match *self {
            Resolution::Processed { attempts }
            | Resolution::DeadLettered { attempts }
            | Resolution::Dropped { attempts }
            | Resolution::Interrupted { attempts } => attempts,
        }
    }

    /// Whether the order reached a state that allows its batch to be committed.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Resolution::Interrupted { .. })
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("transport unavailable after {failures} consecutive failures: {last_error}")]
    TransportUnavailable {
        failures: u32,
        last_error: StreamError,
    },

    #[error("dispatcher thread {0} panicked")]
    WorkerPanicked(String),
}

/// Single-threaded consumer: owns its source, its processor and its retry state.
///
/// Scale out by running several dispatchers over disjoint partitions; they can share
/// one `PriceAggregator` and one `ShutdownSignal`.
pub struct Dispatcher<S, P, K> {
    source: S,
    processor: P,
    dead_letters: DeadLetterRouter<K>,
    aggregator: Arc<PriceAggregator>,
    retries: RetryTracker,
    config: DispatcherConfig,
    shutdown: ShutdownSignal,
    stats: Arc<Mutex<DispatcherStats>>,
    consecutive_transport_failures: u32,
}

impl<S, P, K> core::fmt::Debug for Dispatcher<S, P, K> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.config.name)
            .field("dead_letter_destination", &self.dead_letters.destination())
            .field("pending_retries", &self.retries.len())
            .finish_non_exhaustive()
    }
}

impl<S, P, K> Dispatcher<S, P, K>
where
    S: OrderSource,
    P: OrderProcessor,
    K: PublishSink,
{
    pub fn new(
        source: S,
        processor: P,
        dead_letters: DeadLetterRouter<K>,
        aggregator: Arc<PriceAggregator>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            source,
            processor,
            dead_letters,
            aggregator,
            retries: RetryTracker::new(),
            config,
            shutdown: ShutdownSignal::new(),
            stats: Arc::new(Mutex::new(DispatcherStats::default())),
            consecutive_transport_failures: 0,
        }
    }

    /// Use an externally owned signal (e.g. one shared by every worker).
    pub fn with_shutdown_signal(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown = signal;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Request a graceful stop (observed at the next batch boundary).
    pub fn shutdown(&self) {
        self.shutdown.request_stop();
        if let Some(waker) = self.source.waker() {
            waker.wake();
        }
    }

    pub fn waker(&self) -> Option<Waker> {
        self.source.waker()
    }

    pub fn stats(&self) -> DispatcherStats {
        lock_stats(&self.stats).clone()
    }

    pub(crate) fn stats_handle(&self) -> Arc<Mutex<DispatcherStats>> {
        Arc::clone(&self.stats)
    }

    pub fn retry_tracker(&self) -> &RetryTracker {
        &self.retries
    }

    pub fn into_source(self) -> S {
        self.source
    }

    fn bump(&self, update: impl FnOnce(&mut DispatcherStats)) {
        let mut stats = lock_stats(&self.stats);
        update(&mut *stats);
    }

    /// Run until a stop is requested.
    ///
    /// Returns the final statistics on a graceful stop or interrupt, and an error only
    /// when the transport failed `max_consecutive_transport_failures` times in a row.
    #[instrument(skip_all, fields(dispatcher = %self.config.name))]
    pub fn run(&mut self) -> Result<DispatcherStats, DispatchError> {
        info!(
            max_retries = self.config.retry.max_retries,
            backoff_ms = self.config.retry.backoff.as_millis() as u64,
            dead_letter_destination = %self.dead_letters.destination(),
            "dispatcher started"
        );

        let result = loop {
            if self.shutdown.is_stop_requested() {
                break Ok(());
            }

            let batch = match self.source.poll(self.config.poll_timeout) {
                Ok(batch) => batch,
                Err(e) => match self.on_transport_failure("poll", e) {
                    Ok(()) => continue,
                    Err(err) => break Err(err),
                },
            };

            if batch.is_empty() {
                self.consecutive_transport_failures = 0;
                continue;
            }

            self.bump(|s| s.batches += 1);

            if !self.handle_batch(&batch) {
                warn!(
                    batch_size = batch.len(),
                    "batch interrupted, left uncommitted for redelivery"
                );
                break Ok(());
            }

            match self.source.commit() {
                Ok(()) => {
                    self.consecutive_transport_failures = 0;
                    self.bump(|s| s.batches_committed += 1);
                    debug!(batch_size = batch.len(), "batch committed");
                }
                Err(e) => {
                    if let Err(err) = self.on_transport_failure("commit", e) {
                        break Err(err);
                    }
                }
            }
        };

        let stats = self.stats();
        match &result {
            Ok(()) => info!(
                orders_handled = stats.orders_handled,
                orders_succeeded = stats.orders_succeeded,
                dead_lettered = stats.dead_lettered,
                "dispatcher stopped"
            ),
            Err(e) => error!(error = %e, "dispatcher giving up"),
        }
        result.map(|()| stats)
    }

    /// Handle every order of a batch in order.
    ///
    /// Returns `false` as soon as an order is interrupted; the remaining orders are not
    /// touched and the batch must not be committed.
    pub fn handle_batch(&mut self, batch: &[Order]) -> bool {
        for order in batch {
            if !self.handle(order).is_terminal() {
                return false;
            }
        }
        true
    }

    /// Process one order to a resolution, retrying synchronously after each failure.
    pub fn handle(&mut self, order: &Order) -> Resolution {
        let id = order.order_id();
        self.bump(|s| s.orders_handled += 1);

        loop {
            let failure = match self.processor.process(order) {
                Ok(ProcessOutcome::Success) => None,
                Ok(ProcessOutcome::Failure(reason)) => Some(reason),
                Err(e) => Some(e.to_string()),
            };

            let Some(reason) = failure else {
                let attempts = self.retries.attempts(id).map_or(1, |n| n + 1);
                self.retries.clear(id);
                self.aggregator.add_price(order.price());
                self.bump(|s| s.orders_succeeded += 1);
                info!(
                    order_id = %id,
                    product = order.product(),
                    price = %order.price(),
                    attempts,
                    "order processed"
                );
                return Resolution::Processed { attempts };
            };

            let attempts = self.retries.record_failure(id);
            let max_retries = self.config.retry.max_retries;

            if RetryTracker::is_exhausted(attempts, max_retries) {
                self.retries.clear(id);
                error!(
                    order_id = %id,
                    attempts,
                    max_retries,
                    reason = %reason,
                    "max retries exceeded, routing order to dead-letter stream"
                );
                return match self.dead_letters.send(order) {
                    Ok(_) => {
                        self.bump(|s| s.dead_lettered += 1);
                        Resolution::DeadLettered { attempts }
                    }
                    Err(_) => {
                        self.bump(|s| s.dead_letter_failures += 1);
                        Resolution::Dropped { attempts }
                    }
                };
            }

            warn!(
                order_id = %id,
                attempt = attempts,
                max_retries,
                reason = %reason,
                "order failed, retrying after backoff"
            );
            self.bump(|s| s.retries += 1);

            let delay = self.config.retry.delay_for_attempt(attempts);
            if self.shutdown.sleep(delay) == SleepOutcome::Interrupted {
                self.retries.clear(id);
                self.bump(|s| s.interrupted += 1);
                warn!(
                    order_id = %id,
                    attempts,
                    "backoff interrupted, order left for redelivery"
                );
                return Resolution::Interrupted { attempts };
            }
        }
    }

    fn on_transport_failure(
        &mut self,
        operation: &'static str,
        e: StreamError,
    ) -> Result<(), DispatchError> {
        self.consecutive_transport_failures += 1;
        let failures = self.consecutive_transport_failures;
        self.bump(|s| s.transport_failures += 1);
        error!(operation, error = %e, consecutive_failures = failures, "transport failure");

        let max = self.config.max_consecutive_transport_failures;
        if max > 0 && failures >= max {
            return Err(DispatchError::TransportUnavailable {
                failures,
                last_error: e,
            });
        }

        let delay = self.config.transport_backoff.delay_for_attempt(failures);
        self.shutdown.sleep_until_stop(delay);
        Ok(())
    }
}

fn lock_stats(stats: &Mutex<DispatcherStats>) -> MutexGuard<'_, DispatcherStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}
