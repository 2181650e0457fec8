//! Two-level stop signal shared between a worker and whoever controls it.
//!
//! - `request_stop`: graceful. Workers finish the batch in hand (including any
//!   retries) and exit at the next batch boundary.
//! - `interrupt`: hard. Also cuts short any backoff sleep in progress.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct SignalState {
    stop: bool,
    interrupted: bool,
}

/// Result of an interruptible sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    Elapsed,
    Interrupted,
}

#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<(Mutex<SignalState>, Condvar)>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SignalState> {
        self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn request_stop(&self) {
        self.state().stop = true;
        self.inner.1.notify_all();
    }

    /// Stop and abort in-progress backoff sleeps.
    pub fn interrupt(&self) {
        {
            let mut state = self.state();
            state.stop = true;
            state.interrupted = true;
        }
        self.inner.1.notify_all();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.state().stop
    }

    pub fn is_interrupted(&self) -> bool {
        self.state().interrupted
    }

    /// Sleep for `duration` unless interrupted first.
    pub fn sleep(&self, duration: Duration) -> SleepOutcome {
        self.wait(duration, |s| s.interrupted)
    }

    /// Sleep for `duration` unless a stop (graceful or not) is requested first.
    pub fn sleep_until_stop(&self, duration: Duration) -> SleepOutcome {
        self.wait(duration, |s| s.stop)
    }

    fn wait(&self, duration: Duration, cut_short: impl Fn(&SignalState) -> bool) -> SleepOutcome {
        let deadline = Instant::now() + duration;
        let mut state = self.state();
        loop {
            if cut_short(&*state) {
                return SleepOutcome::Interrupted;
            }
            let now = Instant::now();
            if now >= deadline {
                return SleepOutcome::Elapsed;
            }
            state = match self.inner.1.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}
