use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use tracing::{error, info};

use orderflow_stream::{OrderSource, PublishSink, Waker};

use crate::dispatcher::{DispatchError, Dispatcher, DispatcherStats};
use crate::processor::OrderProcessor;
use crate::shutdown::ShutdownSignal;

/// Handle to control and join a dispatcher running on its own thread.
#[derive(Debug)]
pub struct DispatcherHandle {
    name: String,
    shutdown: ShutdownSignal,
    waker: Option<Waker>,
    stats: Arc<Mutex<DispatcherStats>>,
    join: Option<thread::JoinHandle<Result<DispatcherStats, DispatchError>>>,
}

impl DispatcherHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request a graceful stop: the batch in hand finishes (retries included) and is
    /// committed before the thread exits.
    pub fn shutdown(&self) {
        self.shutdown.request_stop();
        self.wake();
    }

    /// Stop as soon as possible: a pending backoff is cut short and its batch is left
    /// uncommitted.
    pub fn interrupt(&self) {
        self.shutdown.interrupt();
        self.wake();
    }

    /// Waker of the dispatcher's source, if it has one.
    pub fn waker(&self) -> Option<Waker> {
        self.waker.clone()
    }

    fn wake(&self) {
        if let Some(waker) = &self.waker {
            waker.wake();
        }
    }

    /// Live statistics of the running dispatcher.
    pub fn stats(&self) -> DispatcherStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }

    /// Wait for the dispatcher thread to exit (does not request a stop by itself).
    pub fn join(mut self) -> Result<DispatcherStats, DispatchError> {
        let Some(join) = self.join.take() else {
            return Ok(self.stats());
        };
        match join.join() {
            Ok(result) => result,
            Err(_) => {
                error!(worker = %self.name, "dispatcher thread panicked");
                Err(DispatchError::WorkerPanicked(self.name.clone()))
            }
        }
    }
}

/// Spawn `dispatcher` on a named thread.
///
/// The returned handle shares the dispatcher's shutdown signal, so stopping through
/// the handle or through any clone of that signal is equivalent.
pub fn spawn_dispatcher<S, P, K>(
    name: impl Into<String>,
    mut dispatcher: Dispatcher<S, P, K>,
) -> std::io::Result<DispatcherHandle>
where
    S: OrderSource + 'static,
    P: OrderProcessor + 'static,
    K: PublishSink + 'static,
{
    let name = name.into();
    let shutdown = dispatcher.shutdown_signal();
    let waker = dispatcher.waker();
    let stats = dispatcher.stats_handle();

    let join = thread::Builder::new()
        .name(name.clone())
        .spawn(move || dispatcher.run())?;

    info!(worker = %name, "dispatcher thread spawned");

    Ok(DispatcherHandle {
        name,
        shutdown,
        waker,
        stats,
        join: Some(join),
    })
}
