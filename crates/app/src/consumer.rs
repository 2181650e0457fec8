//! Consumer pool behind `order-consumer`: N partitioned dispatcher threads sharing one
//! aggregator and one shutdown signal.

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use orderflow_infra::PipelineConfig;
use orderflow_pipeline::{
    DeadLetterRouter, DispatchError, Dispatcher, DispatcherHandle, DispatcherStats,
    PriceAggregator, PriceSnapshot, ShutdownSignal, SimulatedProcessor, spawn_dispatcher,
};
use orderflow_stream::{OrderSource, PublishSink, StreamError, Waker};

/// Split `partitions` round-robin across at most `workers` workers (never more workers
/// than partitions, never fewer than one).
pub fn assign_partitions(partitions: u32, workers: u32) -> Vec<Vec<u32>> {
    let partitions = partitions.max(1);
    let workers = workers.clamp(1, partitions);
    let mut assignment = vec![Vec::new(); workers as usize];
    for p in 0..partitions {
        assignment[(p % workers) as usize].push(p);
    }
    assignment
}

/// Stops every worker of a pool; cheap to clone and send to a signal handler.
#[derive(Debug, Clone)]
pub struct PoolStopper {
    signal: ShutdownSignal,
    wakers: Vec<Waker>,
}

impl PoolStopper {
    /// Graceful: batches in hand finish (retries included) and are committed.
    pub fn shutdown(&self) {
        self.signal.request_stop();
        self.wake_all();
    }

    /// Hard: backoffs are cut short, their batches stay uncommitted.
    pub fn interrupt(&self) {
        self.signal.interrupt();
        self.wake_all();
    }

    fn wake_all(&self) {
        for waker in &self.wakers {
            waker.wake();
        }
    }
}

#[derive(Debug)]
pub struct WorkerOutcome {
    pub name: String,
    pub result: Result<DispatcherStats, DispatchError>,
}

#[derive(Debug)]
pub struct PoolReport {
    pub workers: Vec<WorkerOutcome>,
    pub statistics: PriceSnapshot,
}

impl PoolReport {
    pub fn failed_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.result.is_err()).count()
    }
}

#[derive(Debug)]
pub struct ConsumerPool {
    handles: Vec<DispatcherHandle>,
    aggregator: Arc<PriceAggregator>,
    signal: ShutdownSignal,
}

impl ConsumerPool {
    /// Spawn one dispatcher per partition group.
    ///
    /// `source_for(index, partitions)` builds the source of worker `index`; every worker
    /// dead-letters through `sink` and runs a `SimulatedProcessor` configured from
    /// `config`.
    pub fn start<S, K, F>(
        config: &PipelineConfig,
        workers: u32,
        sink: Arc<K>,
        mut source_for: F,
    ) -> anyhow::Result<Self>
    where
        S: OrderSource + 'static,
        K: PublishSink + 'static,
        F: FnMut(u32, Vec<u32>) -> Result<S, StreamError>,
    {
        let aggregator = Arc::new(PriceAggregator::with_report_every(config.report_every));
        let signal = ShutdownSignal::new();
        let mut pool = Self {
            handles: Vec::new(),
            aggregator,
            signal,
        };

        for (index, partitions) in assign_partitions(config.partitions, workers)
            .into_iter()
            .enumerate()
        {
            let index = index as u32;
            let name = format!("dispatcher-{index}");
            info!(worker = %name, partitions = ?partitions, "starting worker");

            let source = match source_for(index, partitions) {
                Ok(source) => source,
                Err(e) => {
                    // Don't leave already started workers running.
                    pool.stopper().shutdown();
                    let _ = pool.join();
                    return Err(e).with_context(|| format!("creating source for {name}"));
                }
            };

            let dispatcher = Dispatcher::new(
                source,
                SimulatedProcessor::new(config.failure_rate, config.work_time),
                DeadLetterRouter::new(Arc::clone(&sink), config.dead_letter_stream.clone()),
                Arc::clone(&pool.aggregator),
                config.dispatcher_config(name.clone()),
            )
            .with_shutdown_signal(pool.signal.clone());

            let handle = spawn_dispatcher(name.clone(), dispatcher)
                .with_context(|| format!("spawning {name}"))?;
            pool.handles.push(handle);
        }

        Ok(pool)
    }

    pub fn aggregator(&self) -> Arc<PriceAggregator> {
        Arc::clone(&self.aggregator)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn stopper(&self) -> PoolStopper {
        PoolStopper {
            signal: self.signal.clone(),
            wakers: self.handles.iter().filter_map(|h| h.waker()).collect(),
        }
    }

    pub fn stats(&self) -> Vec<(String, DispatcherStats)> {
        self.handles
            .iter()
            .map(|h| (h.name().to_string(), h.stats()))
            .collect()
    }

    /// Wait for every worker, log each outcome and the final price statistics.
    pub fn join(self) -> PoolReport {
        let mut workers = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            let name = handle.name().to_string();
            let result = handle.join();
            match &result {
                Ok(stats) => info!(
                    worker = %name,
                    batches_committed = stats.batches_committed,
                    orders_succeeded = stats.orders_succeeded,
                    retries = stats.retries,
                    dead_lettered = stats.dead_lettered,
                    dead_letter_failures = stats.dead_letter_failures,
                    interrupted = stats.interrupted,
                    transport_failures = stats.transport_failures,
                    "worker finished"
                ),
                Err(e) => error!(worker = %name, error = %e, "worker failed"),
            }
            workers.push(WorkerOutcome { name, result });
        }

        let statistics = self.aggregator.log_final_statistics();
        PoolReport {
            workers,
            statistics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use orderflow_core::{Order, OrderId, Price};
    use orderflow_stream::InMemoryBroker;
    use std::time::{Duration, Instant};

    fn test_config(partitions: u32) -> PipelineConfig {
        let mut config = PipelineConfig::default()
            .with_partitions(partitions)
            .with_retry_backoff(Duration::from_millis(1));
        config.failure_rate = 0.0;
        config.work_time = Duration::ZERO;
        config.poll_timeout = Duration::from_millis(20);
        config
    }

    fn order(i: u64) -> Order {
        Order::new(
            OrderId::parse(&format!("ORDER-{i}")).unwrap(),
            "Item2",
            Price::from_cents(i * 10).unwrap(),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn partitions_are_spread_round_robin() {
        assert_eq!(assign_partitions(4, 2), vec![vec![0, 2], vec![1, 3]]);
        assert_eq!(assign_partitions(3, 8), vec![vec![0], vec![1], vec![2]]);
        assert_eq!(assign_partitions(2, 0), vec![vec![0, 1]]);
        assert_eq!(assign_partitions(0, 3), vec![vec![0]]);
    }

    #[test]
    fn pool_consumes_every_partition_and_shuts_down() {
        let config = test_config(3);
        let broker = InMemoryBroker::arc();
        broker.create_topic(&config.orders_stream, 3).unwrap();
        for i in 1..=30 {
            let o = order(i);
            broker.publish(&config.orders_stream, o.order_id(), &o).unwrap();
        }

        let pool = ConsumerPool::start(&config, 3, Arc::clone(&broker), |_, partitions| {
            broker.subscribe(&config.orders_stream, &config.consumer_group, partitions)
        })
        .unwrap();
        assert_eq!(pool.len(), 3);

        let aggregator = pool.aggregator();
        let deadline = Instant::now() + Duration::from_secs(10);
        while aggregator.snapshot().count < 30 {
            assert!(Instant::now() < deadline, "orders not consumed in time");
            std::thread::sleep(Duration::from_millis(5));
        }

        pool.stopper().shutdown();
        let report = pool.join();

        assert_eq!(report.failed_workers(), 0);
        assert_eq!(report.statistics.count, 30);
        let succeeded: u64 = report
            .workers
            .iter()
            .map(|w| w.result.as_ref().unwrap().orders_succeeded)
            .sum();
        assert_eq!(succeeded, 30);
    }

    #[test]
    fn source_failure_stops_started_workers() {
        let config = test_config(2);
        let broker = InMemoryBroker::arc();
        broker.create_topic(&config.orders_stream, 2).unwrap();

        let result = ConsumerPool::start(&config, 2, Arc::clone(&broker), |index, partitions| {
            if index == 1 {
                return Err(StreamError::Connection("unreachable".to_string()));
            }
            broker.subscribe(&config.orders_stream, &config.consumer_group, partitions)
        });

        assert!(result.is_err());
    }
}
