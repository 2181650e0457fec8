//! In-memory partitioned broker for tests/dev.
//!
//! - No IO / no async
//! - Topics are split into partitions; a key always lands in the same partition
//! - Consumer groups keep a committed offset per partition
//! - Records polled but not committed are redelivered to the next consumer of the group
//!
//! Failure injection (`fail_next_*`) lets tests exercise the transport-error paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use orderflow_core::{Order, OrderId};

use crate::error::StreamError;
use crate::partition::partition_for;
use crate::sink::{Ack, PublishSink};
use crate::source::{OrderSource, Waker};

/// Default maximum number of records returned by a single poll.
const DEFAULT_MAX_POLL_RECORDS: usize = 100;

#[derive(Debug, Default)]
struct Topic {
    partitions: Vec<Vec<Order>>,
    committed: HashMap<(String, u32), usize>,
}

impl Topic {
    fn with_partitions(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions.max(1)).map(|_| Vec::new()).collect(),
            committed: HashMap::new(),
        }
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, Topic>,
    failing_polls: u32,
    failing_commits: u32,
    failing_publishes: HashMap<String, u32>,
}

/// In-memory broker shared by producers and consumers through an `Arc`.
#[derive(Debug)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    arrivals: Condvar,
    max_poll_records: usize,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_max_poll_records(DEFAULT_MAX_POLL_RECORDS)
    }

    pub fn with_max_poll_records(max_poll_records: usize) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            arrivals: Condvar::new(),
            max_poll_records: max_poll_records.max(1),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> Result<MutexGuard<'_, BrokerState>, StreamError> {
        self.state.lock().map_err(|_| StreamError::Poisoned)
    }

    /// Create a topic with a fixed partition count (idempotent; an existing topic keeps
    /// its layout).
    pub fn create_topic(&self, name: &str, partitions: u32) -> Result<(), StreamError> {
        let mut state = self.lock()?;
        state
            .topics
            .entry(name.to_string())
            .or_insert_with(|| Topic::with_partitions(partitions));
        Ok(())
    }

    /// Subscribe a consumer of `group` to the given partitions of `topic`.
    ///
    /// The consumer starts at the group's committed offset for each partition.
    pub fn subscribe(
        self: &Arc<Self>,
        topic: &str,
        group: &str,
        partitions: impl IntoIterator<Item = u32>,
    ) -> Result<InMemoryConsumer, StreamError> {
        let mut state = self.lock()?;
        let t = state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::with_partitions(1));

        let mut positions = Vec::new();
        for p in partitions {
            if p as usize >= t.partitions.len() {
                return Err(StreamError::UnknownDestination(format!("{topic}[{p}]")));
            }
            let committed = t.committed.get(&(group.to_string(), p)).copied().unwrap_or(0);
            positions.push((p, committed));
        }
        drop(state);

        Ok(InMemoryConsumer {
            broker: Arc::clone(self),
            topic: topic.to_string(),
            group: group.to_string(),
            positions,
            woken: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Subscribe to every partition of `topic`.
    pub fn subscribe_all(
        self: &Arc<Self>,
        topic: &str,
        group: &str,
    ) -> Result<InMemoryConsumer, StreamError> {
        let count = self.partition_count(topic)?.unwrap_or(1);
        self.subscribe(topic, group, 0..count)
    }

    pub fn partition_count(&self, topic: &str) -> Result<Option<u32>, StreamError> {
        let state = self.lock()?;
        Ok(state.topics.get(topic).map(|t| t.partitions.len() as u32))
    }

    /// All records of a topic, partition by partition.
    pub fn records(&self, topic: &str) -> Result<Vec<Order>, StreamError> {
        let state = self.lock()?;
        Ok(state
            .topics
            .get(topic)
            .map(|t| t.partitions.iter().flatten().cloned().collect())
            .unwrap_or_default())
    }

    pub fn committed_offset(
        &self,
        topic: &str,
        group: &str,
        partition: u32,
    ) -> Result<Option<usize>, StreamError> {
        let state = self.lock()?;
        Ok(state
            .topics
            .get(topic)
            .and_then(|t| t.committed.get(&(group.to_string(), partition)).copied()))
    }

    /// Make the next `n` polls (by any consumer) fail.
    pub fn fail_next_polls(&self, n: u32) -> Result<(), StreamError> {
        self.lock()?.failing_polls = n;
        Ok(())
    }

    /// Make the next `n` commits (by any consumer) fail.
    pub fn fail_next_commits(&self, n: u32) -> Result<(), StreamError> {
        self.lock()?.failing_commits = n;
        Ok(())
    }

    /// Make the next `n` publishes to `destination` fail.
    pub fn fail_next_publishes(&self, destination: &str, n: u32) -> Result<(), StreamError> {
        self.lock()?.failing_publishes.insert(destination.to_string(), n);
        Ok(())
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl PublishSink for InMemoryBroker {
    fn publish(&self, destination: &str, key: &OrderId, order: &Order) -> Result<Ack, StreamError> {
        let mut state = self.lock()?;

        if let Some(remaining) = state.failing_publishes.get_mut(destination) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StreamError::Connection(format!(
                    "injected publish failure for {destination}"
                )));
            }
        }

        let topic = state
            .topics
            .entry(destination.to_string())
            .or_insert_with(|| Topic::with_partitions(1));
        let partition = partition_for(key, topic.partitions.len() as u32);
        let log = &mut topic.partitions[partition as usize];
        log.push(order.clone());
        let offset = log.len() - 1;
        drop(state);

        self.arrivals.notify_all();

        Ok(Ack {
            destination: destination.to_string(),
            partition,
            position: offset.to_string(),
        })
    }
}

/// Consumer of one group over a fixed set of partitions.
#[derive(Debug)]
pub struct InMemoryConsumer {
    broker: Arc<InMemoryBroker>,
    topic: String,
    group: String,
    /// (partition, next offset to read)
    positions: Vec<(u32, usize)>,
    woken: Arc<AtomicBool>,
}

impl InMemoryConsumer {
    pub fn partitions(&self) -> Vec<u32> {
        self.positions.iter().map(|(p, _)| *p).collect()
    }
}

fn fill_batch(topic: Option<&Topic>, positions: &mut [(u32, usize)], max: usize) -> Vec<Order> {
    let mut batch = Vec::new();
    let Some(topic) = topic else {
        return batch;
    };
    for (partition, next) in positions.iter_mut() {
        let log = &topic.partitions[*partition as usize];
        while *next < log.len() && batch.len() < max {
            batch.push(log[*next].clone());
            *next += 1;
        }
        if batch.len() >= max {
            break;
        }
    }
    batch
}

impl OrderSource for InMemoryConsumer {
    fn poll(&mut self, timeout: Duration) -> Result<Vec<Order>, StreamError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.broker.lock()?;

        if state.failing_polls > 0 {
            state.failing_polls -= 1;
            return Err(StreamError::Connection("injected poll failure".to_string()));
        }

        loop {
            let batch = fill_batch(
                state.topics.get(&self.topic),
                &mut self.positions,
                self.broker.max_poll_records,
            );
            if !batch.is_empty() {
                return Ok(batch);
            }
            if self.woken.swap(false, Ordering::SeqCst) {
                return Ok(batch);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(batch);
            }
            let (guard, _) = self
                .broker
                .arrivals
                .wait_timeout(state, deadline - now)
                .map_err(|_| StreamError::Poisoned)?;
            state = guard;
        }
    }

    fn commit(&mut self) -> Result<(), StreamError> {
        let mut state = self.broker.lock()?;

        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(StreamError::Connection("injected commit failure".to_string()));
        }

        let topic = state
            .topics
            .get_mut(&self.topic)
            .ok_or_else(|| StreamError::UnknownDestination(self.topic.clone()))?;
        for (partition, next) in &self.positions {
            topic.committed.insert((self.group.clone(), *partition), *next);
        }
        Ok(())
    }

    fn waker(&self) -> Option<Waker> {
        let broker = Arc::clone(&self.broker);
        let woken = Arc::clone(&self.woken);
        Some(Waker::new(move || {
            woken.store(true, Ordering::SeqCst);
            // Take the lock so a poller between its check and its wait can't miss this.
            let _guard = broker.state.lock();
            broker.arrivals.notify_all();
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use orderflow_core::Price;

    fn order(id: &str, cents: u64) -> Order {
        Order::new(
            OrderId::parse(id).unwrap(),
            "Item1",
            Price::from_cents(cents).unwrap(),
            Utc::now(),
        )
        .unwrap()
    }

    fn publish(broker: &InMemoryBroker, topic: &str, o: &Order) -> Ack {
        broker.publish(topic, o.order_id(), o).unwrap()
    }

    #[test]
    fn poll_returns_published_orders_in_order() {
        let broker = InMemoryBroker::arc();
        let mut consumer = broker.subscribe_all("orders", "g").unwrap();

        publish(&broker, "orders", &order("A", 100));
        publish(&broker, "orders", &order("B", 200));

        let batch = consumer.poll(Duration::from_millis(10)).unwrap();
        let ids: Vec<_> = batch.iter().map(|o| o.order_id().as_str().to_string()).collect();
        assert_eq!(ids, vec!["A", "B"]);

        assert!(consumer.poll(Duration::from_millis(10)).unwrap().is_empty());
    }

    #[test]
    fn poll_is_bounded_by_max_poll_records() {
        let broker = Arc::new(InMemoryBroker::with_max_poll_records(2));
        let mut consumer = broker.subscribe_all("orders", "g").unwrap();
        for i in 0..5 {
            publish(&broker, "orders", &order(&format!("O{i}"), 100));
        }

        assert_eq!(consumer.poll(Duration::ZERO).unwrap().len(), 2);
        assert_eq!(consumer.poll(Duration::ZERO).unwrap().len(), 2);
        assert_eq!(consumer.poll(Duration::ZERO).unwrap().len(), 1);
    }

    #[test]
    fn uncommitted_records_are_redelivered_to_next_consumer() {
        let broker = InMemoryBroker::arc();
        publish(&broker, "orders", &order("A", 100));
        publish(&broker, "orders", &order("B", 100));

        {
            let mut first = broker.subscribe_all("orders", "g").unwrap();
            assert_eq!(first.poll(Duration::ZERO).unwrap().len(), 2);
            // dropped without commit
        }

        let mut second = broker.subscribe_all("orders", "g").unwrap();
        assert_eq!(second.poll(Duration::ZERO).unwrap().len(), 2);
        second.commit().unwrap();
        assert_eq!(broker.committed_offset("orders", "g", 0).unwrap(), Some(2));

        let mut third = broker.subscribe_all("orders", "g").unwrap();
        assert!(third.poll(Duration::ZERO).unwrap().is_empty());
    }

    #[test]
    fn keys_are_routed_to_stable_partitions() {
        let broker = InMemoryBroker::arc();
        broker.create_topic("orders", 4).unwrap();

        let o = order("ORDER-7", 100);
        let first = publish(&broker, "orders", &o);
        let second = publish(&broker, "orders", &o);
        assert_eq!(first.partition, second.partition);
        assert_eq!(first.partition, partition_for(o.order_id(), 4));
        assert_eq!(second.position, "1");

        let mut owner = broker.subscribe("orders", "g", [first.partition]).unwrap();
        assert_eq!(owner.poll(Duration::ZERO).unwrap().len(), 2);
    }

    #[test]
    fn subscribing_to_missing_partition_fails() {
        let broker = InMemoryBroker::arc();
        broker.create_topic("orders", 2).unwrap();
        assert!(matches!(
            broker.subscribe("orders", "g", [2]),
            Err(StreamError::UnknownDestination(_))
        ));
    }

    #[test]
    fn waker_unblocks_pending_poll() {
        let broker = InMemoryBroker::arc();
        let mut consumer = broker.subscribe_all("orders", "g").unwrap();
        let waker = consumer.waker().unwrap();

        let started = Instant::now();
        let t = std::thread::spawn(move || consumer.poll(Duration::from_secs(10)).unwrap());
        std::thread::sleep(Duration::from_millis(50));
        waker.wake();

        assert!(t.join().unwrap().is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn injected_failures_are_consumed() {
        let broker = InMemoryBroker::arc();
        let mut consumer = broker.subscribe_all("orders", "g").unwrap();

        broker.fail_next_polls(1).unwrap();
        assert!(consumer.poll(Duration::ZERO).is_err());
        assert!(consumer.poll(Duration::ZERO).is_ok());

        broker.fail_next_commits(1).unwrap();
        assert!(consumer.commit().is_err());
        assert!(consumer.commit().is_ok());

        let o = order("A", 100);
        broker.fail_next_publishes("dlq", 1).unwrap();
        assert!(broker.publish("dlq", o.order_id(), &o).is_err());
        assert!(broker.publish("dlq", o.order_id(), &o).is_ok());
        assert_eq!(broker.records("dlq").unwrap(), vec![o]);
    }
}
