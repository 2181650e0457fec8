//! Redis Streams-backed order transport (durable, at-least-once delivery).
//!
//! This implementation uses Redis Streams (XADD/XREADGROUP/XACK) to provide:
//! - **Durable delivery**: Entries persist until acknowledged
//! - **At-least-once**: Entries read but never acknowledged are re-read by the same
//!   consumer once it reconnects (crash / interrupted batch)
//! - **Consumer groups**: All dispatcher workers share one group
//! - **Partitions**: One stream per partition, selected by order id
//!
//! ## Architecture
//!
//! - **Stream Key**: `{topic}` for a single partition, `{topic}:{p}` otherwise
//! - **Entry fields**: `order_id`, `product`, `payload` (JSON-encoded order)
//! - **Consumers**: Named consumers within the group (e.g., `order-consumer-0`)

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::Commands;
use tracing::{debug, error, instrument, warn};

use orderflow_core::{Order, OrderId};
use orderflow_stream::{Ack, OrderSource, PublishSink, StreamError, partition_for};

/// Stream key of `partition` for a topic split into `partitions` streams.
pub fn stream_key(topic: &str, partition: u32, partitions: u32) -> String {
    if partitions <= 1 {
        topic.to_string()
    } else {
        format!("{topic}:{partition}")
    }
}

fn open_client(redis_url: &str) -> Result<redis::Client, StreamError> {
    redis::Client::open(redis_url).map_err(|e| StreamError::Connection(e.to_string()))
}

fn command_error(command: &str, e: redis::RedisError) -> StreamError {
    if e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() || e.is_timeout() {
        StreamError::Connection(format!("{command} failed: {e}"))
    } else {
        StreamError::Command(format!("{command} failed: {e}"))
    }
}

/// Publishes orders with `XADD`, one stream per partition.
///
/// Destinations default to a single partition; use `with_partitions` for split topics.
pub struct RedisStreamsPublisher {
    client: redis::Client,
    conn: Mutex<Option<redis::Connection>>,
    partitions: HashMap<String, u32>,
}

impl core::fmt::Debug for RedisStreamsPublisher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsPublisher")
            .field("partitions", &self.partitions)
            .finish_non_exhaustive()
    }
}

impl RedisStreamsPublisher {
    /// Create a publisher. The connection is opened lazily on first publish.
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, StreamError> {
        Ok(Self {
            client: open_client(redis_url.as_ref())?,
            conn: Mutex::new(None),
            partitions: HashMap::new(),
        })
    }

    pub fn with_partitions(mut self, destination: impl Into<String>, partitions: u32) -> Self {
        self.partitions.insert(destination.into(), partitions.max(1));
        self
    }

    fn partitions_of(&self, destination: &str) -> u32 {
        self.partitions.get(destination).copied().unwrap_or(1)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Option<redis::Connection>>, StreamError> {
        self.conn.lock().map_err(|_| StreamError::Poisoned)
    }
}

impl PublishSink for RedisStreamsPublisher {
    #[instrument(skip(self, key, order), fields(order_id = %key), err)]
    fn publish(&self, destination: &str, key: &OrderId, order: &Order) -> Result<Ack, StreamError> {
        let payload =
            serde_json::to_string(order).map_err(|e| StreamError::Serialization(e.to_string()))?;

        let partitions = self.partitions_of(destination);
        let partition = partition_for(key, partitions);
        let stream = stream_key(destination, partition, partitions);

        let mut guard = self.conn()?;
        if guard.is_none() {
            let conn = self
                .client
                .get_connection()
                .map_err(|e| StreamError::Connection(e.to_string()))?;
            *guard = Some(conn);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(StreamError::Connection("no connection".to_string()));
        };

        let result: redis::RedisResult<String> = redis::cmd("XADD")
            .arg(&stream)
            .arg("*") // Auto-generate entry ID
            .arg("order_id")
            .arg(key.as_str())
            .arg("product")
            .arg(order.product())
            .arg("payload")
            .arg(&payload)
            .query(conn);

        match result {
            Ok(entry_id) => Ok(Ack {
                destination: destination.to_string(),
                partition,
                position: entry_id,
            }),
            Err(e) => {
                // Reconnect on the next publish.
                *guard = None;
                Err(command_error("XADD", e))
            }
        }
    }
}

/// Entry ids delivered to this consumer and not yet acknowledged, per stream.
///
/// Pending entries (`XREADGROUP ... 0`) are only re-read after a (re)connect, and only
/// ids not tracked already are handed out again, so a batch whose `XACK` failed is
/// never delivered twice by the same consumer.
#[derive(Debug, Default)]
struct PendingEntries {
    by_stream: HashMap<String, BTreeSet<String>>,
    recovering: bool,
}

impl PendingEntries {
    /// A new connection was opened: entries left pending by an earlier run are read
    /// back before any new ones.
    fn connected(&mut self) {
        self.recovering = true;
    }

    fn is_recovering(&self) -> bool {
        self.recovering
    }

    fn recovered(&mut self) {
        self.recovering = false;
    }

    /// Remember the ids of `entries` read from `stream`; returns the entries that were
    /// not tracked yet.
    fn track(&mut self, stream: &str, entries: Vec<StreamId>) -> Vec<StreamId> {
        let ids = self.by_stream.entry(stream.to_string()).or_default();
        entries
            .into_iter()
            .filter(|entry| ids.insert(entry.id.clone()))
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.by_stream.values().all(BTreeSet::is_empty)
    }

    fn len(&self) -> usize {
        self.by_stream.values().map(BTreeSet::len).sum()
    }

    fn take(&mut self) -> Vec<(String, BTreeSet<String>)> {
        std::mem::take(&mut self.by_stream)
            .into_iter()
            .filter(|(_, ids)| !ids.is_empty())
            .collect()
    }

    fn restore(&mut self, stream: String, ids: BTreeSet<String>) {
        self.by_stream.entry(stream).or_default().extend(ids);
    }
}

/// Orders decoded from one read, plus how many entries were skipped.
#[derive(Debug, Default, PartialEq)]
struct DecodedBatch {
    orders: Vec<Order>,
    skipped: usize,
}

impl DecodedBatch {
    /// Every entry was skipped. The dispatcher sees an idle poll and won't commit, so
    /// the source acknowledges these itself.
    fn only_skipped(&self) -> bool {
        self.orders.is_empty() && self.skipped > 0
    }
}

fn decode_batch(entries: &[StreamId]) -> DecodedBatch {
    let mut batch = DecodedBatch::default();
    for entry in entries {
        match decode_entry(entry) {
            Some(order) => batch.orders.push(order),
            None => batch.skipped += 1,
        }
    }
    batch
}

/// `OrderSource` reading a consumer group over one or more partition streams.
///
/// Polled entry ids are remembered per stream until `commit` acknowledges them.
pub struct RedisStreamsConsumer {
    client: redis::Client,
    conn: Option<redis::Connection>,
    streams: Vec<String>,
    group: String,
    consumer: String,
    max_poll_records: usize,
    pending: PendingEntries,
}

impl core::fmt::Debug for RedisStreamsConsumer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsConsumer")
            .field("streams", &self.streams)
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .field("unacked", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl RedisStreamsConsumer {
    /// Consume `partitions` of `topic` (split into `total_partitions` streams) as
    /// `consumer` within `group`.
    pub fn new(
        redis_url: impl AsRef<str>,
        topic: &str,
        total_partitions: u32,
        partitions: impl IntoIterator<Item = u32>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Result<Self, StreamError> {
        let streams: Vec<String> = partitions
            .into_iter()
            .map(|p| stream_key(topic, p, total_partitions))
            .collect();
        if streams.is_empty() {
            return Err(StreamError::UnknownDestination(format!(
                "{topic}: no partitions assigned"
            )));
        }

        Ok(Self {
            client: open_client(redis_url.as_ref())?,
            conn: None,
            streams,
            group: group.into(),
            consumer: consumer.into(),
            max_poll_records: 100,
            pending: PendingEntries::default(),
        })
    }

    pub fn with_max_poll_records(mut self, max: usize) -> Self {
        self.max_poll_records = max.max(1);
        self
    }

    pub fn streams(&self) -> &[String] {
        &self.streams
    }

    /// Connect (if needed) and make sure the consumer group exists on every stream.
    fn connection(&mut self) -> Result<&mut redis::Connection, StreamError> {
        if self.conn.is_none() {
            let mut conn = self
                .client
                .get_connection()
                .map_err(|e| StreamError::Connection(e.to_string()))?;
            for stream in &self.streams {
                ensure_group(&mut conn, stream, &self.group)?;
            }
            self.conn = Some(conn);
            self.pending.connected();
        }
        self.conn
            .as_mut()
            .ok_or_else(|| StreamError::Connection("no connection".to_string()))
    }

    /// Read from every stream starting at `start`; returns only entries not already
    /// awaiting acknowledgment.
    fn read(
        &mut self,
        start: &str,
        block: Option<Duration>,
    ) -> Result<Vec<StreamId>, StreamError> {
        let mut options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(self.max_poll_records);
        if let Some(block) = block {
            // BLOCK 0 waits forever; round sub-millisecond timeouts up.
            options = options.block((block.as_millis() as usize).max(1));
        }

        let streams = self.streams.clone();
        let ids = vec![start; streams.len()];
        let conn = self.connection()?;
        let reply: Option<StreamReadReply> = conn
            .xread_options(&streams[..], &ids[..], &options)
            .map_err(|e| command_error("XREADGROUP", e))?;

        let mut entries = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            entries.extend(self.pending.track(&key.key, key.ids));
        }
        Ok(entries)
    }

    fn read_batch(&mut self, timeout: Duration) -> Result<Vec<StreamId>, StreamError> {
        self.connection()?;
        if self.pending.is_recovering() {
            let recovered = self.read("0", None)?;
            if !recovered.is_empty() {
                debug!(count = recovered.len(), "re-reading pending entries");
                return Ok(recovered);
            }
            self.pending.recovered();
        }
        let block = (!timeout.is_zero()).then_some(timeout);
        self.read(">", block)
    }
}

fn ensure_group(
    conn: &mut redis::Connection,
    stream: &str,
    group: &str,
) -> Result<(), StreamError> {
    // MKSTREAM creates the stream if it doesn't exist; "0" starts from the beginning.
    let result: redis::RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "0");
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
        Err(e) => Err(command_error("XGROUP CREATE", e)),
    }
}

/// Decode one stream entry; `None` when the payload is missing or invalid.
fn decode_entry(entry: &StreamId) -> Option<Order> {
    let Some(payload) = entry.get::<String>("payload") else {
        error!(entry_id = %entry.id, "stream entry without payload, skipping");
        return None;
    };
    match serde_json::from_str::<Order>(&payload) {
        Ok(order) => Some(order),
        Err(e) => {
            error!(entry_id = %entry.id, error = %e, "undecodable order payload, skipping");
            None
        }
    }
}

impl OrderSource for RedisStreamsConsumer {
    #[instrument(skip(self), fields(consumer = %self.consumer))]
    fn poll(&mut self, timeout: Duration) -> Result<Vec<Order>, StreamError> {
        let entries = match self.read_batch(timeout) {
            Ok(entries) => entries,
            Err(e) => {
                if matches!(e, StreamError::Connection(_)) {
                    self.conn = None;
                }
                return Err(e);
            }
        };

        let batch = decode_batch(&entries);
        if batch.only_skipped() {
            debug!(skipped = batch.skipped, "acknowledging skipped entries");
            self.commit()?;
        }
        Ok(batch.orders)
    }

    fn commit(&mut self) -> Result<(), StreamError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        self.connection()?;
        let batches = self.pending.take();
        let Some(conn) = self.conn.as_mut() else {
            for (stream, ids) in batches {
                self.pending.restore(stream, ids);
            }
            return Err(StreamError::Connection("no connection".to_string()));
        };

        let mut failure = None;
        for (stream, ids) in batches {
            if failure.is_some() {
                self.pending.restore(stream, ids);
                continue;
            }
            let list: Vec<&str> = ids.iter().map(String::as_str).collect();
            let acked: redis::RedisResult<usize> = conn.xack(&stream, &self.group, &list[..]);
            match acked {
                Ok(n) => debug!(stream = %stream, acked = n, "entries acknowledged"),
                Err(e) => {
                    failure = Some(command_error("XACK", e));
                    self.pending.restore(stream, ids);
                }
            }
        }

        match failure {
            None => Ok(()),
            Some(e) => {
                // Retained ids are acknowledged by the next commit.
                warn!(error = %e, "acknowledgment failed, entries stay pending");
                if matches!(e, StreamError::Connection(_)) {
                    self.conn = None;
                }
                Err(e)
            }
        }
    }
}
