//! In-memory transports.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use super::{ClaimedEntries, CURSOR_START, EventStream, OutputSink, StreamEntry, parse_entry_id};
use crate::content::{ContentEvent, PartitionKey};
use crate::errors::{SerializationError, TransportError};
use crate::serialization::encode_event;

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct PartitionLog {
    entries: BTreeMap<u64, Option<String>>,
    next_seq: u64,
    joined: bool,
    last_delivered: u64,
    pending: BTreeMap<u64, PendingEntry>,
}

impl PartitionLog {
    fn deliver(&mut self, seq: u64, consumer: &str, now: Instant) -> StreamEntry {
        let pending = self.pending.entry(seq).or_insert_with(|| PendingEntry {
            consumer: consumer.to_string(),
            delivered_at: now,
            deliveries: 0,
        });
        pending.consumer = consumer.to_string();
        pending.delivered_at = now;
        pending.deliveries += 1;

        let raw = self.entries.get(&seq).cloned().flatten();
        StreamEntry::decode(format!("{seq}-0"), raw)
    }
}

#[derive(Debug)]
struct FailurePlan {
    remaining: Option<usize>,
    error: TransportError,
}

impl FailurePlan {
    fn take(slot: &mut Option<FailurePlan>) -> Option<TransportError> {
        let plan = slot.as_mut()?;
        let error = plan.error.clone();
        match plan.remaining.as_mut() {
            Some(0) => {
                *slot = None;
                return None;
            }
            Some(remaining) => {
                *remaining -= 1;
                if *remaining == 0 {
                    *slot = None;
                }
            }
            None => {}
        }
        Some(error)
    }
}

#[derive(Debug, Default)]
struct Failures {
    reads: Option<FailurePlan>,
    acks: Option<FailurePlan>,
}

/// Consumer-group log held in process memory.
///
/// Entry ids are `<seq>-0` with `seq` starting at 1. One consumer group is
/// modelled per partition.
pub struct MemoryEventStream {
    logs: Mutex<HashMap<PartitionKey, PartitionLog>>,
    failures: Mutex<Failures>,
    appended: Notify,
    block: Duration,
}

impl MemoryEventStream {
    pub fn new() -> Self {
        Self {
            logs: Mutex::new(HashMap::new()),
            failures: Mutex::new(Failures::default()),
            appended: Notify::new(),
            block: Duration::from_millis(50),
        }
    }

    /// How long an empty `read_batch` waits for new entries.
    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    /// Append a raw entry. `None` models an entry without a `data` field.
    pub fn append(&self, partition: PartitionKey, raw: Option<String>) -> String {
        let id = {
            let mut logs = self.logs.lock();
            let log = logs.entry(partition).or_default();
            log.next_seq += 1;
            let seq = log.next_seq;
            log.entries.insert(seq, raw);
            format!("{seq}-0")
        };
        self.appended.notify_waiters();
        id
    }

    pub fn append_event(
        &self,
        partition: PartitionKey,
        event: &ContentEvent,
    ) -> Result<String, SerializationError> {
        Ok(self.append(partition, Some(encode_event(event)?)))
    }

    pub fn pending_count(&self, partition: PartitionKey) -> usize {
        self.logs
            .lock()
            .get(&partition)
            .map_or(0, |log| log.pending.len())
    }

    /// Ids pending on `consumer`, oldest first.
    pub fn pending_for(&self, partition: PartitionKey, consumer: &str) -> Vec<String> {
        self.logs.lock().get(&partition).map_or_else(Vec::new, |log| {
            log.pending
                .iter()
                .filter(|(_, pending)| pending.consumer == consumer)
                .map(|(seq, _)| format!("{seq}-0"))
                .collect()
        })
    }

    pub fn delivery_count(&self, partition: PartitionKey, entry_id: &str) -> Option<u32> {
        let (seq, _) = parse_entry_id(entry_id)?;
        self.logs
            .lock()
            .get(&partition)?
            .pending
            .get(&seq)
            .map(|pending| pending.deliveries)
    }

    pub fn is_joined(&self, partition: PartitionKey) -> bool {
        self.logs
            .lock()
            .get(&partition)
            .is_some_and(|log| log.joined)
    }

    /// Fail the next `count` reads with `error`; `None` fails every read.
    pub fn fail_reads(&self, count: Option<usize>, error: TransportError) {
        self.failures.lock().reads = Some(FailurePlan {
            remaining: count,
            error,
        });
    }

    /// Fail the next `count` acks with `error`; `None` fails every ack.
    pub fn fail_acks(&self, count: Option<usize>, error: TransportError) {
        self.failures.lock().acks = Some(FailurePlan {
            remaining: count,
            error,
        });
    }

    pub fn clear_failures(&self) {
        *self.failures.lock() = Failures::default();
    }

    fn take_new(
        &self,
        partition: PartitionKey,
        consumer: &str,
        max_count: usize,
    ) -> Result<Vec<StreamEntry>, TransportError> {
        let mut logs = self.logs.lock();
        let log = logs
            .get_mut(&partition)
            .filter(|log| log.joined)
            .ok_or_else(|| no_group("XREADGROUP", partition))?;

        let now = Instant::now();
        let seqs: Vec<u64> = log
            .entries
            .range(log.last_delivered + 1..)
            .take(max_count)
            .map(|(seq, _)| *seq)
            .collect();

        let mut batch = Vec::with_capacity(seqs.len());
        for seq in seqs {
            log.last_delivered = seq;
            batch.push(log.deliver(seq, consumer, now));
        }
        Ok(batch)
    }
}

impl Default for MemoryEventStream {
    fn default() -> Self {
        Self::new()
    }
}

fn no_group(operation: &str, partition: PartitionKey) -> TransportError {
    TransportError::transient(
        operation,
        format!("NOGROUP no consumer group for partition {partition}"),
    )
}

#[async_trait]
impl EventStream for MemoryEventStream {
    async fn join_group(&self, partition: PartitionKey) -> Result<(), TransportError> {
        self.logs.lock().entry(partition).or_default().joined = true;
        Ok(())
    }

    async fn read_batch(
        &self,
        partition: PartitionKey,
        consumer: &str,
        max_count: usize,
    ) -> Result<Vec<StreamEntry>, TransportError> {
        let failure = FailurePlan::take(&mut self.failures.lock().reads);
        if let Some(error) = failure {
            return Err(error);
        }

        let deadline = Instant::now() + self.block;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.take_new(partition, consumer, max_count)?;
            if !batch.is_empty() || Instant::now() >= deadline {
                trace!(partition, consumer, count = batch.len(), "Memory stream read");
                return Ok(batch);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn reclaim_pending(
        &self,
        partition: PartitionKey,
        consumer: &str,
        after: &str,
        max_count: usize,
    ) -> Result<Vec<StreamEntry>, TransportError> {
        let failure = FailurePlan::take(&mut self.failures.lock().reads);
        if let Some(error) = failure {
            return Err(error);
        }

        let (after_seq, _) = parse_entry_id(after)
            .ok_or_else(|| TransportError::fatal("XREADGROUP", format!("invalid id {after}")))?;

        let mut logs = self.logs.lock();
        let log = logs
            .get_mut(&partition)
            .filter(|log| log.joined)
            .ok_or_else(|| no_group("XREADGROUP", partition))?;

        let now = Instant::now();
        let seqs: Vec<u64> = log
            .pending
            .range(after_seq + 1..)
            .filter(|(_, pending)| pending.consumer == consumer)
            .take(max_count)
            .map(|(seq, _)| *seq)
            .collect();

        Ok(seqs
            .into_iter()
            .map(|seq| log.deliver(seq, consumer, now))
            .collect())
    }

    async fn claim_idle(
        &self,
        partition: PartitionKey,
        consumer: &str,
        min_idle: Duration,
        cursor: &str,
        max_count: usize,
    ) -> Result<ClaimedEntries, TransportError> {
        let (cursor_seq, _) = parse_entry_id(cursor)
            .ok_or_else(|| TransportError::fatal("XAUTOCLAIM", format!("invalid id {cursor}")))?;

        let mut logs = self.logs.lock();
        let log = logs
            .get_mut(&partition)
            .filter(|log| log.joined)
            .ok_or_else(|| no_group("XAUTOCLAIM", partition))?;

        let now = Instant::now();
        let scanned: Vec<(u64, bool)> = log
            .pending
            .range(cursor_seq..)
            .take(max_count + 1)
            .map(|(seq, pending)| (*seq, now.duration_since(pending.delivered_at) >= min_idle))
            .collect();

        let next_cursor = match scanned.get(max_count) {
            Some((seq, _)) => format!("{seq}-0"),
            None => CURSOR_START.to_string(),
        };

        let entries = scanned
            .into_iter()
            .take(max_count)
            .filter(|(_, idle)| *idle)
            .map(|(seq, _)| log.deliver(seq, consumer, now))
            .collect();

        Ok(ClaimedEntries {
            next_cursor,
            entries,
        })
    }

    async fn ack(&self, partition: PartitionKey, entry_id: &str) -> Result<(), TransportError> {
        let failure = FailurePlan::take(&mut self.failures.lock().acks);
        if let Some(error) = failure {
            return Err(error);
        }

        let (seq, _) = parse_entry_id(entry_id)
            .ok_or_else(|| TransportError::fatal("XACK", format!("invalid id {entry_id}")))?;
        if let Some(log) = self.logs.lock().get_mut(&partition) {
            log.pending.remove(&seq);
        }
        Ok(())
    }
}

/// Output sink that keeps every published item.
pub struct MemoryOutputSink<T> {
    items: Mutex<Vec<T>>,
    failures: Mutex<VecDeque<TransportError>>,
    always_fail: Mutex<Option<TransportError>>,
}

impl<T: Clone> MemoryOutputSink<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            always_fail: Mutex::new(None),
        })
    }

    pub fn items(&self) -> Vec<T> {
        self.items.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Reject the next `count` publishes with `error`.
    pub fn fail_next(&self, count: usize, error: TransportError) {
        let mut failures = self.failures.lock();
        failures.extend(std::iter::repeat_n(error, count));
    }

    pub fn fail_always(&self, error: TransportError) {
        *self.always_fail.lock() = Some(error);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
        *self.always_fail.lock() = None;
    }
}

#[async_trait]
impl<T> OutputSink<T> for MemoryOutputSink<T>
where
    T: Clone + Send + Sync,
{
    async fn publish(&self, item: &T) -> Result<String, TransportError> {
        let failure = self
            .always_fail
            .lock()
            .clone()
            .or_else(|| self.failures.lock().pop_front());
        if let Some(error) = failure {
            return Err(error);
        }

        let mut items = self.items.lock();
        items.push(item.clone());
        Ok(format!("{}-0", items.len()))
    }
}
