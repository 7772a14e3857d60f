//! Input and output transports.
//!
//! The input side is a partitioned, append-only log with consumer-group
//! semantics: every entry is delivered to one member of the group and stays
//! pending for that member until it is acknowledged. The output side is an
//! append-only log of serialized records.
//!
//! Two backends are provided:
//!
//! - Redis Streams ([`RedisEventStream`], [`RedisStreamSink`]) for production.
//! - In-memory ([`MemoryEventStream`], [`MemoryOutputSink`]) for tests and
//!   local development. The memory log models pending lists, delivery counts
//!   and idle claims closely enough to exercise crash recovery.

use std::time::Duration;

use async_trait::async_trait;

use crate::content::{ContentEvent, PartitionKey};
use crate::errors::{SerializationError, TransportError};
use crate::serialization::{DATA_FIELD, decode_event};

mod memory;
mod redis;

pub use memory::{MemoryEventStream, MemoryOutputSink};
pub use redis::{RedisEventStream, RedisStreamSink, create_redis_pool};

/// Cursor value that starts a scan from the beginning.
pub const CURSOR_START: &str = "0-0";

/// One entry read from a partition log.
#[derive(Debug)]
pub struct StreamEntry {
    pub id: String,
    /// The undecoded `data` field, kept for dead-letter records.
    pub raw: Option<String>,
    pub event: Result<ContentEvent, SerializationError>,
}

impl StreamEntry {
    pub fn decode(id: impl Into<String>, raw: Option<String>) -> Self {
        let event = match raw.as_deref() {
            Some(raw) => decode_event(raw),
            None => Err(SerializationError::MissingField {
                field: DATA_FIELD.to_string(),
            }),
        };

        Self {
            id: id.into(),
            raw,
            event,
        }
    }

    /// An entry whose `data` field could not be read as text. `raw` is a
    /// lossy rendering for the dead-letter record.
    pub fn undecodable(id: impl Into<String>, raw: String, error: SerializationError) -> Self {
        Self {
            id: id.into(),
            raw: Some(raw),
            event: Err(error),
        }
    }
}

/// Entries taken over from idle consumers.
#[derive(Debug)]
pub struct ClaimedEntries {
    /// Where the next scan resumes; [`CURSOR_START`] once the pending list
    /// has been fully scanned.
    pub next_cursor: String,
    pub entries: Vec<StreamEntry>,
}

#[async_trait]
pub trait EventStream: Send + Sync {
    /// Create the consumer group for `partition` if it does not exist yet.
    async fn join_group(&self, partition: PartitionKey) -> Result<(), TransportError>;

    /// Read up to `max_count` entries never delivered to the group, waiting
    /// for the backend's block interval when none are available.
    async fn read_batch(
        &self,
        partition: PartitionKey,
        consumer: &str,
        max_count: usize,
    ) -> Result<Vec<StreamEntry>, TransportError>;

    /// Re-read entries delivered to `consumer` but never acknowledged, oldest
    /// first, starting after `after`.
    async fn reclaim_pending(
        &self,
        partition: PartitionKey,
        consumer: &str,
        after: &str,
        max_count: usize,
    ) -> Result<Vec<StreamEntry>, TransportError>;

    /// Take over entries that have been pending on any consumer for at least
    /// `min_idle`.
    async fn claim_idle(
        &self,
        partition: PartitionKey,
        consumer: &str,
        min_idle: Duration,
        cursor: &str,
        max_count: usize,
    ) -> Result<ClaimedEntries, TransportError>;

    async fn ack(&self, partition: PartitionKey, entry_id: &str) -> Result<(), TransportError>;

    /// Stop consuming `partition`. Pending entries stay with the consumer so
    /// a later member can still recover them.
    async fn leave_group(
        &self,
        _partition: PartitionKey,
        _consumer: &str,
    ) -> Result<(), TransportError> {
        Ok(())
    }
}

#[async_trait]
pub trait OutputSink<T: Send + Sync>: Send + Sync {
    /// Append `item`, returning the id the transport assigned once it is
    /// durably accepted.
    async fn publish(&self, item: &T) -> Result<String, TransportError>;
}

/// Parse the sequence part of a stream id such as `1700000000000-3`.
pub(crate) fn parse_entry_id(id: &str) -> Option<(u64, u64)> {
    let (millis, sequence) = id.split_once('-').unwrap_or((id, "0"));
    Some((millis.parse().ok()?, sequence.parse().ok()?))
}
