//! Redis Streams transports.
//!
//! Commands are issued as raw `cmd(...)` calls and replies are decoded from
//! [`Value`] so that deleted entries (an id with a nil field list) survive
//! decoding and can be dead-lettered.
//!
//! # Key layout
//!
//! ```text
//! {prefix}:{fid}      one input stream per partition
//! <action stream>     review results, field `data`
//! <dead-letter>       dead-letter records, field `data`
//! ```

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use deadpool_redis::redis::{RedisError, Value, cmd, from_redis_value};
use serde::Serialize;
use tracing::{debug, trace};

use super::{CURSOR_START, ClaimedEntries, EventStream, OutputSink, StreamEntry};
use crate::content::PartitionKey;
use crate::errors::{SerializationError, TransportError};
use crate::serialization::{DATA_FIELD, encode_json};

/// Build a connection pool for `redis_url`.
pub fn create_redis_pool(redis_url: &str) -> Result<Pool, TransportError> {
    Config::from_url(redis_url)
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|e| TransportError::fatal("create_pool", e))
}

pub struct RedisEventStream {
    pool: Pool,
    key_prefix: String,
    group: String,
    block: Duration,
}

impl RedisEventStream {
    pub fn new(
        pool: Pool,
        key_prefix: impl Into<String>,
        group: impl Into<String>,
        block: Duration,
    ) -> Self {
        Self {
            pool,
            key_prefix: key_prefix.into(),
            group: group.into(),
            block,
        }
    }

    pub fn stream_key(&self, partition: PartitionKey) -> String {
        format!("{}:{}", self.key_prefix, partition)
    }

    async fn connection(
        &self,
        operation: &str,
    ) -> Result<deadpool_redis::Connection, TransportError> {
        self.pool
            .get()
            .await
            .map_err(|e| TransportError::from_pool(operation, &e))
    }

    async fn read_group(
        &self,
        partition: PartitionKey,
        consumer: &str,
        max_count: usize,
        start: &str,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, TransportError> {
        let key = self.stream_key(partition);
        let mut conn = self.connection("XREADGROUP").await?;

        let mut command = cmd("XREADGROUP");
        command
            .arg("GROUP")
            .arg(&self.group)
            .arg(consumer)
            .arg("COUNT")
            .arg(max_count);
        if let Some(block) = block {
            command.arg("BLOCK").arg(block.as_millis() as u64);
        }
        command.arg("STREAMS").arg(&key).arg(start);

        let reply: Value = command
            .query_async(&mut conn)
            .await
            .map_err(|e| TransportError::from_redis("XREADGROUP", &e))?;

        let entries = parse_read_reply(reply)
            .map_err(|e| TransportError::fatal("XREADGROUP", format!("unexpected reply: {e}")))?;
        trace!(stream = %key, start, count = entries.len(), "Read stream entries");
        Ok(entries)
    }
}

#[async_trait]
impl EventStream for RedisEventStream {
    async fn join_group(&self, partition: PartitionKey) -> Result<(), TransportError> {
        let key = self.stream_key(partition);
        let mut conn = self.connection("XGROUP CREATE").await?;

        let result: Result<(), RedisError> = cmd("XGROUP")
            .arg("CREATE")
            .arg(&key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                debug!(stream = %key, group = %self.group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(TransportError::from_redis("XGROUP CREATE", &e)),
        }
    }

    async fn read_batch(
        &self,
        partition: PartitionKey,
        consumer: &str,
        max_count: usize,
    ) -> Result<Vec<StreamEntry>, TransportError> {
        self.read_group(partition, consumer, max_count, ">", Some(self.block))
            .await
    }

    async fn reclaim_pending(
        &self,
        partition: PartitionKey,
        consumer: &str,
        after: &str,
        max_count: usize,
    ) -> Result<Vec<StreamEntry>, TransportError> {
        // An explicit id reads this consumer's own pending list and never blocks.
        self.read_group(partition, consumer, max_count, after, None)
            .await
    }

    async fn claim_idle(
        &self,
        partition: PartitionKey,
        consumer: &str,
        min_idle: Duration,
        cursor: &str,
        max_count: usize,
    ) -> Result<ClaimedEntries, TransportError> {
        let key = self.stream_key(partition);
        let mut conn = self.connection("XAUTOCLAIM").await?;

        let reply: Value = cmd("XAUTOCLAIM")
            .arg(&key)
            .arg(&self.group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg(cursor)
            .arg("COUNT")
            .arg(max_count)
            .query_async(&mut conn)
            .await
            .map_err(|e| TransportError::from_redis("XAUTOCLAIM", &e))?;

        parse_autoclaim_reply(reply)
            .map_err(|e| TransportError::fatal("XAUTOCLAIM", format!("unexpected reply: {e}")))
    }

    async fn ack(&self, partition: PartitionKey, entry_id: &str) -> Result<(), TransportError> {
        let key = self.stream_key(partition);
        let mut conn = self.connection("XACK").await?;

        let _: i64 = cmd("XACK")
            .arg(&key)
            .arg(&self.group)
            .arg(entry_id)
            .query_async(&mut conn)
            .await
            .map_err(|e| TransportError::from_redis("XACK", &e))?;
        Ok(())
    }
}

/// Appends JSON-encoded records to a single stream under field `data`.
pub struct RedisStreamSink<T> {
    pool: Pool,
    stream_key: String,
    _phantom: PhantomData<fn(&T)>,
}

impl<T> RedisStreamSink<T> {
    pub fn new(pool: Pool, stream_key: impl Into<String>) -> Self {
        Self {
            pool,
            stream_key: stream_key.into(),
            _phantom: PhantomData,
        }
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }
}

#[async_trait]
impl<T> OutputSink<T> for RedisStreamSink<T>
where
    T: Serialize + Send + Sync,
{
    async fn publish(&self, item: &T) -> Result<String, TransportError> {
        let data = encode_json(item).map_err(|e| TransportError::fatal("XADD", e))?;

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| TransportError::from_pool("XADD", &e))?;

        cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg(DATA_FIELD)
            .arg(data)
            .query_async(&mut conn)
            .await
            .map_err(|e| TransportError::from_redis("XADD", &e))
    }
}

/// Build an entry from its raw field list. Field names and values are taken
/// as bytes so that one entry with a non-UTF-8 `data` value decodes to an
/// error of its own instead of failing the whole reply.
fn into_stream_entry(id: String, fields: Option<Vec<(Vec<u8>, Vec<u8>)>>) -> StreamEntry {
    let data = fields.and_then(|fields| {
        fields
            .into_iter()
            .find(|(name, _)| name == DATA_FIELD.as_bytes())
            .map(|(_, value)| value)
    });

    match data.map(String::from_utf8) {
        None => StreamEntry::decode(id, None),
        Some(Ok(raw)) => StreamEntry::decode(id, Some(raw)),
        Some(Err(e)) => {
            let raw = String::from_utf8_lossy(e.as_bytes()).into_owned();
            StreamEntry::undecodable(
                id,
                raw,
                SerializationError::InvalidUtf8 {
                    field: DATA_FIELD.to_string(),
                    source: e,
                },
            )
        }
    }
}

/// Decode an entry list where each entry is `[id, [field, value, ...]]` and
/// the field list may be nil for entries deleted from the stream.
fn parse_entry_list(value: Value) -> Result<Vec<StreamEntry>, RedisError> {
    let items: Vec<Value> = from_redis_value(&value)?;
    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        let parts: Vec<Value> = from_redis_value(&item)?;
        let mut parts = parts.into_iter();
        let id: String = match parts.next() {
            Some(id) => from_redis_value(&id)?,
            None => continue,
        };
        let fields = match parts.next() {
            None | Some(Value::Nil) => None,
            Some(fields) => Some(parse_field_pairs(fields)?),
        };
        entries.push(into_stream_entry(id, fields));
    }
    Ok(entries)
}

fn parse_field_pairs(value: Value) -> Result<Vec<(Vec<u8>, Vec<u8>)>, RedisError> {
    if let Value::Map(pairs) = value {
        return pairs
            .iter()
            .map(|(k, v)| Ok((from_redis_value(k)?, from_redis_value(v)?)))
            .collect();
    }

    let flat: Vec<Value> = from_redis_value(&value)?;
    flat.chunks_exact(2)
        .map(|pair| Ok((from_redis_value(&pair[0])?, from_redis_value(&pair[1])?)))
        .collect()
}

/// `XREADGROUP` replies with nil on timeout, otherwise `[[key, entries]]`
/// (or a map of key to entries under RESP3).
fn parse_read_reply(reply: Value) -> Result<Vec<StreamEntry>, RedisError> {
    let streams: Vec<(Value, Value)> = match reply {
        Value::Nil => return Ok(Vec::new()),
        Value::Map(pairs) => pairs,
        other => from_redis_value::<Vec<Vec<Value>>>(&other)?
            .into_iter()
            .filter_map(|stream| {
                let mut parts = stream.into_iter();
                Some((parts.next()?, parts.next()?))
            })
            .collect(),
    };

    let mut entries = Vec::new();
    for (_key, stream_entries) in streams {
        entries.extend(parse_entry_list(stream_entries)?);
    }
    Ok(entries)
}

/// `XAUTOCLAIM` replies with `[next_cursor, entries]`, plus a list of deleted
/// ids on Redis 7.
fn parse_autoclaim_reply(reply: Value) -> Result<ClaimedEntries, RedisError> {
    let parts: Vec<Value> = from_redis_value(&reply)?;
    let mut parts = parts.into_iter();

    let next_cursor = match parts.next() {
        Some(cursor) => from_redis_value::<String>(&cursor)?,
        None => CURSOR_START.to_string(),
    };
    let entries = match parts.next() {
        Some(entries) => parse_entry_list(entries)?,
        None => Vec::new(),
    };

    Ok(ClaimedEntries {
        next_cursor,
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentKind;

    fn bulk(s: &str) -> Value {
        Value::BulkString(s.as_bytes().to_vec())
    }

    fn entry(id: &str, data: &str) -> Value {
        Value::Array(vec![
            bulk(id),
            Value::Array(vec![bulk("data"), bulk(data)]),
        ])
    }

    const THREAD: &str = r#"{"object_type":"thread","object_id":1,"payload":{"fid":3,"tid":1}}"#;

    #[test]
    fn test_parse_read_reply_nil_is_empty() {
        let entries = parse_read_reply(Value::Nil).expect("Failed to parse nil");
        assert!(entries.is_empty());
    }

    #[test]
    fn test_parse_read_reply() {
        let reply = Value::Array(vec![Value::Array(vec![
            bulk("scraper:tieba:events:3"),
            Value::Array(vec![entry("1-0", THREAD), entry("2-0", "not json")]),
        ])]);

        let entries = parse_read_reply(reply).expect("Failed to parse reply");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "1-0");
        let event = entries[0].event.as_ref().expect("Entry should decode");
        assert_eq!(event.kind(), ContentKind::Thread);
        assert_eq!(event.fid(), 3);
        assert_eq!(entries[1].raw.as_deref(), Some("not json"));
        assert!(entries[1].event.is_err());
    }

    #[test]
    fn test_non_utf8_entry_does_not_fail_the_batch() {
        let bad = Value::Array(vec![
            bulk("2-0"),
            Value::Array(vec![bulk("data"), Value::BulkString(vec![0xff, 0xfe, 0x7b])]),
        ]);
        let reply = Value::Array(vec![Value::Array(vec![
            bulk("scraper:tieba:events:3"),
            Value::Array(vec![entry("1-0", THREAD), bad, entry("3-0", THREAD)]),
        ])]);

        let entries = parse_read_reply(reply).expect("Failed to parse reply");
        let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["1-0", "2-0", "3-0"]);
        assert!(entries[0].event.is_ok());
        assert!(entries[2].event.is_ok());
        assert!(matches!(
            entries[1].event,
            Err(SerializationError::InvalidUtf8 { ref field, .. }) if field == "data"
        ));
        assert_eq!(entries[1].raw.as_deref(), Some("\u{fffd}\u{fffd}{"));
    }

    #[test]
    fn test_non_utf8_entry_in_autoclaim_reply() {
        let bad = Value::Array(vec![
            bulk("4-0"),
            Value::Array(vec![bulk("data"), Value::BulkString(vec![0xc3])]),
        ]);
        let reply = Value::Array(vec![
            bulk("0-0"),
            Value::Array(vec![bad, entry("5-0", THREAD)]),
        ]);

        let claimed = parse_autoclaim_reply(reply).expect("Failed to parse reply");
        assert_eq!(claimed.entries.len(), 2);
        assert!(claimed.entries[0].event.is_err());
        assert!(claimed.entries[1].event.is_ok());
    }

    #[test]
    fn test_parse_deleted_entry() {
        let reply = Value::Array(vec![Value::Array(vec![
            bulk("k"),
            Value::Array(vec![Value::Array(vec![bulk("5-0"), Value::Nil])]),
        ])]);

        let entries = parse_read_reply(reply).expect("Failed to parse reply");
        assert_eq!(entries.len(), 1);
        assert!(entries[0].raw.is_none());
        assert!(entries[0].event.is_err());
    }

    #[test]
    fn test_parse_autoclaim_reply() {
        let reply = Value::Array(vec![
            bulk("7-0"),
            Value::Array(vec![entry("3-0", THREAD)]),
            Value::Array(vec![]),
        ]);

        let claimed = parse_autoclaim_reply(reply).expect("Failed to parse reply");
        assert_eq!(claimed.next_cursor, "7-0");
        assert_eq!(claimed.entries.len(), 1);
        assert_eq!(claimed.entries[0].id, "3-0");
    }
}
