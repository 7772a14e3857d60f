//! Wire envelope for stream entries.
//!
//! Every input entry carries one field, `data`, holding
//! `{"object_type": "thread"|"post"|"comment", "object_id": ..., "payload": {...}}`.
//! Output entries use the same field name with the JSON-encoded record.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::content::{ContentEvent, ContentKind, ContentRecord};
use crate::errors::SerializationError;

/// Stream entry field holding the JSON document.
pub const DATA_FIELD: &str = "data";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(default)]
    pub object_type: Option<String>,
    #[serde(default)]
    pub object_id: Value,
    #[serde(default)]
    pub payload: Option<Value>,
}

/// Decode the `data` field of an input entry into a content event.
pub fn decode_event(raw: &str) -> Result<ContentEvent, SerializationError> {
    let envelope: EventEnvelope =
        serde_json::from_str(raw).map_err(|e| SerializationError::JsonDeserializationFailed {
            data_type: "EventEnvelope".to_string(),
            source: e,
        })?;

    let object_type = envelope
        .object_type
        .filter(|value| !value.is_empty())
        .ok_or_else(|| SerializationError::MissingField {
            field: "object_type".to_string(),
        })?;

    let kind = ContentKind::parse(&object_type)
        .ok_or(SerializationError::UnknownObjectType { object_type })?;

    let payload = match envelope.payload {
        Some(payload @ Value::Object(_)) => payload,
        _ => {
            return Err(SerializationError::MissingField {
                field: "payload".to_string(),
            });
        }
    };

    let record = decode_record(kind, payload)?;
    ContentEvent::new(record)
}

fn decode_record(kind: ContentKind, payload: Value) -> Result<ContentRecord, SerializationError> {
    let failed = |e| SerializationError::JsonDeserializationFailed {
        data_type: kind.to_string(),
        source: e,
    };

    Ok(match kind {
        ContentKind::Thread => ContentRecord::Thread(serde_json::from_value(payload).map_err(failed)?),
        ContentKind::Post => ContentRecord::Post(serde_json::from_value(payload).map_err(failed)?),
        ContentKind::Comment => {
            ContentRecord::Comment(serde_json::from_value(payload).map_err(failed)?)
        }
    })
}

/// Encode a content event in the input envelope format.
pub fn encode_event(event: &ContentEvent) -> Result<String, SerializationError> {
    let content = event.content_ref();
    let object_id = match content.kind {
        ContentKind::Thread => content.tid,
        ContentKind::Post | ContentKind::Comment => content.pid,
    };

    let payload = match event.record() {
        ContentRecord::Thread(t) => serde_json::to_value(t),
        ContentRecord::Post(p) => serde_json::to_value(p),
        ContentRecord::Comment(c) => serde_json::to_value(c),
    }
    .map_err(|e| SerializationError::JsonSerializationFailed {
        data_type: content.kind.to_string(),
        source: e,
    })?;

    encode_json(&EventEnvelope {
        object_type: Some(content.kind.to_string()),
        object_id: Value::from(object_id),
        payload: Some(payload),
    })
}

pub fn encode_json<T: Serialize>(value: &T) -> Result<String, SerializationError> {
    serde_json::to_string(value).map_err(|e| SerializationError::JsonSerializationFailed {
        data_type: std::any::type_name::<T>().to_string(),
        source: e,
    })
}
