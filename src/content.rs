//! Normalized forum content events.
//!
//! A [`ContentEvent`] wraps one of the three record shapes produced by the
//! scraper (thread, post or comment) together with a JSON view of that record.
//! Rule conditions address the view with dot-separated field paths such as
//! `author.level`; a path that cannot be resolved yields `None`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::SerializationError;

/// Partition key. One forum (`fid`) is one unit of worker parallelism.
pub type PartitionKey = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Thread,
    Post,
    Comment,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Thread => "thread",
            ContentKind::Post => "post",
            ContentKind::Comment => "comment",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "thread" => Some(ContentKind::Thread),
            "post" => Some(ContentKind::Post),
            "comment" => Some(ContentKind::Comment),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Author {
    pub user_id: i64,
    pub portrait: String,
    pub user_name: String,
    pub nick_name: String,
    pub level: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thread {
    pub fid: PartitionKey,
    pub fname: String,
    pub tid: i64,
    /// Post id of the first floor.
    pub pid: i64,
    pub title: String,
    pub text: String,
    pub author: Author,
    pub create_time: i64,
    pub reply_num: i64,
    pub view_num: i64,
    pub share_num: i64,
    pub agree: i64,
    pub disagree: i64,
    pub is_good: bool,
    pub is_top: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Post {
    pub fid: PartitionKey,
    pub fname: String,
    pub tid: i64,
    pub pid: i64,
    pub floor: i32,
    pub text: String,
    pub author: Author,
    pub create_time: i64,
    pub reply_num: i64,
    pub agree: i64,
    pub disagree: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Comment {
    pub fid: PartitionKey,
    pub fname: String,
    pub tid: i64,
    pub pid: i64,
    /// Post the comment replies under.
    pub ppid: i64,
    pub floor: i32,
    pub text: String,
    pub author: Author,
    pub create_time: i64,
    pub agree: i64,
    pub disagree: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentRecord {
    Thread(Thread),
    Post(Post),
    Comment(Comment),
}

impl ContentRecord {
    pub fn kind(&self) -> ContentKind {
        match self {
            ContentRecord::Thread(_) => ContentKind::Thread,
            ContentRecord::Post(_) => ContentKind::Post,
            ContentRecord::Comment(_) => ContentKind::Comment,
        }
    }

    pub fn fid(&self) -> PartitionKey {
        match self {
            ContentRecord::Thread(t) => t.fid,
            ContentRecord::Post(p) => p.fid,
            ContentRecord::Comment(c) => c.fid,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            ContentRecord::Thread(t) => &t.text,
            ContentRecord::Post(p) => &p.text,
            ContentRecord::Comment(c) => &c.text,
        }
    }

    pub fn author(&self) -> &Author {
        match self {
            ContentRecord::Thread(t) => &t.author,
            ContentRecord::Post(p) => &p.author,
            ContentRecord::Comment(c) => &c.author,
        }
    }

    /// Title and body for threads, body alone otherwise.
    pub fn full_text(&self) -> String {
        match self {
            ContentRecord::Thread(t) if t.text.is_empty() => t.title.clone(),
            ContentRecord::Thread(t) => format!("{}\n{}", t.title, t.text),
            other => other.text().to_string(),
        }
    }

    pub fn content_ref(&self) -> ContentRef {
        let (tid, pid) = match self {
            ContentRecord::Thread(t) => (t.tid, t.pid),
            ContentRecord::Post(p) => (p.tid, p.pid),
            ContentRecord::Comment(c) => (c.tid, c.pid),
        };
        ContentRef {
            kind: self.kind(),
            fid: self.fid(),
            tid,
            pid,
        }
    }

    fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            ContentRecord::Thread(t) => serde_json::to_value(t),
            ContentRecord::Post(p) => serde_json::to_value(p),
            ContentRecord::Comment(c) => serde_json::to_value(c),
        }
    }
}

/// Identifies the reviewed object in output payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRef {
    pub kind: ContentKind,
    pub fid: PartitionKey,
    pub tid: i64,
    pub pid: i64,
}

/// An immutable content event with its field view.
///
/// Besides the record's own fields the view carries `object_type`,
/// `full_text` and `content` (the body text).
#[derive(Debug, Clone, PartialEq)]
pub struct ContentEvent {
    record: ContentRecord,
    view: Value,
}

impl ContentEvent {
    pub fn new(record: ContentRecord) -> Result<Self, SerializationError> {
        let mut view =
            record
                .to_value()
                .map_err(|e| SerializationError::JsonSerializationFailed {
                    data_type: record.kind().to_string(),
                    source: e,
                })?;

        if let Value::Object(fields) = &mut view {
            fields.insert(
                "object_type".to_string(),
                Value::String(record.kind().to_string()),
            );
            fields.insert("full_text".to_string(), Value::String(record.full_text()));
            fields.insert(
                "content".to_string(),
                Value::String(record.text().to_string()),
            );
        }

        Ok(Self { record, view })
    }

    pub fn record(&self) -> &ContentRecord {
        &self.record
    }

    pub fn kind(&self) -> ContentKind {
        self.record.kind()
    }

    pub fn fid(&self) -> PartitionKey {
        self.record.fid()
    }

    pub fn content_ref(&self) -> ContentRef {
        self.record.content_ref()
    }

    /// The JSON view that field paths are resolved against.
    pub fn view(&self) -> &Value {
        &self.view
    }

    /// Resolve a dot-separated path. Missing keys, out-of-range indexes and
    /// `null` all resolve to `None`.
    pub fn field(&self, path: &str) -> Option<&Value> {
        resolve_path(&self.view, path)
    }
}

pub(crate) fn resolve_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }

    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(fields) => fields.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    match current {
        Value::Null => None,
        value => Some(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_thread() -> ContentEvent {
        ContentEvent::new(ContentRecord::Thread(Thread {
            fid: 1,
            tid: 100,
            pid: 1000,
            title: "Weekly thread".to_string(),
            text: "buy spam now".to_string(),
            author: Author {
                user_id: 7,
                level: 5,
                user_name: "alice".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }))
        .unwrap()
    }

    #[test]
    fn test_nested_field_access() {
        let event = sample_thread();
        assert_eq!(event.field("author.level"), Some(&json!(5)));
        assert_eq!(event.field("author.user_name"), Some(&json!("alice")));
        assert_eq!(event.field("text"), Some(&json!("buy spam now")));
        assert_eq!(event.field("object_type"), Some(&json!("thread")));
        assert_eq!(event.field("content"), Some(&json!("buy spam now")));
    }

    #[test]
    fn test_unresolved_paths_are_absent() {
        let event = sample_thread();
        assert_eq!(event.field("author.missing"), None);
        assert_eq!(event.field("text.inner"), None);
        assert_eq!(event.field(""), None);
        assert_eq!(event.field("nope"), None);
    }

    #[test]
    fn test_array_index_and_null() {
        let root = json!({"images": [{"url": "a"}, {"url": null}]});
        assert_eq!(resolve_path(&root, "images.0.url"), Some(&json!("a")));
        assert_eq!(resolve_path(&root, "images.1.url"), None);
        assert_eq!(resolve_path(&root, "images.9.url"), None);
        assert_eq!(resolve_path(&root, "images.x"), None);
    }

    #[test]
    fn test_full_text() {
        let event = sample_thread();
        assert_eq!(
            event.field("full_text"),
            Some(&json!("Weekly thread\nbuy spam now"))
        );

        let title_only = ContentRecord::Thread(Thread {
            title: "only".to_string(),
            ..Default::default()
        });
        assert_eq!(title_only.full_text(), "only");

        let comment = ContentRecord::Comment(Comment {
            text: "reply".to_string(),
            ..Default::default()
        });
        assert_eq!(comment.full_text(), "reply");
    }

    #[test]
    fn test_content_ref() {
        let event = sample_thread();
        let content_ref = event.content_ref();
        assert_eq!(content_ref.kind, ContentKind::Thread);
        assert_eq!(content_ref.fid, 1);
        assert_eq!(content_ref.tid, 100);
        assert_eq!(content_ref.pid, 1000);
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!(ContentKind::parse("post"), Some(ContentKind::Post));
        assert_eq!(ContentKind::parse("Post"), None);
    }
}
