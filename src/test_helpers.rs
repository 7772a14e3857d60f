//! Shared fixtures for unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::content::{Author, ContentEvent, ContentRecord, PartitionKey, Thread};
use crate::errors::FunctionError;
use crate::functions::{FunctionCall, RemoteFunctionClient};
use crate::metrics::MetricsPublisher;
use crate::rules::{ReviewRule, RuleNode, TargetType};

/// A thread in `fid` with `text` as its body and an empty title.
pub fn thread_event(fid: PartitionKey, text: &str) -> ContentEvent {
    thread_event_by(fid, text, 1000, 1)
}

pub fn thread_event_by(fid: PartitionKey, text: &str, user_id: i64, level: i32) -> ContentEvent {
    ContentEvent::new(ContentRecord::Thread(Thread {
        fid,
        fname: format!("forum-{fid}"),
        tid: 100,
        pid: 200,
        text: text.to_string(),
        author: Author {
            user_id,
            user_name: format!("user-{user_id}"),
            level,
            ..Default::default()
        },
        create_time: 1_700_000_000,
        ..Default::default()
    }))
    .expect("Failed to build thread event")
}

/// An enabled rule in partition 1 applying to every content kind.
pub fn rule(id: i64, priority: i32, trigger: RuleNode) -> ReviewRule {
    ReviewRule {
        id,
        name: format!("rule-{id}"),
        enabled: true,
        priority,
        partition_key: 1,
        target_type: TargetType::All,
        trigger,
        actions: vec![],
    }
}

/// Remote client that returns a fixed value and records call names.
pub struct RecordingRemoteClient {
    value: Value,
    delay: Option<Duration>,
    calls: Arc<Mutex<Vec<String>>>,
    in_flight: Arc<AtomicUsize>,
}

impl RecordingRemoteClient {
    pub fn returning(value: Value) -> Self {
        Self {
            value,
            delay: None,
            calls: Arc::new(Mutex::new(vec![])),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Calls started but not yet returned or dropped.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteFunctionClient for RecordingRemoteClient {
    async fn invoke(
        &self,
        call: &FunctionCall,
        _content: &ContentEvent,
        _timeout: Duration,
    ) -> Result<Value, FunctionError> {
        self.calls.lock().push(call.name.clone());
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight(self.in_flight.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.value.clone())
    }
}

/// Metrics publisher that keeps tagged counter increments as
/// `key:tag=value` strings.
#[derive(Default)]
pub struct RecordingMetricsPublisher {
    tagged: Mutex<Vec<String>>,
}

impl RecordingMetricsPublisher {
    pub fn tagged(&self) -> Vec<String> {
        self.tagged.lock().clone()
    }
}

#[async_trait]
impl MetricsPublisher for RecordingMetricsPublisher {
    async fn incr(&self, _key: &str) {}
    async fn count(&self, _key: &str, _value: u64) {}
    async fn incr_with_tags(&self, key: &str, tags: &[(&str, &str)]) {
        let mut tagged = self.tagged.lock();
        for (name, value) in tags {
            tagged.push(format!("{key}:{name}={value}"));
        }
    }
    async fn count_with_tags(&self, _key: &str, _value: u64, _tags: &[(&str, &str)]) {}
    async fn gauge(&self, _key: &str, _value: u64) {}
    async fn gauge_with_tags(&self, _key: &str, _value: u64, _tags: &[(&str, &str)]) {}
    async fn time(&self, _key: &str, _millis: u64) {}
    async fn time_with_tags(&self, _key: &str, _millis: u64, _tags: &[(&str, &str)]) {}
    async fn histogram(&self, _key: &str, _value: u64) {}
    async fn histogram_with_tags(&self, _key: &str, _value: u64, _tags: &[(&str, &str)]) {}
}
