#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tieba_reviewer::content::{Author, ContentEvent, ContentRecord, PartitionKey, Post, Thread};
use tieba_reviewer::dispatcher::{DeadLetter, RetryPolicy, ReviewResultDispatcher, ReviewResultPayload};
use tieba_reviewer::engine::RuleMatcher;
use tieba_reviewer::functions::{FunctionProvider, FunctionRegistry, LocalProvider};
use tieba_reviewer::metrics::NoOpMetricsPublisher;
use tieba_reviewer::rules::ReviewRule;
use tieba_reviewer::tasks::{ReviewWorkerConfig, WorkerDeps};
use tieba_reviewer::transport::{MemoryEventStream, MemoryOutputSink};

pub fn thread(fid: PartitionKey, tid: i64, text: &str) -> ContentEvent {
    ContentEvent::new(ContentRecord::Thread(Thread {
        fid,
        fname: "rust".to_string(),
        tid,
        pid: tid * 10,
        title: "title".to_string(),
        text: text.to_string(),
        author: Author {
            user_id: 1,
            level: 5,
            ..Default::default()
        },
        ..Default::default()
    }))
    .expect("Failed to build thread")
}

pub fn post(fid: PartitionKey, pid: i64, text: &str) -> ContentEvent {
    ContentEvent::new(ContentRecord::Post(Post {
        fid,
        fname: "rust".to_string(),
        tid: 1,
        pid,
        floor: 2,
        text: text.to_string(),
        ..Default::default()
    }))
    .expect("Failed to build post")
}

/// A rule decoded from its stored JSON form.
pub fn stored_rule(id: i64, fid: PartitionKey, priority: i32, trigger: Value) -> ReviewRule {
    serde_json::from_value(json!({
        "id": id,
        "name": format!("rule-{id}"),
        "enabled": true,
        "priority": priority,
        "fid": fid,
        "target_type": "all",
        "trigger": trigger,
        "actions": [{"type": "delete", "params": {"reason": "spam"}}],
    }))
    .expect("Failed to decode rule")
}

pub fn contains(field: &str, needle: &str) -> Value {
    json!({"field": field, "operator": "contains", "value": needle})
}

pub struct Pipeline {
    pub stream: Arc<MemoryEventStream>,
    pub results: Arc<MemoryOutputSink<ReviewResultPayload>>,
    pub dead_letters: Arc<MemoryOutputSink<DeadLetter>>,
    pub deps: WorkerDeps,
}

pub fn pipeline(registry: FunctionRegistry) -> Pipeline {
    let stream = Arc::new(MemoryEventStream::new().with_block(Duration::from_millis(10)));
    let results = MemoryOutputSink::new();
    let dead_letters = MemoryOutputSink::new();
    let provider = FunctionProvider::Local(LocalProvider::new(
        Arc::new(registry),
        Duration::from_secs(2),
    ));
    let deps = WorkerDeps {
        stream: stream.clone(),
        matcher: Arc::new(RuleMatcher::new(Arc::new(provider))),
        dispatcher: ReviewResultDispatcher::new(
            results.clone(),
            dead_letters.clone(),
            RetryPolicy {
                max_attempts: 2,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            Arc::new(NoOpMetricsPublisher),
        ),
        metrics: Arc::new(NoOpMetricsPublisher),
    };
    Pipeline {
        stream,
        results,
        dead_letters,
        deps,
    }
}

pub fn worker_config(consumer: &str) -> ReviewWorkerConfig {
    let mut config = ReviewWorkerConfig::new(consumer);
    config.max_attempts = 3;
    config.backoff.initial_delay = Duration::from_millis(1);
    config.backoff.max_delay = Duration::from_millis(5);
    config
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "Timed out waiting for {what}");
}
