mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

use common::{contains, eventually, pipeline, stored_rule, thread, worker_config};
use tieba_reviewer::content::ContentEvent;
use tieba_reviewer::errors::{TransportError, WorkerError};
use tieba_reviewer::functions::{FunctionRegistry, RuleFunction};
use tieba_reviewer::rules::{DEFAULT_MAX_RULE_DEPTH, RuleSnapshot, snapshot_channel};
use tieba_reviewer::tasks::{ReviewWorker, WorkerState};

#[tokio::test]
async fn test_entry_is_redelivered_after_crash_before_ack() {
    let p = pipeline(FunctionRegistry::new());
    let (snapshot, _) = RuleSnapshot::build(
        1,
        1,
        vec![stored_rule(1, 1, 0, contains("content", "spam"))],
        DEFAULT_MAX_RULE_DEPTH,
    );
    let (publisher, reader) = snapshot_channel(snapshot);
    let entry_id = p
        .stream
        .append_event(1, &thread(1, 7, "buy spam now"))
        .expect("Failed to append entry");

    p.stream
        .fail_acks(None, TransportError::fatal("XACK", "connection lost"));
    let crashed = ReviewWorker::new(1, worker_config("reviewer-1"), p.deps.clone(), reader);
    let result = crashed.run(CancellationToken::new()).await;

    assert!(matches!(
        result,
        Err(WorkerError::TransportFatal { partition: 1, .. })
    ));
    assert_eq!(p.results.len(), 1);
    assert_eq!(p.stream.pending_for(1, "reviewer-1"), vec![entry_id.clone()]);

    p.stream.clear_failures();
    let restarted = ReviewWorker::new(
        1,
        worker_config("reviewer-1"),
        p.deps.clone(),
        publisher.subscribe(),
    );
    let drain = CancellationToken::new();
    let task = tokio::spawn(restarted.run(drain.clone()));

    eventually("redelivered entry to be acknowledged", || {
        p.stream.pending_count(1) == 0
    })
    .await;
    drain.cancel();
    task.await
        .expect("Failed to join worker")
        .expect("Failed to run worker");

    let results = p.results.items();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.entry_id == entry_id));
    assert!(p.dead_letters.is_empty());
}

#[tokio::test]
async fn test_undeliverable_entry_is_dead_lettered_exactly_once() {
    let p = pipeline(FunctionRegistry::new());
    let (snapshot, _) = RuleSnapshot::build(
        1,
        1,
        vec![stored_rule(1, 1, 0, contains("content", "spam"))],
        DEFAULT_MAX_RULE_DEPTH,
    );
    let (_publisher, reader) = snapshot_channel(snapshot);

    p.results
        .fail_always(TransportError::transient("XADD", "READONLY replica"));
    let stuck = p
        .stream
        .append_event(1, &thread(1, 1, "spam"))
        .expect("Failed to append entry");
    p.stream
        .append_event(1, &thread(1, 2, "nothing to see"))
        .expect("Failed to append entry");

    let worker = ReviewWorker::new(1, worker_config("reviewer-1"), p.deps.clone(), reader);
    let mut state = worker.state();
    let drain = CancellationToken::new();
    let task = tokio::spawn(worker.run(drain.clone()));

    eventually("entry to be dead-lettered", || {
        p.dead_letters.len() == 1 && p.stream.pending_count(1) == 0
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let records = p.dead_letters.items();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].entry_id, stuck);
    assert_eq!(records[0].partition, 1);
    assert_eq!(records[0].attempts, 3);
    assert!(records[0].raw.as_deref().is_some_and(|raw| raw.contains("spam")));
    assert!(p.results.is_empty());

    p.results.clear_failures();
    p.stream
        .append_event(1, &thread(1, 3, "more spam"))
        .expect("Failed to append entry");
    eventually("partition to keep flowing", || p.results.len() == 1).await;
    assert_eq!(p.dead_letters.len(), 1);

    drain.cancel();
    task.await
        .expect("Failed to join worker")
        .expect("Failed to run worker");
    state
        .wait_for(|s| *s == WorkerState::Stopped)
        .await
        .expect("Failed to observe stopped state");
}

/// Blocks the first caller until opened, reporting when it was entered.
struct Gate {
    entered: Arc<Notify>,
    open: watch::Receiver<bool>,
}

#[async_trait]
impl RuleFunction for Gate {
    async fn call(
        &self,
        _content: &ContentEvent,
        _args: &[Value],
        _kwargs: &Map<String, Value>,
    ) -> anyhow::Result<Value> {
        self.entered.notify_one();
        let mut open = self.open.clone();
        open.wait_for(|open| *open).await?;
        Ok(json!(true))
    }
}

#[tokio::test]
async fn test_reload_mid_batch_applies_to_next_batch() {
    let entered = Arc::new(Notify::new());
    let (open_tx, open_rx) = watch::channel(false);
    let registry = FunctionRegistry::new().register(
        "gate",
        Arc::new(Gate {
            entered: entered.clone(),
            open: open_rx,
        }),
    );
    let p = pipeline(registry);

    let gated = json!({
        "logic": "AND",
        "conditions": [
            {"function": {"name": "gate"}, "operator": "eq", "value": true},
            contains("content", "spam"),
        ]
    });
    let (snapshot, _) = RuleSnapshot::build(
        1,
        1,
        vec![stored_rule(1, 1, 0, gated)],
        DEFAULT_MAX_RULE_DEPTH,
    );
    let (publisher, reader) = snapshot_channel(snapshot);

    p.stream
        .append_event(1, &thread(1, 1, "spam one"))
        .expect("Failed to append entry");
    p.stream
        .append_event(1, &thread(1, 2, "spam two"))
        .expect("Failed to append entry");

    let drain = CancellationToken::new();
    let task = tokio::spawn(
        ReviewWorker::new(1, worker_config("reviewer-1"), p.deps.clone(), reader)
            .run(drain.clone()),
    );

    tokio::time::timeout(Duration::from_secs(5), entered.notified())
        .await
        .expect("Failed to enter gate");

    let (replacement, _) = RuleSnapshot::build(
        1,
        publisher.next_version(),
        vec![stored_rule(2, 1, 0, contains("content", "spam"))],
        DEFAULT_MAX_RULE_DEPTH,
    );
    publisher.publish(replacement);
    open_tx.send_replace(true);

    eventually("in-flight batch to finish", || p.results.len() == 2).await;
    p.stream
        .append_event(1, &thread(1, 3, "spam three"))
        .expect("Failed to append entry");
    eventually("next batch to finish", || p.results.len() == 3).await;

    drain.cancel();
    task.await
        .expect("Failed to join worker")
        .expect("Failed to run worker");

    let rule_ids: Vec<i64> = p.results.items().iter().map(|r| r.rule_id).collect();
    assert_eq!(rule_ids, vec![1, 1, 2]);
}

#[tokio::test]
async fn test_idle_entries_of_a_dead_consumer_are_claimed() {
    let p = pipeline(FunctionRegistry::new());
    let (snapshot, _) = RuleSnapshot::build(
        1,
        1,
        vec![stored_rule(1, 1, 0, contains("content", "spam"))],
        DEFAULT_MAX_RULE_DEPTH,
    );
    let (publisher, reader) = snapshot_channel(snapshot);

    let entry_id = p
        .stream
        .append_event(1, &thread(1, 1, "spam"))
        .expect("Failed to append entry");
    p.stream
        .fail_acks(None, TransportError::fatal("XACK", "connection lost"));
    let _ = ReviewWorker::new(1, worker_config("reviewer-dead"), p.deps.clone(), reader)
        .run(CancellationToken::new())
        .await;
    p.stream.clear_failures();
    assert_eq!(p.stream.pending_for(1, "reviewer-dead"), vec![entry_id.clone()]);

    let mut config = worker_config("reviewer-live");
    config.idle_recovery = Some(tieba_reviewer::tasks::IdleRecovery {
        interval: Duration::from_millis(20),
        min_idle: Duration::from_millis(10),
    });
    let drain = CancellationToken::new();
    let task = tokio::spawn(
        ReviewWorker::new(1, config, p.deps.clone(), publisher.subscribe()).run(drain.clone()),
    );

    eventually("idle entry to be claimed and acknowledged", || {
        p.stream.pending_count(1) == 0
    })
    .await;
    drain.cancel();
    task.await
        .expect("Failed to join worker")
        .expect("Failed to run worker");

    assert_eq!(p.results.len(), 2);
}
