//! Per-partition review worker.
//!
//! ```text
//! STARTING -> RECOVERING -> STEADY -> DRAINING -> STOPPED
//!     \            \           \
//!      `------------`-----------`--> FAILED (fatal transport error)
//! ```
//!
//! An entry is acknowledged only after every payload it produced has been
//! published, or after it has been dead-lettered. Everything else stays on
//! the consumer's pending list and is re-read, either by this worker before
//! it reads new entries or by the next worker with the same consumer name.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::content::PartitionKey;
use crate::dispatcher::{DeadLetter, RetryPolicy, ReviewResultDispatcher, build_payloads};
use crate::engine::RuleMatcher;
use crate::errors::{DispatchError, TransportError, WorkerError};
use crate::metrics::{MetricTimer, SharedMetricsPublisher};
use crate::rules::snapshot::{RuleSnapshot, SnapshotReader};
use crate::transport::{CURSOR_START, EventStream, StreamEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Recovering,
    Steady,
    Draining,
    Stopped,
    Failed,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Starting => "STARTING",
            WorkerState::Recovering => "RECOVERING",
            WorkerState::Steady => "STEADY",
            WorkerState::Draining => "DRAINING",
            WorkerState::Stopped => "STOPPED",
            WorkerState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Stopped | WorkerState::Failed)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Periodic takeover of entries abandoned by other consumers.
#[derive(Debug, Clone, Copy)]
pub struct IdleRecovery {
    pub interval: Duration,
    pub min_idle: Duration,
}

#[derive(Debug, Clone)]
pub struct ReviewWorkerConfig {
    pub consumer_name: String,
    pub batch_size: usize,
    /// Processing attempts per entry before it is dead-lettered.
    pub max_attempts: u32,
    pub idle_recovery: Option<IdleRecovery>,
    /// Delays between retries of transient read and ack failures. Only the
    /// delays are used; these retries continue until the worker is drained.
    pub backoff: RetryPolicy,
}

impl ReviewWorkerConfig {
    pub fn new(consumer_name: impl Into<String>) -> Self {
        Self {
            consumer_name: consumer_name.into(),
            batch_size: 10,
            max_attempts: 5,
            idle_recovery: None,
            backoff: RetryPolicy {
                max_attempts: u32::MAX,
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(30),
            },
        }
    }

    pub fn from_config(config: &crate::config::Config) -> Self {
        let recovery = &config.recovery;
        Self {
            batch_size: config.stream.batch_size,
            max_attempts: config.dispatch.max_dispatch_attempts,
            idle_recovery: recovery.enabled.then_some(IdleRecovery {
                interval: recovery.interval,
                min_idle: recovery.min_idle,
            }),
            ..Self::new(config.stream.consumer_name.clone())
        }
    }
}

/// Collaborators shared by every worker.
#[derive(Clone)]
pub struct WorkerDeps {
    pub stream: Arc<dyn EventStream>,
    pub matcher: Arc<RuleMatcher>,
    pub dispatcher: ReviewResultDispatcher,
    pub metrics: SharedMetricsPublisher,
}

pub struct ReviewWorker {
    partition: PartitionKey,
    config: ReviewWorkerConfig,
    deps: WorkerDeps,
    snapshots: SnapshotReader,
    state: watch::Sender<WorkerState>,
    /// Failed processing attempts of entries still pending on this consumer.
    attempts: HashMap<String, u32>,
}

impl ReviewWorker {
    pub fn new(
        partition: PartitionKey,
        config: ReviewWorkerConfig,
        deps: WorkerDeps,
        snapshots: SnapshotReader,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Starting);
        Self {
            partition,
            config,
            deps,
            snapshots,
            state,
            attempts: HashMap::new(),
        }
    }

    pub fn state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Run until `drain` is cancelled or a fatal transport error occurs.
    ///
    /// Cancelling `drain` never interrupts a batch; the worker finishes the
    /// batch in progress, then leaves the group.
    pub async fn run(mut self, drain: CancellationToken) -> Result<(), WorkerError> {
        info!(
            partition = self.partition,
            consumer = %self.config.consumer_name,
            "Review worker starting"
        );

        match self.consume(&drain).await {
            Ok(()) => {
                self.set_state(WorkerState::Draining);
                if let Err(e) = self
                    .deps
                    .stream
                    .leave_group(self.partition, &self.config.consumer_name)
                    .await
                {
                    warn!(partition = self.partition, error = ?e, "Failed to leave consumer group");
                }
                self.set_state(WorkerState::Stopped);
                Ok(())
            }
            Err(e) => {
                error!(partition = self.partition, error = ?e, "Review worker failed");
                self.set_state(WorkerState::Failed);
                Err(e)
            }
        }
    }

    async fn consume(&mut self, drain: &CancellationToken) -> Result<(), WorkerError> {
        if !self.join(drain).await? {
            return Ok(());
        }
        let snapshot = self.snapshots.latest();
        info!(
            partition = self.partition,
            version = snapshot.version(),
            rules = snapshot.len(),
            "Rule snapshot loaded"
        );

        self.set_state(WorkerState::Recovering);
        self.recover(drain).await?;

        self.set_state(WorkerState::Steady);
        self.steady(drain).await
    }

    /// Join the consumer group. Returns `false` when drained first.
    async fn join(&self, drain: &CancellationToken) -> Result<bool, WorkerError> {
        let mut failures = 0;
        loop {
            if drain.is_cancelled() {
                return Ok(false);
            }
            match self.deps.stream.join_group(self.partition).await {
                Ok(()) => return Ok(true),
                Err(e) if e.is_transient() => {
                    failures += 1;
                    if !self.back_off(drain, failures, "join_group", &e).await {
                        return Ok(false);
                    }
                }
                Err(e) => return Err(self.fatal(e)),
            }
        }
    }

    /// Reprocess entries delivered to this consumer before a restart.
    async fn recover(&mut self, drain: &CancellationToken) -> Result<(), WorkerError> {
        let mut cursor = CURSOR_START.to_string();
        let mut failures = 0;
        let mut recovered = 0usize;

        while !drain.is_cancelled() {
            let entries = match self
                .deps
                .stream
                .reclaim_pending(
                    self.partition,
                    &self.config.consumer_name,
                    &cursor,
                    self.config.batch_size,
                )
                .await
            {
                Ok(entries) => entries,
                Err(e) if e.is_transient() => {
                    failures += 1;
                    if !self.back_off(drain, failures, "reclaim_pending", &e).await {
                        break;
                    }
                    continue;
                }
                Err(e) => return Err(self.fatal(e)),
            };
            failures = 0;

            let Some(last) = entries.last() else {
                break;
            };
            cursor = last.id.clone();
            recovered += entries.len();
            self.process_batch(entries, drain).await?;
        }

        if recovered > 0 {
            info!(partition = self.partition, recovered, "Recovered pending entries");
        }
        Ok(())
    }

    async fn steady(&mut self, drain: &CancellationToken) -> Result<(), WorkerError> {
        let mut failures = 0;
        let mut claim_cursor = CURSOR_START.to_string();
        let mut next_claim = self
            .config
            .idle_recovery
            .map(|recovery| Instant::now() + recovery.interval);

        while !drain.is_cancelled() {
            let read = match (self.config.idle_recovery, next_claim) {
                (Some(recovery), Some(due)) if Instant::now() >= due => {
                    match self.claim_idle(recovery, &mut claim_cursor).await {
                        Ok(entries) => {
                            next_claim = Some(if claim_cursor == CURSOR_START {
                                Instant::now() + recovery.interval
                            } else {
                                Instant::now()
                            });
                            Ok(entries)
                        }
                        Err(e) => {
                            claim_cursor = CURSOR_START.to_string();
                            next_claim = Some(Instant::now() + recovery.interval);
                            Err(e)
                        }
                    }
                }
                _ if !self.attempts.is_empty() => self.read_own_pending().await,
                _ => {
                    self.deps
                        .stream
                        .read_batch(
                            self.partition,
                            &self.config.consumer_name,
                            self.config.batch_size,
                        )
                        .await
                }
            };

            let entries = match read {
                Ok(entries) => entries,
                Err(e) if e.is_transient() => {
                    failures += 1;
                    if !self.back_off(drain, failures, "read", &e).await {
                        break;
                    }
                    continue;
                }
                Err(e) => return Err(self.fatal(e)),
            };
            failures = 0;

            self.process_batch(entries, drain).await?;
        }

        Ok(())
    }

    /// Re-read this consumer's pending entries so failed ones are retried
    /// before new entries. Forgets attempt counts once nothing is pending.
    async fn read_own_pending(&mut self) -> Result<Vec<StreamEntry>, TransportError> {
        let entries = self
            .deps
            .stream
            .reclaim_pending(
                self.partition,
                &self.config.consumer_name,
                CURSOR_START,
                self.config.batch_size,
            )
            .await?;

        if entries.is_empty() {
            debug!(
                partition = self.partition,
                forgotten = self.attempts.len(),
                "No pending entries left, clearing attempt counts"
            );
            self.attempts.clear();
        }
        Ok(entries)
    }

    async fn claim_idle(
        &self,
        recovery: IdleRecovery,
        cursor: &mut String,
    ) -> Result<Vec<StreamEntry>, TransportError> {
        let claimed = self
            .deps
            .stream
            .claim_idle(
                self.partition,
                &self.config.consumer_name,
                recovery.min_idle,
                cursor,
                self.config.batch_size,
            )
            .await?;

        if !claimed.entries.is_empty() {
            info!(
                partition = self.partition,
                claimed = claimed.entries.len(),
                "Claimed idle entries from other consumers"
            );
        }
        *cursor = claimed.next_cursor;
        Ok(claimed.entries)
    }

    /// Process entries in stream order against one snapshot.
    async fn process_batch(
        &mut self,
        entries: Vec<StreamEntry>,
        drain: &CancellationToken,
    ) -> Result<(), WorkerError> {
        if entries.is_empty() {
            return Ok(());
        }

        let snapshot = self.snapshots.latest();
        let timer = MetricTimer::new("reviewer.batch.duration", self.deps.metrics.clone())
            .with_tag("partition", self.partition.to_string());
        debug!(
            partition = self.partition,
            count = entries.len(),
            version = snapshot.version(),
            "Processing batch"
        );

        for entry in entries {
            self.process_entry(entry, &snapshot, drain).await?;
        }

        timer.record().await;
        Ok(())
    }

    async fn process_entry(
        &mut self,
        entry: StreamEntry,
        snapshot: &RuleSnapshot,
        drain: &CancellationToken,
    ) -> Result<(), WorkerError> {
        self.deps.metrics.incr("reviewer.entries.processed").await;

        let content = match &entry.event {
            Ok(content) => content,
            Err(e) => {
                warn!(
                    partition = self.partition,
                    entry_id = %entry.id,
                    error = %e,
                    "Malformed entry"
                );
                self.deps.metrics.incr("reviewer.entries.malformed").await;
                let record =
                    DeadLetter::new(self.partition, &entry.id, 0, e.to_string(), entry.raw.clone());
                return self.dead_letter(&entry.id, record, drain).await;
            }
        };

        let outcome = self
            .deps
            .matcher
            .match_rules(content, snapshot.rules())
            .await;
        for e in &outcome.function_errors {
            self.deps
                .metrics
                .incr_with_tags("reviewer.function.error", &[("kind", e.kind())])
                .await;
        }
        if outcome.is_match() {
            self.deps
                .metrics
                .count("reviewer.rules.matched", outcome.matches.len() as u64)
                .await;
        }

        let payloads = build_payloads(&entry.id, content, &outcome);
        match self.deps.dispatcher.dispatch(&payloads).await {
            Ok(published) => {
                debug!(
                    partition = self.partition,
                    entry_id = %entry.id,
                    published,
                    "Entry dispatched"
                );
                self.attempts.remove(&entry.id);
                self.ack(&entry.id, drain).await
            }
            Err(DispatchError::Fatal(e)) => Err(self.fatal(e)),
            Err(e) => {
                let attempts = {
                    let attempts = self.attempts.entry(entry.id.clone()).or_insert(0);
                    *attempts += 1;
                    *attempts
                };

                if attempts >= self.config.max_attempts {
                    let record = DeadLetter::new(
                        self.partition,
                        &entry.id,
                        attempts,
                        e.to_string(),
                        entry.raw.clone(),
                    );
                    return self.dead_letter(&entry.id, record, drain).await;
                }

                warn!(
                    partition = self.partition,
                    entry_id = %entry.id,
                    attempts,
                    max_attempts = self.config.max_attempts,
                    error = %e,
                    "Dispatch failed, entry left pending"
                );
                self.deps.metrics.incr("reviewer.entries.retry").await;
                Ok(())
            }
        }
    }

    /// Publish a dead-letter record, then acknowledge the entry. A record
    /// that cannot be published leaves the entry pending for another try.
    async fn dead_letter(
        &mut self,
        entry_id: &str,
        record: DeadLetter,
        drain: &CancellationToken,
    ) -> Result<(), WorkerError> {
        match self.deps.dispatcher.dead_letter(&record).await {
            Ok(_) => {
                self.attempts.remove(entry_id);
                self.ack(entry_id, drain).await
            }
            Err(DispatchError::Fatal(e)) => Err(self.fatal(e)),
            Err(e) => {
                warn!(
                    partition = self.partition,
                    entry_id,
                    error = %e,
                    "Dead-letter publish failed, entry left pending"
                );
                self.attempts
                    .entry(entry_id.to_string())
                    .or_insert(record.attempts);
                Ok(())
            }
        }
    }

    /// Acknowledge an entry, retrying transient failures until drained. An
    /// entry whose ack is abandoned stays pending and is reprocessed later.
    async fn ack(&self, entry_id: &str, drain: &CancellationToken) -> Result<(), WorkerError> {
        let mut failures = 0;
        loop {
            match self.deps.stream.ack(self.partition, entry_id).await {
                Ok(()) => {
                    self.deps.metrics.incr("reviewer.entries.acked").await;
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    failures += 1;
                    if !self.back_off(drain, failures, "ack", &e).await {
                        warn!(partition = self.partition, entry_id, "Ack abandoned while draining");
                        return Ok(());
                    }
                }
                Err(e) => return Err(self.fatal(e)),
            }
        }
    }

    /// Sleep before retrying a transient failure. Returns `false` if the
    /// worker was drained while waiting.
    async fn back_off(
        &self,
        drain: &CancellationToken,
        failures: u32,
        operation: &str,
        error: &TransportError,
    ) -> bool {
        let delay = self.config.backoff.delay_for(failures);
        warn!(
            partition = self.partition,
            operation,
            failures,
            delay_ms = delay.as_millis() as u64,
            error = ?error,
            "Transient transport failure, backing off"
        );

        tokio::select! {
            () = drain.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    fn fatal(&self, source: TransportError) -> WorkerError {
        WorkerError::TransportFatal {
            partition: self.partition,
            source,
        }
    }

    fn set_state(&self, state: WorkerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(
                partition = self.partition,
                from = %previous,
                to = %state,
                "Worker state changed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::ReviewResultPayload;
    use crate::functions::{FunctionProvider, FunctionRegistry, LocalProvider};
    use crate::metrics::NoOpMetricsPublisher;
    use crate::rules::snapshot::{SnapshotPublisher, snapshot_channel};
    use crate::rules::{Condition, Operator};
    use crate::test_helpers::{rule, thread_event};
    use crate::transport::{MemoryEventStream, MemoryOutputSink};
    use serde_json::json;

    struct Harness {
        stream: Arc<MemoryEventStream>,
        results: Arc<MemoryOutputSink<ReviewResultPayload>>,
        dead_letters: Arc<MemoryOutputSink<DeadLetter>>,
        deps: WorkerDeps,
    }

    fn harness() -> Harness {
        let stream = Arc::new(MemoryEventStream::new().with_block(Duration::from_millis(10)));
        let results = MemoryOutputSink::new();
        let dead_letters = MemoryOutputSink::new();
        let provider = FunctionProvider::Local(LocalProvider::new(
            Arc::new(FunctionRegistry::new()),
            Duration::from_secs(1),
        ));
        let retry = RetryPolicy {
            max_attempts: 1,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        let deps = WorkerDeps {
            stream: stream.clone(),
            matcher: Arc::new(RuleMatcher::new(Arc::new(provider))),
            dispatcher: ReviewResultDispatcher::new(
                results.clone(),
                dead_letters.clone(),
                retry,
                Arc::new(NoOpMetricsPublisher),
            ),
            metrics: Arc::new(NoOpMetricsPublisher),
        };
        Harness {
            stream,
            results,
            dead_letters,
            deps,
        }
    }

    fn spam_snapshot() -> (SnapshotPublisher, SnapshotReader) {
        let spam = rule(
            1,
            0,
            Condition::field("content", Operator::Contains, json!("spam")).into(),
        );
        let (snapshot, _) = RuleSnapshot::build(1, 1, vec![spam], 8);
        snapshot_channel(snapshot)
    }

    fn worker_config(max_attempts: u32) -> ReviewWorkerConfig {
        let mut config = ReviewWorkerConfig::new("worker-a");
        config.max_attempts = max_attempts;
        config.backoff.initial_delay = Duration::from_millis(1);
        config.backoff.max_delay = Duration::from_millis(5);
        config
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("Failed to reach expected state in time");
    }

    #[tokio::test]
    async fn test_dispatches_matches_and_acks() {
        let h = harness();
        let (_publisher, reader) = spam_snapshot();
        h.stream
            .append_event(1, &thread_event(1, "buy spam now"))
            .expect("Failed to append");
        h.stream
            .append_event(1, &thread_event(1, "hello"))
            .expect("Failed to append");

        let worker = ReviewWorker::new(1, worker_config(3), h.deps.clone(), reader);
        let mut state = worker.state();
        let drain = CancellationToken::new();
        let task = tokio::spawn(worker.run(drain.clone()));

        eventually(|| h.results.len() == 1 && h.stream.pending_count(1) == 0).await;
        state
            .wait_for(|s| *s == WorkerState::Steady)
            .await
            .expect("Failed to observe state");

        drain.cancel();
        task.await
            .expect("Failed to join worker")
            .expect("Failed to run worker");
        assert_eq!(*state.borrow(), WorkerState::Stopped);

        let payload = &h.results.items()[0];
        assert_eq!(payload.rule_id, 1);
        assert_eq!(payload.entry_id, "1-0");
        assert!(h.dead_letters.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_entry_is_dead_lettered_and_acked() {
        let h = harness();
        let (_publisher, reader) = spam_snapshot();
        h.stream.append(1, Some("{not json".to_string()));
        h.stream.append(1, None);

        let drain = CancellationToken::new();
        let task = tokio::spawn(
            ReviewWorker::new(1, worker_config(3), h.deps.clone(), reader).run(drain.clone()),
        );

        eventually(|| h.dead_letters.len() == 2 && h.stream.pending_count(1) == 0).await;
        drain.cancel();
        task.await
            .expect("Failed to join worker")
            .expect("Failed to run worker");

        let records = h.dead_letters.items();
        assert!(records.iter().all(|r| r.attempts == 0));
        assert_eq!(records[0].raw.as_deref(), Some("{not json"));
        assert_eq!(records[1].raw, None);
        assert!(h.results.is_empty());
    }

    #[tokio::test]
    async fn test_failed_dispatch_is_retried_then_dead_lettered_once() {
        let h = harness();
        let (_publisher, reader) = spam_snapshot();
        h.results
            .fail_always(TransportError::transient("XADD", "connection reset"));
        let entry_id = h
            .stream
            .append_event(1, &thread_event(1, "spam"))
            .expect("Failed to append");

        let drain = CancellationToken::new();
        let task = tokio::spawn(
            ReviewWorker::new(1, worker_config(3), h.deps.clone(), reader).run(drain.clone()),
        );

        eventually(|| h.dead_letters.len() == 1 && h.stream.pending_count(1) == 0).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        drain.cancel();
        task.await
            .expect("Failed to join worker")
            .expect("Failed to run worker");

        let records = h.dead_letters.items();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entry_id, entry_id);
        assert_eq!(records[0].attempts, 3);
        assert_eq!(h.stream.delivery_count(1, &entry_id), None);
    }

    #[tokio::test]
    async fn test_fatal_output_error_fails_worker_and_keeps_entry_pending() {
        let h = harness();
        let (_publisher, reader) = spam_snapshot();
        h.results
            .fail_always(TransportError::fatal("XADD", "WRONGTYPE"));
        h.stream
            .append_event(1, &thread_event(1, "spam"))
            .expect("Failed to append");

        let worker = ReviewWorker::new(1, worker_config(3), h.deps.clone(), reader);
        let state = worker.state();
        let result = worker.run(CancellationToken::new()).await;

        assert!(matches!(
            result,
            Err(WorkerError::TransportFatal { partition: 1, .. })
        ));
        assert_eq!(*state.borrow(), WorkerState::Failed);
        assert_eq!(h.stream.pending_for(1, "worker-a"), vec!["1-0".to_string()]);
    }

    fn slow_backoff_config() -> ReviewWorkerConfig {
        let mut config = worker_config(3);
        config.backoff.initial_delay = Duration::from_secs(60);
        config.backoff.max_delay = Duration::from_secs(60);
        config
    }

    #[tokio::test]
    async fn test_drain_interrupts_recovery_backoff() {
        let h = harness();
        let (_publisher, reader) = spam_snapshot();
        h.stream
            .fail_reads(None, TransportError::transient("XREADGROUP", "connection reset"));

        let worker = ReviewWorker::new(1, slow_backoff_config(), h.deps.clone(), reader);
        let mut state = worker.state();
        let drain = CancellationToken::new();
        let task = tokio::spawn(worker.run(drain.clone()));

        state
            .wait_for(|s| *s == WorkerState::Recovering)
            .await
            .expect("Failed to observe state");
        tokio::time::sleep(Duration::from_millis(20)).await;
        drain.cancel();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("Worker should stop without waiting out its backoff")
            .expect("Failed to join worker")
            .expect("Failed to run worker");
        assert_eq!(*state.borrow(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_drain_interrupts_read_backoff() {
        let h = harness();
        let (_publisher, reader) = spam_snapshot();

        let worker = ReviewWorker::new(1, slow_backoff_config(), h.deps.clone(), reader);
        let mut state = worker.state();
        let drain = CancellationToken::new();
        let task = tokio::spawn(worker.run(drain.clone()));

        state
            .wait_for(|s| *s == WorkerState::Steady)
            .await
            .expect("Failed to observe state");
        h.stream
            .fail_reads(None, TransportError::transient("XREADGROUP", "connection reset"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        drain.cancel();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("Worker should stop without waiting out its backoff")
            .expect("Failed to join worker")
            .expect("Failed to run worker");
        assert_eq!(*state.borrow(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_drain_before_join_stops_cleanly() {
        let h = harness();
        let (_publisher, reader) = spam_snapshot();
        let drain = CancellationToken::new();
        drain.cancel();

        let worker = ReviewWorker::new(1, worker_config(3), h.deps.clone(), reader);
        let state = worker.state();
        worker.run(drain).await.expect("Failed to run worker");
        assert_eq!(*state.borrow(), WorkerState::Stopped);
        assert!(!h.stream.is_joined(1));
    }
}
