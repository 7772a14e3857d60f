//! Result dispatch.
//!
//! One [`ReviewResultPayload`] is published per rule match, in match order.
//! Publication is at-least-once: a transient failure is retried with capped
//! exponential backoff, and a retry resumes at the payload that failed rather
//! than re-publishing the ones the transport already accepted. A dispatch is
//! committed only when every payload has been accepted.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::content::{ContentEvent, ContentKind, ContentRef, PartitionKey};
use crate::engine::MatchOutcome;
use crate::errors::{DispatchError, TransportError};
use crate::metrics::SharedMetricsPublisher;
use crate::rules::Action;
use crate::transport::OutputSink;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewResultPayload {
    pub fid: PartitionKey,
    pub rule_id: i64,
    pub rule_name: String,
    pub priority: i32,
    pub object_type: ContentKind,
    pub content: ContentRef,
    pub actions: Vec<Action>,
    pub object_data: Value,
    #[serde(default)]
    pub function_call_results: BTreeMap<String, Value>,
    pub entry_id: String,
    pub timestamp: DateTime<Utc>,
}

/// An input entry that will not be processed again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub partition: PartitionKey,
    pub entry_id: String,
    /// Processing attempts made; zero for entries that never decoded.
    pub attempts: u32,
    pub reason: String,
    pub raw: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        partition: PartitionKey,
        entry_id: impl Into<String>,
        attempts: u32,
        reason: impl Into<String>,
        raw: Option<String>,
    ) -> Self {
        Self {
            partition,
            entry_id: entry_id.into(),
            attempts,
            reason: reason.into(),
            raw,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Publish attempts per payload, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Build one payload per match, preserving match order.
pub fn build_payloads(
    entry_id: &str,
    content: &ContentEvent,
    outcome: &MatchOutcome,
) -> Vec<ReviewResultPayload> {
    let timestamp = Utc::now();
    outcome
        .matches
        .iter()
        .map(|matched| ReviewResultPayload {
            fid: content.fid(),
            rule_id: matched.rule_id,
            rule_name: matched.rule_name.clone(),
            priority: matched.priority,
            object_type: content.kind(),
            content: matched.content,
            actions: matched.actions.clone(),
            object_data: content.view().clone(),
            function_call_results: outcome.function_results.clone(),
            entry_id: entry_id.to_string(),
            timestamp,
        })
        .collect()
}

#[derive(Clone)]
pub struct ReviewResultDispatcher {
    results: Arc<dyn OutputSink<ReviewResultPayload>>,
    dead_letters: Arc<dyn OutputSink<DeadLetter>>,
    retry: RetryPolicy,
    metrics: SharedMetricsPublisher,
}

impl ReviewResultDispatcher {
    pub fn new(
        results: Arc<dyn OutputSink<ReviewResultPayload>>,
        dead_letters: Arc<dyn OutputSink<DeadLetter>>,
        retry: RetryPolicy,
        metrics: SharedMetricsPublisher,
    ) -> Self {
        Self {
            results,
            dead_letters,
            retry,
            metrics,
        }
    }

    /// Publish `payloads` in order. Returns the number published, which is
    /// always `payloads.len()` on success.
    pub async fn dispatch(&self, payloads: &[ReviewResultPayload]) -> Result<usize, DispatchError> {
        for (published, payload) in payloads.iter().enumerate() {
            match self
                .publish_with_retry(self.results.as_ref(), payload, "result")
                .await
            {
                Ok(stream_id) => {
                    debug!(
                        entry_id = %payload.entry_id,
                        rule_id = payload.rule_id,
                        stream_id = %stream_id,
                        "Published review result"
                    );
                }
                Err((_, e)) if !e.is_transient() => {
                    return Err(DispatchError::Fatal(e));
                }
                Err((attempts, e)) => {
                    if published > 0 {
                        self.metrics
                            .count("reviewer.dispatch.published", published as u64)
                            .await;
                    }
                    return Err(DispatchError::RetriesExhausted {
                        attempts,
                        published,
                        total: payloads.len(),
                        last_error: e,
                    });
                }
            }
        }

        if !payloads.is_empty() {
            self.metrics
                .count("reviewer.dispatch.published", payloads.len() as u64)
                .await;
        }
        Ok(payloads.len())
    }

    /// Publish a dead-letter record with the same retry policy as results.
    pub async fn dead_letter(&self, record: &DeadLetter) -> Result<String, DispatchError> {
        match self
            .publish_with_retry(self.dead_letters.as_ref(), record, "dead_letter")
            .await
        {
            Ok(stream_id) => {
                error!(
                    partition = record.partition,
                    entry_id = %record.entry_id,
                    attempts = record.attempts,
                    reason = %record.reason,
                    "Entry dead-lettered"
                );
                self.metrics.incr("reviewer.entries.dead_lettered").await;
                Ok(stream_id)
            }
            Err((_, e)) if !e.is_transient() => Err(DispatchError::Fatal(e)),
            Err((attempts, e)) => Err(DispatchError::RetriesExhausted {
                attempts,
                published: 0,
                total: 1,
                last_error: e,
            }),
        }
    }

    async fn publish_with_retry<T: Send + Sync>(
        &self,
        sink: &dyn OutputSink<T>,
        item: &T,
        sink_name: &str,
    ) -> Result<String, (u32, TransportError)> {
        let mut attempt = 1;
        loop {
            match sink.publish(item).await {
                Ok(stream_id) => return Ok(stream_id),
                Err(e) if !e.is_transient() || attempt >= self.retry.max_attempts => {
                    return Err((attempt, e));
                }
                Err(e) => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        sink = sink_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = ?e,
                        "Publish failed, retrying"
                    );
                    self.metrics
                        .incr_with_tags("reviewer.dispatch.retry", &[("sink", sink_name)])
                        .await;
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ReviewMatch;
    use crate::metrics::NoOpMetricsPublisher;
    use crate::rules::ActionKind;
    use crate::test_helpers::thread_event;
    use crate::transport::MemoryOutputSink;
    use serde_json::json;

    fn outcome(rule_ids: &[i64], content: &ContentEvent) -> MatchOutcome {
        MatchOutcome {
            matches: rule_ids
                .iter()
                .map(|id| ReviewMatch {
                    rule_id: *id,
                    rule_name: format!("rule-{id}"),
                    priority: 0,
                    content: content.content_ref(),
                    actions: vec![Action::new(ActionKind::Delete)],
                })
                .collect(),
            function_results: BTreeMap::from([("has_url()".to_string(), json!(true))]),
            function_errors: Vec::new(),
        }
    }

    struct Fixture {
        results: Arc<MemoryOutputSink<ReviewResultPayload>>,
        dead_letters: Arc<MemoryOutputSink<DeadLetter>>,
        dispatcher: ReviewResultDispatcher,
    }

    fn fixture() -> Fixture {
        let results = MemoryOutputSink::new();
        let dead_letters = MemoryOutputSink::new();
        let dispatcher = ReviewResultDispatcher::new(
            results.clone(),
            dead_letters.clone(),
            RetryPolicy::default(),
            Arc::new(NoOpMetricsPublisher::new()),
        );
        Fixture {
            results,
            dead_letters,
            dispatcher,
        }
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_build_payloads_preserves_match_order() {
        let event = thread_event(7, "buy spam now");
        let payloads = build_payloads("3-0", &event, &outcome(&[5, 2, 9], &event));

        let ids: Vec<i64> = payloads.iter().map(|p| p.rule_id).collect();
        assert_eq!(ids, vec![5, 2, 9]);
        assert!(payloads.iter().all(|p| p.fid == 7 && p.entry_id == "3-0"));
        assert_eq!(payloads[0].object_data["text"], json!("buy spam now"));
        assert_eq!(payloads[0].function_call_results["has_url()"], json!(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_resumes_at_failed_payload() {
        let fixture = fixture();
        let event = thread_event(1, "x");
        let payloads = build_payloads("1-0", &event, &outcome(&[1, 2, 3], &event));

        fixture
            .results
            .fail_next(2, TransportError::transient("XADD", "busy"));
        let published = fixture
            .dispatcher
            .dispatch(&payloads)
            .await
            .expect("Dispatch should commit after retries");

        assert_eq!(published, 3);
        let ids: Vec<i64> = fixture.results.items().iter().map(|p| p.rule_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let fixture = fixture();
        let event = thread_event(1, "x");
        let payloads = build_payloads("1-0", &event, &outcome(&[1, 2], &event));

        fixture
            .results
            .fail_always(TransportError::transient("XADD", "connection reset"));
        let result = fixture.dispatcher.dispatch(&payloads).await;

        assert!(matches!(
            result,
            Err(DispatchError::RetriesExhausted {
                attempts: 3,
                published: 0,
                total: 2,
                ..
            })
        ));
        assert!(fixture.results.is_empty());
    }

    #[tokio::test]
    async fn test_fatal_failure_is_not_retried() {
        let fixture = fixture();
        let event = thread_event(1, "x");
        let payloads = build_payloads("1-0", &event, &outcome(&[1], &event));

        fixture
            .results
            .fail_next(1, TransportError::fatal("XADD", "WRONGTYPE"));
        let result = fixture.dispatcher.dispatch(&payloads).await;
        assert!(matches!(result, Err(DispatchError::Fatal(_))));

        fixture
            .dispatcher
            .dispatch(&payloads)
            .await
            .expect("Next dispatch should succeed");
        assert_eq!(fixture.results.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_dispatch_commits() {
        let fixture = fixture();
        assert_eq!(fixture.dispatcher.dispatch(&[]).await.ok(), Some(0));
    }

    #[tokio::test]
    async fn test_dead_letter_is_published() {
        let fixture = fixture();
        let record = DeadLetter::new(4, "9-0", 5, "retries exhausted", Some("{}".to_string()));
        fixture
            .dispatcher
            .dead_letter(&record)
            .await
            .expect("Failed to dead-letter");

        let records = fixture.dead_letters.items();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entry_id, "9-0");
        assert_eq!(records[0].attempts, 5);
    }
}
