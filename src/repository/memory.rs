use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{ReloadEvent, RuleRepository, RulesetStamp};
use crate::content::PartitionKey;
use crate::errors::RepositoryError;
use crate::rules::ReviewRule;

#[derive(Default)]
struct State {
    rules: BTreeMap<i64, ReviewRule>,
    stamp: RulesetStamp,
    subscribers: Vec<mpsc::Sender<ReloadEvent>>,
}

impl State {
    fn touch(&mut self) {
        self.stamp = RulesetStamp {
            last_modified: Some(Utc::now()),
            rule_count: self.rules.len() as i64,
        };
    }

    fn notify(&mut self, event: ReloadEvent) {
        self.subscribers.retain(|subscriber| match subscriber.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(?event, "Reload subscriber is full, dropping notification");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

/// Rule repository held in memory, with change notifications.
#[derive(Default)]
pub struct MemoryRuleRepository {
    state: Mutex<State>,
    failures: AtomicUsize,
}

impl MemoryRuleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: impl IntoIterator<Item = ReviewRule>) -> Self {
        let repository = Self::new();
        {
            let mut state = repository.state.lock();
            for rule in rules {
                state.rules.insert(rule.id, rule);
            }
            state.touch();
        }
        repository
    }

    /// Receive a [`ReloadEvent::Partition`] for every change. Delivery is
    /// best-effort: events are dropped while the receiver is full.
    pub fn subscribe_reload(&self, capacity: usize) -> mpsc::Receiver<ReloadEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.state.lock().subscribers.push(tx);
        rx
    }

    /// Insert or replace a rule, notifying every partition it touched.
    pub fn upsert(&self, rule: ReviewRule) {
        let mut state = self.state.lock();
        let partition = rule.partition_key;
        let previous = state.rules.insert(rule.id, rule);
        state.touch();

        if let Some(previous) = previous
            && previous.partition_key != partition
        {
            state.notify(ReloadEvent::Partition(previous.partition_key));
        }
        state.notify(ReloadEvent::Partition(partition));
    }

    pub fn remove(&self, rule_id: i64) -> Option<ReviewRule> {
        let mut state = self.state.lock();
        let removed = state.rules.remove(&rule_id)?;
        state.touch();
        state.notify(ReloadEvent::Partition(removed.partition_key));
        Some(removed)
    }

    pub fn set_enabled(&self, rule_id: i64, enabled: bool) -> bool {
        let mut state = self.state.lock();
        let Some(rule) = state.rules.get_mut(&rule_id) else {
            return false;
        };
        rule.enabled = enabled;
        let partition = rule.partition_key;
        state.touch();
        state.notify(ReloadEvent::Partition(partition));
        true
    }

    /// Change a rule without notifying anyone, as an out-of-band edit would.
    pub fn upsert_silently(&self, rule: ReviewRule) {
        let mut state = self.state.lock();
        state.rules.insert(rule.id, rule);
        state.touch();
    }

    /// Make the next `count` queries fail with [`RepositoryError::Unavailable`].
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), RepositoryError> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();

        if injected {
            Err(RepositoryError::Unavailable {
                details: "injected failure".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RuleRepository for MemoryRuleRepository {
    async fn get_active_rules(
        &self,
        partition: PartitionKey,
    ) -> Result<Vec<ReviewRule>, RepositoryError> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .rules
            .values()
            .filter(|rule| rule.enabled && rule.partition_key == partition)
            .cloned()
            .collect())
    }

    async fn active_partitions(&self) -> Result<Vec<PartitionKey>, RepositoryError> {
        self.check_available()?;
        let partitions: BTreeSet<PartitionKey> = self
            .state
            .lock()
            .rules
            .values()
            .filter(|rule| rule.enabled)
            .map(|rule| rule.partition_key)
            .collect();
        Ok(partitions.into_iter().collect())
    }

    async fn last_modified(&self) -> Result<RulesetStamp, RepositoryError> {
        self.check_available()?;
        Ok(self.state.lock().stamp)
    }
}
