//! Versioned, read-only rule sets per partition.
//!
//! The worker manager is the only writer: it builds a fresh [`RuleSnapshot`]
//! and installs it through a [`SnapshotPublisher`]. Workers hold a
//! [`SnapshotReader`] and pick up the newest snapshot between batches. A batch
//! keeps the `Arc` it started with, so an install never changes the rules a
//! running batch sees.

use std::sync::Arc;

use tokio::sync::watch;

use super::ReviewRule;
use crate::content::PartitionKey;
use crate::errors::RuleError;

#[derive(Debug, Clone)]
pub struct RuleSnapshot {
    partition: PartitionKey,
    version: u64,
    rules: Vec<Arc<ReviewRule>>,
}

impl RuleSnapshot {
    pub fn empty(partition: PartitionKey) -> Self {
        Self {
            partition,
            version: 0,
            rules: vec![],
        }
    }

    /// Validate and order rules for a partition.
    ///
    /// Disabled rules are dropped. Rules that fail validation or belong to
    /// another partition are dropped and returned alongside the snapshot.
    /// The remaining rules are ordered by descending priority, then id.
    pub fn build(
        partition: PartitionKey,
        version: u64,
        rules: Vec<ReviewRule>,
        max_depth: usize,
    ) -> (Self, Vec<RuleError>) {
        let mut rejected = Vec::new();
        let mut accepted: Vec<Arc<ReviewRule>> = Vec::with_capacity(rules.len());

        for rule in rules {
            if !rule.enabled {
                continue;
            }
            if rule.partition_key != partition {
                rejected.push(RuleError::PartitionMismatch {
                    rule_id: rule.id,
                    expected: partition,
                    actual: rule.partition_key,
                });
                continue;
            }
            match rule.validate(max_depth) {
                Ok(()) => accepted.push(Arc::new(rule)),
                Err(e) => rejected.push(e),
            }
        }

        accepted.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

        (
            Self {
                partition,
                version,
                rules: accepted,
            },
            rejected,
        )
    }

    pub fn partition(&self) -> PartitionKey {
        self.partition
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn rules(&self) -> &[Arc<ReviewRule>] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Create the writer and first reader for a partition's snapshots.
pub fn snapshot_channel(initial: RuleSnapshot) -> (SnapshotPublisher, SnapshotReader) {
    let (tx, rx) = watch::channel(Arc::new(initial));
    (SnapshotPublisher { tx }, SnapshotReader { rx })
}

/// Single writer for a partition's snapshots. Not `Clone`.
#[derive(Debug)]
pub struct SnapshotPublisher {
    tx: watch::Sender<Arc<RuleSnapshot>>,
}

impl SnapshotPublisher {
    /// Version the next installed snapshot should carry.
    pub fn next_version(&self) -> u64 {
        self.tx.borrow().version() + 1
    }

    /// Install a snapshot. Readers observe either the previous one or this
    /// one, never a mix.
    pub fn publish(&self, snapshot: RuleSnapshot) {
        self.tx.send_replace(Arc::new(snapshot));
    }

    pub fn current(&self) -> Arc<RuleSnapshot> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> SnapshotReader {
        SnapshotReader {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotReader {
    rx: watch::Receiver<Arc<RuleSnapshot>>,
}

impl SnapshotReader {
    /// Newest installed snapshot, marking it as seen.
    pub fn latest(&mut self) -> Arc<RuleSnapshot> {
        self.rx.borrow_and_update().clone()
    }

    /// Whether a snapshot was installed since the last call to [`latest`].
    ///
    /// [`latest`]: SnapshotReader::latest
    pub fn has_changed(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }
}
