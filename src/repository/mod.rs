//! Rule storage and reload notifications.
//!
//! The repository is the source of truth for rules; the service only reads
//! it. Notifications are best-effort hints that tell the worker manager which
//! partition to reload. A missed notification is repaired by the next
//! periodic full reconciliation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::content::PartitionKey;
use crate::errors::RepositoryError;
use crate::rules::ReviewRule;

mod memory;
mod postgres;
pub mod reload;

pub use memory::MemoryRuleRepository;
pub use postgres::PostgresRuleRepository;
pub use reload::{RedisReloadListener, ReloadEvent, parse_reload_message};

/// Cheap fingerprint of the whole rule table.
///
/// Two equal stamps mean no rule was added, changed or removed in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RulesetStamp {
    pub last_modified: Option<DateTime<Utc>>,
    pub rule_count: i64,
}

#[async_trait]
pub trait RuleRepository: Send + Sync {
    /// Enabled rules of `partition`. Rows that cannot be decoded are skipped.
    async fn get_active_rules(
        &self,
        partition: PartitionKey,
    ) -> Result<Vec<ReviewRule>, RepositoryError>;

    /// Partitions with at least one enabled rule.
    async fn active_partitions(&self) -> Result<Vec<PartitionKey>, RepositoryError>;

    async fn last_modified(&self) -> Result<RulesetStamp, RepositoryError>;
}
