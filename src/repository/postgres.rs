use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{Instrument, error, warn};

use super::{RuleRepository, RulesetStamp};
use crate::content::PartitionKey;
use crate::errors::{RepositoryError, RuleError};
use crate::rules::{ReviewRule, TargetType, decode_actions, decode_trigger};

/// PostgreSQL implementation of [`RuleRepository`] over `review_rules`.
pub struct PostgresRuleRepository {
    pool: PgPool,
}

impl PostgresRuleRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn query_failed(operation: &str) -> impl FnOnce(sqlx::Error) -> RepositoryError + '_ {
    move |e| {
        error!(error = ?e, operation, "Rule query failed");
        RepositoryError::QueryFailed {
            operation: operation.to_string(),
            source: e,
        }
    }
}

fn decode_row(row: &PgRow) -> Result<ReviewRule, RuleError> {
    let id: i64 = row.try_get("id").map_err(|e| RuleError::DecodeFailed {
        rule_id: 0,
        details: e.to_string(),
    })?;
    let column = |e: sqlx::Error| RuleError::DecodeFailed {
        rule_id: id,
        details: e.to_string(),
    };

    let target_type: String = row.try_get("target_type").map_err(column)?;
    let target_type = TargetType::parse(&target_type).ok_or_else(|| RuleError::DecodeFailed {
        rule_id: id,
        details: format!("unknown target_type {target_type}"),
    })?;

    Ok(ReviewRule {
        id,
        name: row.try_get("name").map_err(column)?,
        enabled: row.try_get("enabled").map_err(column)?,
        priority: row.try_get("priority").map_err(column)?,
        partition_key: row.try_get("fid").map_err(column)?,
        target_type,
        trigger: decode_trigger(id, row.try_get::<Value, _>("trigger").map_err(column)?)?,
        actions: decode_actions(
            id,
            row.try_get::<Option<Value>, _>("actions")
                .map_err(column)?
                .unwrap_or(Value::Null),
        )?,
    })
}

#[async_trait]
impl RuleRepository for PostgresRuleRepository {
    async fn get_active_rules(
        &self,
        partition: PartitionKey,
    ) -> Result<Vec<ReviewRule>, RepositoryError> {
        let span = tracing::debug_span!("database_query", query = "SELECT review_rules", partition);

        let rows = sqlx::query(
            r#"
            SELECT id, fid, target_type, name, enabled, priority, trigger, actions
            FROM review_rules
            WHERE fid = $1 AND enabled = TRUE
            ORDER BY priority DESC, id ASC
            "#,
        )
        .bind(partition)
        .fetch_all(&self.pool)
        .instrument(span)
        .await
        .map_err(query_failed("get_active_rules"))?;

        Ok(rows
            .iter()
            .filter_map(|row| match decode_row(row) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    warn!(partition, error = %e, "Skipping malformed rule");
                    None
                }
            })
            .collect())
    }

    async fn active_partitions(&self) -> Result<Vec<PartitionKey>, RepositoryError> {
        let span = tracing::debug_span!("database_query", query = "SELECT DISTINCT fid");

        let rows = sqlx::query(
            r#"
            SELECT DISTINCT fid
            FROM review_rules
            WHERE enabled = TRUE
            ORDER BY fid
            "#,
        )
        .fetch_all(&self.pool)
        .instrument(span)
        .await
        .map_err(query_failed("active_partitions"))?;

        rows.iter()
            .map(|row| row.try_get::<i64, _>("fid"))
            .collect::<Result<Vec<_>, _>>()
            .map_err(query_failed("active_partitions"))
    }

    async fn last_modified(&self) -> Result<RulesetStamp, RepositoryError> {
        let span = tracing::debug_span!("database_query", query = "SELECT MAX(updated_at)");

        let row = sqlx::query(
            r#"
            SELECT MAX(updated_at) AS last_modified, COUNT(*) AS rule_count
            FROM review_rules
            "#,
        )
        .fetch_one(&self.pool)
        .instrument(span)
        .await
        .map_err(query_failed("last_modified"))?;

        Ok(RulesetStamp {
            last_modified: row
                .try_get::<Option<DateTime<Utc>>, _>("last_modified")
                .map_err(query_failed("last_modified"))?,
            rule_count: row
                .try_get::<i64, _>("rule_count")
                .map_err(query_failed("last_modified"))?,
        })
    }
}
