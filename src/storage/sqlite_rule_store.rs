//! `SQLite`-backed [`RuleStore`].

use async_trait::async_trait;
use sqlx::Row;

use crate::database::DatabaseConnection;
use crate::domain_types::{PlatformId, Priority, RuleId};
use crate::storage::{RuleRow, RuleStore, StoreError, StoreResult};

/// `SQLite` implementation of [`RuleStore`].
pub struct SqliteRuleStore {
    connection: DatabaseConnection,
}

impl SqliteRuleStore {
    /// Builds a store over the given connection.
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }

    fn row_to_rule(row: &sqlx::sqlite::SqliteRow) -> StoreResult<RuleRow> {
        let rule_id_raw: String = row.try_get("rule_id")?;
        let rule_id = uuid::Uuid::parse_str(&rule_id_raw)
            .map(RuleId::from)
            .map_err(|e| StoreError::CorruptRow(format!("rule_id: {e}")))?;
        let platform_id_raw: String = row.try_get("platform_id")?;
        let platform_id = uuid::Uuid::parse_str(&platform_id_raw)
            .map(PlatformId::from)
            .map_err(|e| StoreError::CorruptRow(format!("platform_id: {e}")))?;

        Ok(RuleRow {
            rule_id,
            name: row.try_get("name")?,
            instance_scope: row.try_get("instance_id")?,
            chat_pattern: row.try_get("chat_pattern")?,
            platform_id,
            priority: Priority::new(i32::try_from(row.try_get::<i64, _>("priority")?).unwrap_or(0)),
            enabled: row.try_get::<i64, _>("enabled")? != 0,
            only_at_messages: row.try_get::<i64, _>("only_at_messages")? != 0,
        })
    }
}

#[async_trait]
impl RuleStore for SqliteRuleStore {
    async fn upsert(&self, rule: &RuleRow) -> StoreResult<()> {
        let now = crate::util::unix_now();
        sqlx::query(
            r"
            INSERT INTO rules (
                rule_id, name, instance_id, chat_pattern, platform_id, priority, enabled,
                only_at_messages, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            ON CONFLICT(rule_id) DO UPDATE SET
                name = excluded.name,
                instance_id = excluded.instance_id,
                chat_pattern = excluded.chat_pattern,
                platform_id = excluded.platform_id,
                priority = excluded.priority,
                enabled = excluded.enabled,
                only_at_messages = excluded.only_at_messages,
                updated_at = excluded.updated_at
            ",
        )
        .bind(rule.rule_id.to_string())
        .bind(&rule.name)
        .bind(&rule.instance_scope)
        .bind(&rule.chat_pattern)
        .bind(rule.platform_id.to_string())
        .bind(i64::from(rule.priority.into_inner()))
        .bind(rule.enabled)
        .bind(rule.only_at_messages)
        .bind(now)
        .execute(self.connection.pool())
        .await?;
        Ok(())
    }

    async fn get(&self, id: &RuleId) -> StoreResult<Option<RuleRow>> {
        let row = sqlx::query("SELECT * FROM rules WHERE rule_id = ?1")
            .bind(id.to_string())
            .fetch_optional(self.connection.pool())
            .await?;
        row.as_ref().map(Self::row_to_rule).transpose()
    }

    async fn list_enabled(&self) -> StoreResult<Vec<RuleRow>> {
        let rows = sqlx::query("SELECT * FROM rules WHERE enabled = 1")
            .fetch_all(self.connection.pool())
            .await?;
        rows.iter().map(Self::row_to_rule).collect()
    }

    async fn list_all(&self) -> StoreResult<Vec<RuleRow>> {
        let rows = sqlx::query("SELECT * FROM rules ORDER BY priority DESC")
            .fetch_all(self.connection.pool())
            .await?;
        rows.iter().map(Self::row_to_rule).collect()
    }

    async fn delete(&self, id: &RuleId) -> StoreResult<()> {
        sqlx::query("DELETE FROM rules WHERE rule_id = ?1")
            .bind(id.to_string())
            .execute(self.connection.pool())
            .await?;
        Ok(())
    }
}
