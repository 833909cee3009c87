//! `SQLite`-backed [`MessageStore`]: ingest-side dedup and delivery-side state transitions.

use async_trait::async_trait;
use sqlx::Row;
use std::str::FromStr;

use crate::database::DatabaseConnection;
use crate::domain_types::{ChatName, DeliveryStatus, InstanceId, MessageId, MessageType};
use crate::storage::{IngestOutcome, MessageRow, MessageStore, RawMessage, StoreError, StoreResult};
use crate::util::{content_hash, dedup_bucket};

const DEDUP_BUCKET_SECS: i64 = 60;

/// `SQLite` implementation of [`MessageStore`].
pub struct SqliteMessageStore {
    connection: DatabaseConnection,
}

impl SqliteMessageStore {
    /// Builds a store over the given connection.
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }

    fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> StoreResult<MessageRow> {
        let message_id_raw: String = row.try_get("message_id")?;
        let message_id = uuid::Uuid::parse_str(&message_id_raw)
            .map(MessageId::from)
            .map_err(|e| StoreError::CorruptRow(format!("message_id: {e}")))?;
        let instance_id_raw: String = row.try_get("instance_id")?;
        let chat_name_raw: String = row.try_get("chat_name")?;
        let mtype_raw: String = row.try_get("mtype")?;
        let status_raw: String = row.try_get("delivery_status")?;

        Ok(MessageRow {
            message_id,
            instance_id: InstanceId::try_from(instance_id_raw.clone())
                .map_err(|_| StoreError::CorruptRow(format!("invalid instance_id {instance_id_raw}")))?,
            chat_name: ChatName::try_from(chat_name_raw.clone())
                .map_err(|_| StoreError::CorruptRow(format!("invalid chat_name {chat_name_raw}")))?,
            sender: row.try_get("sender")?,
            sender_remark: row.try_get("sender_remark")?,
            content: row.try_get("content")?,
            mtype: MessageType::from_str(&mtype_raw)
                .map_err(|e| StoreError::CorruptRow(format!("mtype: {e}")))?,
            local_file_path: row.try_get("local_file_path")?,
            received_ts: row.try_get("received_ts")?,
            delivery_status: DeliveryStatus::from_str(&status_raw)
                .map_err(|e| StoreError::CorruptRow(format!("delivery_status: {e}")))?,
            delivery_attempts: u32::try_from(row.try_get::<i64, _>("delivery_attempts")?)
                .unwrap_or(0),
            reply_content: row.try_get("reply_content")?,
            reply_status: row.try_get("reply_status")?,
        })
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn ingest(&self, msg: &RawMessage) -> StoreResult<IngestOutcome> {
        let hash = content_hash(&msg.sender, &msg.content);
        let bucket = dedup_bucket(msg.received_ts, DEDUP_BUCKET_SECS);
        let message_id = MessageId::generate();
        let status = if msg.is_outbound || matches!(msg.mtype, MessageType::System) {
            DeliveryStatus::Skipped
        } else {
            DeliveryStatus::Pending
        };

        let mut tx = self.connection.pool().begin().await?;

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM messages WHERE instance_id = ?1 AND chat_name = ?2 AND sender = ?3 \
             AND content_hash = ?4 AND received_ts_bucket = ?5",
        )
        .bind(msg.instance_id.as_ref())
        .bind(msg.chat_name.as_ref())
        .bind(&msg.sender)
        .bind(&hash)
        .bind(bucket)
        .fetch_optional(&mut *tx)
        .await?;

        if existing.is_some() {
            tx.commit().await?;
            return Ok(IngestOutcome::Duplicate);
        }

        sqlx::query(
            r"
            INSERT INTO messages (
                message_id, instance_id, chat_name, sender, sender_remark, content, mtype,
                content_hash, received_ts_bucket, local_file_path, received_ts,
                delivery_status, delivery_attempts
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0)
            ",
        )
        .bind(message_id.to_string())
        .bind(msg.instance_id.as_ref())
        .bind(msg.chat_name.as_ref())
        .bind(&msg.sender)
        .bind(&msg.sender_remark)
        .bind(&msg.content)
        .bind(msg.mtype.to_string())
        .bind(&hash)
        .bind(bucket)
        .bind(&msg.local_file_path)
        .bind(msg.received_ts)
        .bind(status.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(IngestOutcome::Inserted(message_id))
    }

    async fn list_pending(
        &self,
        limit: u32,
        now: i64,
        lease_secs: i64,
    ) -> StoreResult<Vec<MessageRow>> {
        let reclaim_before = now - lease_secs;
        sqlx::query(
            "UPDATE messages SET delivery_status = 'PENDING', delivering_since_ts = NULL \
             WHERE delivery_status = 'DELIVERING' AND delivering_since_ts < ?1",
        )
        .bind(reclaim_before)
        .execute(self.connection.pool())
        .await?;

        let rows = sqlx::query(
            "SELECT * FROM messages WHERE delivery_status = 'PENDING' \
             ORDER BY received_ts ASC LIMIT ?1",
        )
        .bind(i64::from(limit))
        .fetch_all(self.connection.pool())
        .await?;
        rows.iter().map(Self::row_to_message).collect()
    }

    async fn count_pending(&self) -> StoreResult<u32> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE delivery_status = 'PENDING'")
                .fetch_one(self.connection.pool())
                .await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn mark_delivering(&self, id: MessageId, now: i64) -> StoreResult<()> {
        sqlx::query(
            "UPDATE messages SET delivery_status = 'DELIVERING', delivering_since_ts = ?1, \
             delivery_attempts = delivery_attempts + 1 WHERE message_id = ?2",
        )
        .bind(now)
        .bind(id.to_string())
        .execute(self.connection.pool())
        .await?;
        Ok(())
    }

    async fn mark_delivered(&self, id: MessageId, reply: Option<&str>) -> StoreResult<()> {
        sqlx::query(
            "UPDATE messages SET delivery_status = 'DELIVERED', reply_content = ?1, \
             reply_status = 'ok', delivering_since_ts = NULL WHERE message_id = ?2",
        )
        .bind(reply)
        .bind(id.to_string())
        .execute(self.connection.pool())
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: MessageId, retryable: bool) -> StoreResult<()> {
        let status = if retryable {
            DeliveryStatus::Pending
        } else {
            DeliveryStatus::Failed
        };
        sqlx::query(
            "UPDATE messages SET delivery_status = ?1, reply_status = 'error', \
             delivering_since_ts = NULL WHERE message_id = ?2",
        )
        .bind(status.to_string())
        .bind(id.to_string())
        .execute(self.connection.pool())
        .await?;
        Ok(())
    }

    async fn skip(&self, id: MessageId, reason: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE messages SET delivery_status = 'SKIPPED', reply_status = ?1, \
             delivering_since_ts = NULL WHERE message_id = ?2",
        )
        .bind(reason)
        .bind(id.to_string())
        .execute(self.connection.pool())
        .await?;
        Ok(())
    }

    async fn get(&self, id: MessageId) -> StoreResult<Option<MessageRow>> {
        let row = sqlx::query("SELECT * FROM messages WHERE message_id = ?1")
            .bind(id.to_string())
            .fetch_optional(self.connection.pool())
            .await?;
        row.as_ref().map(Self::row_to_message).transpose()
    }

    async fn query(
        &self,
        instance_id: Option<&InstanceId>,
        chat_name: Option<&ChatName>,
        since_ts: Option<i64>,
        limit: u32,
    ) -> StoreResult<Vec<MessageRow>> {
        let rows = sqlx::query(
            "SELECT * FROM messages \
             WHERE (?1 IS NULL OR instance_id = ?1) \
               AND (?2 IS NULL OR chat_name = ?2) \
               AND (?3 IS NULL OR received_ts >= ?3) \
             ORDER BY received_ts DESC LIMIT ?4",
        )
        .bind(instance_id.map(|id| id.as_ref().to_string()))
        .bind(chat_name.map(|c| c.as_ref().to_string()))
        .bind(since_ts)
        .bind(i64::from(limit))
        .fetch_all(self.connection.pool())
        .await?;
        rows.iter().map(Self::row_to_message).collect()
    }
}
