//! `SQLite`-backed [`DeliveryLedgerStore`]: append-only delivery attempt audit trail.

use async_trait::async_trait;

use crate::database::DatabaseConnection;
use crate::domain_types::{AttemptId, ErrorKind, MessageId};
use crate::storage::{AttemptOutcome, DeliveryLedgerStore, StoreResult};

/// `SQLite` implementation of [`DeliveryLedgerStore`].
pub struct SqliteDeliveryLedgerStore {
    connection: DatabaseConnection,
}

impl SqliteDeliveryLedgerStore {
    /// Builds a store over the given connection.
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }
}

fn error_kind_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Unavailable => "Unavailable",
        ErrorKind::AgentFailure => "AgentFailure",
        ErrorKind::InvalidRequest => "InvalidRequest",
        ErrorKind::NotInitialized => "NotInitialized",
        ErrorKind::PlatformError => "PlatformError",
        ErrorKind::StoreError => "StoreError",
        ErrorKind::ConfigError => "ConfigError",
        ErrorKind::Cancelled => "Cancelled",
    }
}

fn outcome_label(outcome: AttemptOutcome) -> &'static str {
    match outcome {
        AttemptOutcome::Success => "SUCCESS",
        AttemptOutcome::RetryableFailure => "RETRYABLE_FAILURE",
        AttemptOutcome::TerminalFailure => "TERMINAL_FAILURE",
    }
}

#[async_trait]
impl DeliveryLedgerStore for SqliteDeliveryLedgerStore {
    async fn record_start(
        &self,
        message_id: MessageId,
        attempt_no: u32,
        started_ts: i64,
    ) -> StoreResult<AttemptId> {
        let attempt_id = AttemptId::generate();
        sqlx::query(
            "INSERT INTO delivery_attempts (attempt_id, message_id, attempt_no, started_ts) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(attempt_id.to_string())
        .bind(message_id.to_string())
        .bind(i64::from(attempt_no))
        .bind(started_ts)
        .execute(self.connection.pool())
        .await?;
        Ok(attempt_id)
    }

    async fn record_outcome(
        &self,
        attempt_id: AttemptId,
        finished_ts: i64,
        outcome: AttemptOutcome,
        error_kind: Option<ErrorKind>,
        error_detail: Option<&str>,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE delivery_attempts SET finished_ts = ?1, outcome = ?2, error_kind = ?3, \
             error_detail = ?4 WHERE attempt_id = ?5",
        )
        .bind(finished_ts)
        .bind(outcome_label(outcome))
        .bind(error_kind.map(error_kind_label))
        .bind(error_detail)
        .bind(attempt_id.to_string())
        .execute(self.connection.pool())
        .await?;
        Ok(())
    }

    async fn attempt_count(&self, message_id: MessageId) -> StoreResult<u32> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM delivery_attempts WHERE message_id = ?1")
                .bind(message_id.to_string())
                .fetch_one(self.connection.pool())
                .await?;
        Ok(u32::try_from(count).unwrap_or(0))
    }
}
