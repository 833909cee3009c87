//! Persistent storage traits, one per entity family, each with a `Sqlite*` production
//! implementation and (in [`test_utils`]) an in-memory fake for component tests.
//!
//! All writes are transactional; encrypted fields (`api_key`, platform configs) are
//! transparently decrypted on read for in-process callers and must never reach the
//! management HTTP surface in cleartext (the DTOs in `rest_api` redact them unconditionally).

pub mod sqlite_config_store;
pub mod sqlite_delivery_ledger_store;
pub mod sqlite_instance_store;
pub mod sqlite_listener_store;
pub mod sqlite_message_store;
pub mod sqlite_platform_store;
pub mod sqlite_rule_store;
#[cfg(test)]
pub mod test_utils;

pub use sqlite_config_store::SqliteConfigStore;
pub use sqlite_delivery_ledger_store::SqliteDeliveryLedgerStore;
pub use sqlite_instance_store::SqliteInstanceStore;
pub use sqlite_listener_store::SqliteListenerStore;
pub use sqlite_message_store::SqliteMessageStore;
pub use sqlite_platform_store::SqlitePlatformStore;
pub use sqlite_rule_store::SqliteRuleStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain_types::{
    AttemptId, ChatName, DeliveryStatus, ErrorKind, InstanceId, InstanceStatus, MessageId,
    MessageType, PlatformId, PlatformKind, Priority, RuleId,
};

/// Failures from any entity store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A secret field could not be encrypted or decrypted.
    #[error("crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),
    /// A row referenced an id or enum value that does not parse.
    #[error("corrupt row: {0}")]
    CorruptRow(String),
    /// The requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

impl StoreError {
    /// Every store failure is classified `StoreError` for the dispatcher/HTTP mapping.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::StoreError
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// A fully materialized instance row.
#[derive(Debug, Clone)]
pub struct Instance {
    /// Stable primary key.
    pub instance_id: InstanceId,
    /// Display name.
    pub name: String,
    /// Base URL of the agent's HTTP API.
    pub base_url: String,
    /// Decrypted API key (never serialized to the management API as-is).
    pub api_key: String,
    /// Whether the instance participates in L1/L2/L3 loops.
    pub enabled: bool,
    /// Current lifecycle status.
    pub status: InstanceStatus,
    /// Unix timestamp of the last successful agent call, if any.
    pub last_active_ts: Option<i64>,
    /// Per-instance tunables.
    pub tunables: crate::config::InstanceTunables,
    /// Last error message recorded against this instance, if any.
    pub last_error: Option<String>,
}

/// CRUD over the `instances` table.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Inserts a new instance or replaces an existing one with the same id.
    async fn upsert(&self, instance: &Instance) -> StoreResult<()>;
    /// Fetches a single instance by id.
    async fn get(&self, id: &InstanceId) -> StoreResult<Option<Instance>>;
    /// Lists every instance, enabled or not.
    async fn list(&self) -> StoreResult<Vec<Instance>>;
    /// Lists only enabled instances, the set the listener engine iterates each tick.
    async fn list_enabled(&self) -> StoreResult<Vec<Instance>>;
    /// Updates the lifecycle status and optional error message.
    async fn set_status(
        &self,
        id: &InstanceId,
        status: InstanceStatus,
        last_error: Option<&str>,
    ) -> StoreResult<()>;
    /// Records a successful contact with the instance's agent.
    async fn touch_last_active(&self, id: &InstanceId, ts: i64) -> StoreResult<()>;
    /// Enables or disables an instance.
    async fn set_enabled(&self, id: &InstanceId, enabled: bool) -> StoreResult<()>;
    /// Deletes an instance and (via `ON DELETE CASCADE`) its listeners.
    async fn delete(&self, id: &InstanceId) -> StoreResult<()>;
}

/// A fully materialized listener row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerRow {
    /// Owning instance.
    pub instance_id: InstanceId,
    /// Chat this listener tracks.
    pub chat_name: ChatName,
    /// When the listener was added.
    pub added_ts: i64,
    /// Timestamp of the most recent message seen in this chat.
    pub last_message_ts: i64,
    /// Whether cleanup has already claimed this listener for removal.
    pub marked_for_removal: bool,
    /// Manually added listeners are never idle-evicted.
    pub manual: bool,
    /// Whether a conversation has been opened with the backing platform.
    pub conversation_started: bool,
    /// Pinned listeners are never idle-evicted, like `manual`.
    pub fixed: bool,
}

impl ListenerRow {
    /// Manual and fixed listeners are exempt from L3's idle eviction sweep.
    #[must_use]
    pub fn exempt_from_eviction(&self) -> bool {
        self.manual || self.fixed
    }
}

/// CRUD over the `listeners` table, the persisted mirror of the engine's in-memory set.
#[async_trait]
pub trait ListenerStore: Send + Sync {
    /// Inserts a new listener row, or replaces one with the same `(instance_id, chat_name)`.
    async fn upsert(&self, listener: &ListenerRow) -> StoreResult<()>;
    /// Lists every listener for a given instance.
    async fn list_for_instance(&self, instance_id: &InstanceId) -> StoreResult<Vec<ListenerRow>>;
    /// Lists every listener across all instances.
    async fn list_all(&self) -> StoreResult<Vec<ListenerRow>>;
    /// Updates `last_message_ts`, used on every ingest.
    async fn touch_last_message(
        &self,
        instance_id: &InstanceId,
        chat_name: &ChatName,
        ts: i64,
    ) -> StoreResult<()>;
    /// Flags a listener as claimed by the cleanup loop, pending agent confirmation.
    async fn mark_for_removal(
        &self,
        instance_id: &InstanceId,
        chat_name: &ChatName,
    ) -> StoreResult<()>;
    /// Removes a listener row after the agent confirms removal.
    async fn delete(&self, instance_id: &InstanceId, chat_name: &ChatName) -> StoreResult<()>;
    /// Count of active (non-removed) listeners for an instance, used for capacity checks.
    async fn count_for_instance(&self, instance_id: &InstanceId) -> StoreResult<u32>;
}

/// A raw message as reported by an agent, prior to dedup/persist.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Owning instance.
    pub instance_id: InstanceId,
    /// Chat the message arrived in.
    pub chat_name: ChatName,
    /// Sender's handle as reported by the agent.
    pub sender: String,
    /// Sender's display/remark name, if the agent supplied one.
    pub sender_remark: Option<String>,
    /// Message body (text, or a caption/description for non-text types).
    pub content: String,
    /// Content kind.
    pub mtype: MessageType,
    /// Local filesystem path for downloaded attachments, if any.
    pub local_file_path: Option<String>,
    /// When the agent reports having received the message (Unix seconds).
    pub received_ts: i64,
    /// Whether this message originated from the bot/self rather than a remote sender.
    pub is_outbound: bool,
}

/// A fully materialized message row.
#[derive(Debug, Clone)]
pub struct MessageRow {
    /// Locally-assigned identifier.
    pub message_id: MessageId,
    /// Owning instance.
    pub instance_id: InstanceId,
    /// Chat the message belongs to.
    pub chat_name: ChatName,
    /// Sender handle.
    pub sender: String,
    /// Sender display name, if known.
    pub sender_remark: Option<String>,
    /// Message body.
    pub content: String,
    /// Content kind.
    pub mtype: MessageType,
    /// Attachment path, if any.
    pub local_file_path: Option<String>,
    /// When the message was received.
    pub received_ts: i64,
    /// Current delivery lifecycle state.
    pub delivery_status: DeliveryStatus,
    /// Number of delivery attempts made so far.
    pub delivery_attempts: u32,
    /// The platform's reply text, once delivered.
    pub reply_content: Option<String>,
    /// A short status tag for the reply (e.g. `ok`, `no_reply`).
    pub reply_status: Option<String>,
}

/// Outcome of attempting to ingest a raw message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new row was persisted with this id.
    Inserted(MessageId),
    /// An identical `(instance, chat, sender, hash)` was already ingested within the window.
    Duplicate,
}

/// Ingest-side dedup/persist and delivery-side query/transition operations over `messages`.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Dedups and persists a raw message. System/self/outbound messages are stored as
    /// `SKIPPED` rather than `PENDING`.
    async fn ingest(&self, msg: &RawMessage) -> StoreResult<IngestOutcome>;
    /// Pending messages ready for dispatch, oldest first, capped at `limit`. Also reclaims
    /// any `DELIVERING` rows whose lease has expired back to `PENDING` before selecting.
    async fn list_pending(&self, limit: u32, now: i64, lease_secs: i64) -> StoreResult<Vec<MessageRow>>;
    /// Total count of `PENDING` rows, used for the backpressure watermark.
    async fn count_pending(&self) -> StoreResult<u32>;
    /// Claims a pending message for delivery.
    async fn mark_delivering(&self, id: MessageId, now: i64) -> StoreResult<()>;
    /// Marks a message delivered, recording the platform's reply if any.
    async fn mark_delivered(&self, id: MessageId, reply: Option<&str>) -> StoreResult<()>;
    /// Marks a message failed. `retryable` governs whether the dispatcher will requeue it
    /// (returning it to `PENDING` with an incremented attempt count) or terminally fail it.
    async fn mark_failed(&self, id: MessageId, retryable: bool) -> StoreResult<()>;
    /// Marks a message intentionally unrouted (no matching rule, disabled platform).
    async fn skip(&self, id: MessageId, reason: &str) -> StoreResult<()>;
    /// Fetches a single message by id.
    async fn get(&self, id: MessageId) -> StoreResult<Option<MessageRow>>;
    /// Lists messages for management/inspection, optionally filtered and bounded by time.
    async fn query(
        &self,
        instance_id: Option<&InstanceId>,
        chat_name: Option<&ChatName>,
        since_ts: Option<i64>,
        limit: u32,
    ) -> StoreResult<Vec<MessageRow>>;
}

/// A fully materialized platform row, config already decrypted.
#[derive(Debug, Clone)]
pub struct PlatformRow {
    /// Stable identifier.
    pub platform_id: PlatformId,
    /// Display name.
    pub name: String,
    /// Which platform implementation this row configures.
    pub kind: PlatformKind,
    /// Decrypted JSON configuration, keys recognized per `kind`.
    pub config: serde_json::Value,
    /// Whether this platform may be resolved by the rule engine.
    pub enabled: bool,
}

/// CRUD over the `platforms` table.
#[async_trait]
pub trait PlatformStore: Send + Sync {
    /// Inserts or replaces a platform row.
    async fn upsert(&self, platform: &PlatformRow) -> StoreResult<()>;
    /// Fetches a single platform by id.
    async fn get(&self, id: &PlatformId) -> StoreResult<Option<PlatformRow>>;
    /// Lists every platform.
    async fn list(&self) -> StoreResult<Vec<PlatformRow>>;
    /// Deletes a platform.
    async fn delete(&self, id: &PlatformId) -> StoreResult<()>;
}

/// A fully materialized rule row.
#[derive(Debug, Clone)]
pub struct RuleRow {
    /// Stable identifier, also the final tiebreaker in resolution order.
    pub rule_id: RuleId,
    /// Display name.
    pub name: String,
    /// `"*"` for any instance, or a specific instance id.
    pub instance_scope: String,
    /// `"*"`, a literal chat name, or `"regex:<expr>"`.
    pub chat_pattern: String,
    /// Platform this rule routes to when it matches.
    pub platform_id: PlatformId,
    /// Priority; higher wins ties before specificity.
    pub priority: Priority,
    /// Whether this rule is considered during resolution.
    pub enabled: bool,
    /// Whether this rule only matches messages that @-mention the bot.
    pub only_at_messages: bool,
}

/// CRUD over the `rules` table.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Inserts or replaces a rule row.
    async fn upsert(&self, rule: &RuleRow) -> StoreResult<()>;
    /// Fetches a single rule by id.
    async fn get(&self, id: &RuleId) -> StoreResult<Option<RuleRow>>;
    /// Lists every enabled rule, the set the rule engine caches.
    async fn list_enabled(&self) -> StoreResult<Vec<RuleRow>>;
    /// Lists every rule, enabled or not, for management.
    async fn list_all(&self) -> StoreResult<Vec<RuleRow>>;
    /// Deletes a rule.
    async fn delete(&self, id: &RuleId) -> StoreResult<()>;
}

/// Outcome recorded for one delivery attempt in the append-only ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The attempt succeeded.
    Success,
    /// The attempt failed but will be retried.
    RetryableFailure,
    /// The attempt failed and will not be retried.
    TerminalFailure,
}

/// Append-only audit trail of delivery attempts, also used to reconstruct `attempt_no`
/// after a process restart instead of trusting only in-memory dispatcher state.
#[async_trait]
pub trait DeliveryLedgerStore: Send + Sync {
    /// Records a new attempt starting now.
    async fn record_start(
        &self,
        message_id: MessageId,
        attempt_no: u32,
        started_ts: i64,
    ) -> StoreResult<AttemptId>;
    /// Records the outcome of a previously started attempt.
    async fn record_outcome(
        &self,
        attempt_id: AttemptId,
        finished_ts: i64,
        outcome: AttemptOutcome,
        error_kind: Option<ErrorKind>,
        error_detail: Option<&str>,
    ) -> StoreResult<()>;
    /// The number of attempts already recorded for a message, used to resume `attempt_no`
    /// after a restart.
    async fn attempt_count(&self, message_id: MessageId) -> StoreResult<u32>;
}

/// Backing store for the config registry's generic key/value table.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Sets a key, optionally encrypting the value at rest.
    async fn set(&self, key: &str, value: &str, encrypted: bool) -> StoreResult<()>;
    /// Gets a key's decrypted value, if present.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    /// Lists every key (values included, already decrypted).
    async fn list(&self) -> StoreResult<Vec<(String, String)>>;
    /// Deletes a key.
    async fn delete(&self, key: &str) -> StoreResult<()>;
}
