//! Component H: the delivery dispatcher.
//!
//! A bounded worker pool that pulls `PENDING` messages, resolves a rule (F) and platform (G),
//! invokes the platform, and sends its reply back through the originating agent (C). A
//! per-chat lease set (`DashMap<(InstanceId, ChatName), ()>`) enforces §5's ordering guarantee:
//! at most one in-flight message per `(instance, chat)` dispatcher-wide.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::agent_client::AgentClientPool;
use crate::backoff::Backoff;
use crate::domain_types::{
    ChatName, DeliveryMaxAttempts, DeliveryStatus, ErrorKind, InstanceId, MessageId, StatusEvent,
};
use crate::platform::{Envelope, PlatformRegistry, Reply};
use crate::rule_engine::RuleEngine;
use crate::storage::{AttemptOutcome, DeliveryLedgerStore, MessageRow, MessageStore, StoreError};
use crate::util::unix_now;

/// Default message-delivery lease: a `DELIVERING` row older than this is reclaimed to
/// `PENDING` by [`MessageStore::list_pending`] itself.
const DEFAULT_LEASE_SECS: i64 = 300;
/// Fallback poll interval used when no `ingested` notification arrives in time.
const DEFAULT_POLL_FALLBACK: Duration = Duration::from_secs(5);
/// Max messages claimed per worker pass.
const CLAIM_LIMIT: u32 = 32;

/// Failures from a dispatcher-level operation (pulling work, recording ledger entries). Errors
/// raised while processing an individual message never surface here — they are translated into
/// message state transitions instead, per §4.H.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The message or ledger store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl DispatchError {
    /// Maps onto the shared retry/terminal classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::StoreError
    }
}

/// Pulls pending messages and routes them to platforms, enforcing one in-flight delivery per
/// `(instance, chat)` at a time.
pub struct DeliveryDispatcher {
    message_store: Arc<dyn MessageStore>,
    ledger_store: Arc<dyn DeliveryLedgerStore>,
    rule_engine: Arc<RuleEngine>,
    platforms: Arc<PlatformRegistry>,
    agent_pool: Arc<AgentClientPool>,
    leases: DashMap<(InstanceId, ChatName), ()>,
    retry_gate: DashMap<MessageId, Instant>,
    new_message: Arc<Notify>,
    /// Fed to `/ws/status` subscribers whenever a message's delivery status changes.
    status_tx: broadcast::Sender<StatusEvent>,
    delivery_max_attempts: DeliveryMaxAttempts,
}

impl DeliveryDispatcher {
    /// Builds a dispatcher over the given components, sharing `new_message` with the listener
    /// engine so a fresh ingest wakes a worker immediately instead of waiting out the fallback
    /// poll interval.
    #[must_use]
    pub fn new(
        message_store: Arc<dyn MessageStore>,
        ledger_store: Arc<dyn DeliveryLedgerStore>,
        rule_engine: Arc<RuleEngine>,
        platforms: Arc<PlatformRegistry>,
        agent_pool: Arc<AgentClientPool>,
        new_message: Arc<Notify>,
        status_tx: broadcast::Sender<StatusEvent>,
        delivery_max_attempts: DeliveryMaxAttempts,
    ) -> Self {
        Self {
            message_store,
            ledger_store,
            rule_engine,
            platforms,
            agent_pool,
            leases: DashMap::new(),
            retry_gate: DashMap::new(),
            new_message,
            status_tx,
            delivery_max_attempts,
        }
    }

    /// Spawns `worker_count` worker loops, each running until `token` is cancelled.
    pub fn spawn_workers(self: &Arc<Self>, worker_count: u32, token: &CancellationToken) {
        for worker_id in 0..worker_count {
            let dispatcher = Arc::clone(self);
            let token = token.clone();
            tokio::spawn(async move { dispatcher.run_worker(worker_id, token).await });
        }
    }

    async fn run_worker(self: Arc<Self>, worker_id: u32, token: CancellationToken) {
        loop {
            if token.is_cancelled() {
                break;
            }

            match self.claim_and_process_batch().await {
                Ok(0) => {
                    tokio::select! {
                        () = token.cancelled() => break,
                        () = self.new_message.notified() => {}
                        () = tokio::time::sleep(DEFAULT_POLL_FALLBACK) => {}
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(worker_id, error = %e, "dispatcher batch failed");
                    tokio::select! {
                        () = token.cancelled() => break,
                        () = tokio::time::sleep(DEFAULT_POLL_FALLBACK) => {}
                    }
                }
            }
        }
    }

    /// Claims up to [`CLAIM_LIMIT`] pending messages not already leased by chat, processes each,
    /// and returns the number actually processed.
    async fn claim_and_process_batch(&self) -> Result<usize, DispatchError> {
        let now = unix_now();
        let candidates = self
            .message_store
            .list_pending(CLAIM_LIMIT, now, DEFAULT_LEASE_SECS)
            .await?;

        let mut processed = 0usize;
        for row in candidates {
            if self.retry_gate_blocks(row.message_id) {
                continue;
            }
            let key = (row.instance_id.clone(), row.chat_name.clone());
            if self.leases.insert(key.clone(), ()).is_some() {
                continue;
            }
            processed += 1;
            self.process_one(row).await;
            self.leases.remove(&key);
        }
        Ok(processed)
    }

    fn retry_gate_blocks(&self, id: MessageId) -> bool {
        match self.retry_gate.get(&id) {
            Some(entry) if Instant::now() < *entry => true,
            Some(_) => {
                self.retry_gate.remove(&id);
                false
            }
            None => false,
        }
    }

    /// Detects whether a message's content @-mentions the bot, the heuristic a rule's
    /// `only_at_messages` flag gates on.
    fn is_at_message(content: &str) -> bool {
        content.contains('@')
    }

    #[instrument(skip(self, row), fields(message_id = %row.message_id, instance_id = %row.instance_id, chat = %row.chat_name))]
    async fn process_one(&self, row: MessageRow) {
        let now = unix_now();
        if let Err(e) = self.message_store.mark_delivering(row.message_id, now).await {
            warn!(error = %e, "mark_delivering failed");
            return;
        }

        let Some(resolved) = self.rule_engine.resolve(&row.instance_id, &row.chat_name).await else {
            self.terminal_skip(&row, "no_rule").await;
            return;
        };

        if resolved.only_at_messages && !Self::is_at_message(&row.content) {
            self.terminal_skip(&row, "not_at_message").await;
            return;
        }

        let Some(platform) = self.platforms.get(&resolved.platform_id) else {
            self.terminal_fail(&row, "platform not configured or disabled").await;
            return;
        };

        let attempt_no = row.delivery_attempts;
        let started_ts = now;
        let attempt_id = match self
            .ledger_store
            .record_start(row.message_id, attempt_no, started_ts)
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, "failed to record attempt start");
                None
            }
        };

        let envelope = Envelope {
            content: row.content.clone(),
            sender: row.sender.clone(),
            chat_name: row.chat_name.clone(),
            instance_id: row.instance_id.clone(),
            mtype: row.mtype,
            attachments: row.local_file_path.clone().into_iter().collect(),
        };

        match platform.process_message(&envelope).await {
            Ok(Reply::NoReply) => {
                self.record_outcome(attempt_id, AttemptOutcome::Success, None, None).await;
                self.mark_delivered(&row, None).await;
            }
            Ok(Reply::Text { text, at_list }) => {
                self.deliver_reply(&row, attempt_id, &text, &at_list).await;
            }
            Err(e) => {
                let kind = e.kind();
                self.record_outcome(attempt_id, outcome_for(kind), Some(kind), Some(&e.to_string()))
                    .await;
                self.fail_or_retry(&row, attempt_no, kind).await;
            }
        }
    }

    async fn deliver_reply(
        &self,
        row: &MessageRow,
        attempt_id: Option<crate::domain_types::AttemptId>,
        text: &str,
        at_list: &[String],
    ) {
        let Some(handle) = self.agent_pool.get(&row.instance_id) else {
            self.record_outcome(
                attempt_id,
                AttemptOutcome::RetryableFailure,
                Some(ErrorKind::Unavailable),
                Some("instance not in pool"),
            )
            .await;
            self.fail_or_retry(row, row.delivery_attempts, ErrorKind::Unavailable).await;
            return;
        };

        let at_option = if at_list.is_empty() { None } else { Some(at_list) };
        match handle.client().send_text(&row.chat_name, text, at_option).await {
            Ok(()) => {
                self.record_outcome(attempt_id, AttemptOutcome::Success, None, None).await;
                self.mark_delivered(row, Some(text)).await;
            }
            Err(e) => {
                let kind = e.kind();
                self.record_outcome(attempt_id, outcome_for(kind), Some(kind), Some(&e.to_string()))
                    .await;
                self.fail_or_retry(row, row.delivery_attempts, kind).await;
            }
        }
    }

    fn emit_status(&self, row: &MessageRow, delivery_status: DeliveryStatus, detail: Option<String>) {
        let _ = self.status_tx.send(StatusEvent {
            message_id: row.message_id,
            instance_id: row.instance_id.clone(),
            chat_name: row.chat_name.clone(),
            delivery_status,
            detail,
        });
    }

    async fn fail_or_retry(&self, row: &MessageRow, attempt_no: u32, kind: ErrorKind) {
        let id = row.message_id;
        let retryable = kind.is_retryable() && attempt_no < self.delivery_max_attempts.into_inner();
        if retryable {
            let backoff = Backoff::delivery_retry();
            self.retry_gate
                .insert(id, Instant::now() + backoff.delay_for(attempt_no));
        }
        if let Err(e) = self.message_store.mark_failed(id, retryable).await {
            warn!(error = %e, "mark_failed failed");
        }
        let status = if retryable { DeliveryStatus::Pending } else { DeliveryStatus::Failed };
        self.emit_status(row, status, Some(format!("{kind:?}")));
    }

    async fn terminal_fail(&self, row: &MessageRow, reason: &str) {
        warn!(reason, "terminal delivery failure");
        if let Err(e) = self.message_store.mark_failed(row.message_id, false).await {
            warn!(error = %e, "mark_failed failed");
        }
        self.emit_status(row, DeliveryStatus::Failed, Some(reason.to_string()));
    }

    async fn terminal_skip(&self, row: &MessageRow, reason: &str) {
        if let Err(e) = self.message_store.skip(row.message_id, reason).await {
            warn!(error = %e, "skip failed");
        }
        self.emit_status(row, DeliveryStatus::Skipped, Some(reason.to_string()));
    }

    async fn mark_delivered(&self, row: &MessageRow, reply: Option<&str>) {
        if let Err(e) = self.message_store.mark_delivered(row.message_id, reply).await {
            warn!(error = %e, "mark_delivered failed");
        }
        self.emit_status(row, DeliveryStatus::Delivered, None);
    }

    async fn record_outcome(
        &self,
        attempt_id: Option<crate::domain_types::AttemptId>,
        outcome: AttemptOutcome,
        error_kind: Option<ErrorKind>,
        error_detail: Option<&str>,
    ) {
        let Some(attempt_id) = attempt_id else { return };
        if let Err(e) = self
            .ledger_store
            .record_outcome(attempt_id, unix_now(), outcome, error_kind, error_detail)
            .await
        {
            warn!(error = %e, "failed to record attempt outcome");
        }
    }
}

fn outcome_for(kind: ErrorKind) -> AttemptOutcome {
    if kind.is_retryable() {
        AttemptOutcome::RetryableFailure
    } else {
        AttemptOutcome::TerminalFailure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_client::test_support::MockAgentClient;
    use crate::agent_client::{AgentClient, AgentHandle};
    use crate::domain_types::{MessageType, PlatformId, PlatformKind, Priority, RuleId};
    use crate::storage::test_utils::{
        InMemoryDeliveryLedgerStore, InMemoryMessageStore, InMemoryPlatformStore,
    };
    use crate::storage::{PlatformStore, RawMessage, RuleRow};
    use reqwest::Client;
    use serde_json::json;

    fn iid(s: &str) -> InstanceId {
        InstanceId::try_from(s.to_string()).unwrap()
    }
    fn cname(s: &str) -> ChatName {
        ChatName::try_from(s.to_string()).unwrap()
    }

    async fn setup() -> (Arc<DeliveryDispatcher>, Arc<MockAgentClient>, Arc<dyn MessageStore>, InstanceId) {
        let message_store: Arc<dyn MessageStore> = Arc::new(InMemoryMessageStore::default());
        let ledger_store: Arc<dyn DeliveryLedgerStore> = Arc::new(InMemoryDeliveryLedgerStore::default());
        let rule_engine = Arc::new(RuleEngine::new());
        let platforms = Arc::new(PlatformRegistry::new(Client::new()));
        let agent_pool = Arc::new(AgentClientPool::new());

        let id = iid("inst-a");
        let mock = Arc::new(MockAgentClient::healthy());
        let handle = Arc::new(AgentHandle::new(id.clone(), mock.clone() as Arc<dyn AgentClient>));
        handle.initialize().await.unwrap();
        agent_pool.insert(handle);

        let platform_id = PlatformId::from(uuid::Uuid::from_u128(1));
        platforms
            .upsert(
                platform_id,
                PlatformKind::Keyword,
                &json!({"rules": [{"keyword": "hi", "response": "hello back"}]}),
            )
            .unwrap();

        rule_engine
            .refresh(&[RuleRow {
                rule_id: RuleId::from(uuid::Uuid::from_u128(1)),
                name: "default".to_string(),
                instance_scope: "*".to_string(),
                chat_pattern: "*".to_string(),
                platform_id,
                priority: Priority::new(0),
                enabled: true,
                only_at_messages: false,
            }])
            .await;

        let (status_tx, _) = broadcast::channel(16);
        let dispatcher = Arc::new(DeliveryDispatcher::new(
            Arc::clone(&message_store),
            ledger_store,
            rule_engine,
            platforms,
            agent_pool,
            Arc::new(Notify::new()),
            status_tx,
            DeliveryMaxAttempts::try_new(3).unwrap(),
        ));
        (dispatcher, mock, message_store, id)
    }

    #[tokio::test]
    async fn delivers_reply_and_marks_delivered() {
        let (dispatcher, mock, message_store, id) = setup().await;
        let outcome = message_store
            .ingest(&RawMessage {
                instance_id: id.clone(),
                chat_name: cname("g1"),
                sender: "alice".to_string(),
                sender_remark: None,
                content: "hi there".to_string(),
                mtype: MessageType::Text,
                local_file_path: None,
                received_ts: unix_now(),
                is_outbound: false,
            })
            .await
            .unwrap();
        let crate::storage::IngestOutcome::Inserted(message_id) = outcome else {
            panic!("expected insert")
        };

        let processed = dispatcher.claim_and_process_batch().await.unwrap();
        assert_eq!(processed, 1);

        let row = message_store.get(message_id).await.unwrap().unwrap();
        assert_eq!(row.delivery_status, crate::domain_types::DeliveryStatus::Delivered);
        assert_eq!(row.reply_content.as_deref(), Some("hello back"));
        assert_eq!(mock.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn no_matching_rule_is_skipped() {
        let message_store: Arc<dyn MessageStore> = Arc::new(InMemoryMessageStore::default());
        let ledger_store: Arc<dyn DeliveryLedgerStore> = Arc::new(InMemoryDeliveryLedgerStore::default());
        let (status_tx, _) = broadcast::channel(16);
        let dispatcher = Arc::new(DeliveryDispatcher::new(
            Arc::clone(&message_store),
            ledger_store,
            Arc::new(RuleEngine::new()),
            Arc::new(PlatformRegistry::new(Client::new())),
            Arc::new(AgentClientPool::new()),
            Arc::new(Notify::new()),
            status_tx,
            DeliveryMaxAttempts::try_new(3).unwrap(),
        ));

        let outcome = message_store
            .ingest(&RawMessage {
                instance_id: iid("inst-a"),
                chat_name: cname("g1"),
                sender: "alice".to_string(),
                sender_remark: None,
                content: "hi".to_string(),
                mtype: MessageType::Text,
                local_file_path: None,
                received_ts: unix_now(),
                is_outbound: false,
            })
            .await
            .unwrap();
        let crate::storage::IngestOutcome::Inserted(message_id) = outcome else {
            panic!("expected insert")
        };

        dispatcher.claim_and_process_batch().await.unwrap();
        let row = message_store.get(message_id).await.unwrap().unwrap();
        assert_eq!(row.delivery_status, crate::domain_types::DeliveryStatus::Skipped);
    }

    #[tokio::test]
    async fn leases_prevent_concurrent_delivery_for_same_chat() {
        let (dispatcher, _mock, message_store, id) = setup().await;
        for _ in 0..3 {
            message_store
                .ingest(&RawMessage {
                    instance_id: id.clone(),
                    chat_name: cname("g1"),
                    sender: "alice".to_string(),
                    sender_remark: None,
                    content: format!("hi {}", unix_now()),
                    mtype: MessageType::Text,
                    local_file_path: None,
                    received_ts: unix_now(),
                    is_outbound: false,
                })
                .await
                .unwrap();
        }

        let key = (id.clone(), cname("g1"));
        dispatcher.leases.insert(key.clone(), ());
        let processed = dispatcher.claim_and_process_batch().await.unwrap();
        assert_eq!(processed, 0);
        dispatcher.leases.remove(&key);
    }
}
