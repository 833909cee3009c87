//! Component D: the listener engine.
//!
//! Three cooperating loops (§4.D) share one in-memory listener set, kept as a
//! `DashMap<(InstanceId, ChatName), ListenerState>` mirrored to the persistent store:
//!
//! - **L1 (main-window scan)** discovers new chats and sweeps unread messages.
//! - **L2 (per-listener poll)** polls chats already registered.
//! - **L3 (cleanup)** evicts idle, non-pinned listeners.
//!
//! Each loop absorbs its own errors into a consecutive-error counter (§4.D "Fault
//! tolerance"); only cancellation terminates a loop early.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::agent_client::{AgentClientError, AgentClientPool};
use crate::domain_types::{ChatName, ErrorKind, InstanceId, MessageEvent};
use crate::storage::{
    Instance, InstanceStatus, InstanceStore, ListenerRow, ListenerStore, MessageStore, StoreError,
};
use crate::util::unix_now;

/// Consecutive tick failures before L1/L2 triple their next wait.
const MAX_CONSECUTIVE_ERRORS_POLL: u32 = 5;
/// Consecutive tick failures before L3 triples its next wait.
const MAX_CONSECUTIVE_ERRORS_CLEANUP: u32 = 3;
/// Wait multiplier applied once the consecutive-error threshold is crossed.
const ERROR_BACKOFF_MULTIPLIER: u32 = 3;
/// Pending-queue depth above which ticks slow down linearly (§5 backpressure).
const DEFAULT_HIGH_WATERMARK: u32 = 1000;

/// Failures surfaced by a loop tick; always absorbed by the loop itself, never propagated.
#[derive(Debug, Error)]
pub enum ListenerEngineError {
    /// The agent call for this instance/chat failed.
    #[error("agent error: {0}")]
    Agent(#[from] AgentClientError),
    /// The persistent store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ListenerEngineError {
    /// Maps onto the shared retry/terminal classification; loops never retry on this
    /// themselves, but the mapping keeps log output consistent with the rest of the crate.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Agent(e) => e.kind(),
            Self::Store(_) => ErrorKind::StoreError,
        }
    }
}

/// In-memory mirror of a persisted [`ListenerRow`], per the state machine in §4.D:
/// `INACTIVE -> ACTIVE -> IDLE -> MARKED_FOR_REMOVAL -> REMOVED`. This struct tracks the data
/// the transitions are computed from; the transitions themselves are derived, not stored.
#[derive(Debug, Clone)]
pub struct ListenerState {
    /// When this listener was added.
    pub added_ts: i64,
    /// Timestamp of the most recently ingested message in this chat.
    pub last_message_ts: i64,
    /// Claimed by L3, pending agent confirmation of removal.
    pub marked_for_removal: bool,
    /// Manually added listeners are exempt from idle eviction.
    pub manual: bool,
    /// A conversation has been opened with the backing platform for this chat.
    pub conversation_started: bool,
    /// Pinned listeners are exempt from idle eviction, like `manual`.
    pub fixed: bool,
}

impl From<&ListenerRow> for ListenerState {
    fn from(row: &ListenerRow) -> Self {
        Self {
            added_ts: row.added_ts,
            last_message_ts: row.last_message_ts,
            marked_for_removal: row.marked_for_removal,
            manual: row.manual,
            conversation_started: row.conversation_started,
            fixed: row.fixed,
        }
    }
}

impl ListenerState {
    fn to_row(&self, instance_id: &InstanceId, chat_name: &ChatName) -> ListenerRow {
        ListenerRow {
            instance_id: instance_id.clone(),
            chat_name: chat_name.clone(),
            added_ts: self.added_ts,
            last_message_ts: self.last_message_ts,
            marked_for_removal: self.marked_for_removal,
            manual: self.manual,
            conversation_started: self.conversation_started,
            fixed: self.fixed,
        }
    }

    fn is_idle(&self, now: i64, idle_timeout_s: i64) -> bool {
        !self.manual && !self.fixed && now - self.last_message_ts > idle_timeout_s
    }
}

/// Owns the in-memory listener set and runs L1/L2/L3 against the agent pool and stores.
pub struct ListenerEngine {
    listeners: DashMap<(InstanceId, ChatName), ListenerState>,
    agent_pool: Arc<AgentClientPool>,
    instance_store: Arc<dyn InstanceStore>,
    listener_store: Arc<dyn ListenerStore>,
    message_store: Arc<dyn MessageStore>,
    /// Notified whenever ingest persists a new message, so the dispatcher can wake early
    /// instead of waiting for its own poll interval.
    new_message: Arc<Notify>,
    /// Fed to `/ws/messages` subscribers whenever a new, non-duplicate message is ingested.
    message_tx: broadcast::Sender<MessageEvent>,
    high_watermark: u32,
}

impl ListenerEngine {
    /// Builds an engine sharing the given pool/stores/notifier. Call
    /// [`ListenerEngine::load_from_store`] before starting the loops so the in-memory set
    /// starts consistent with what is already persisted (§8 property 1).
    #[must_use]
    pub fn new(
        agent_pool: Arc<AgentClientPool>,
        instance_store: Arc<dyn InstanceStore>,
        listener_store: Arc<dyn ListenerStore>,
        message_store: Arc<dyn MessageStore>,
        new_message: Arc<Notify>,
        message_tx: broadcast::Sender<MessageEvent>,
    ) -> Self {
        Self {
            listeners: DashMap::new(),
            agent_pool,
            instance_store,
            listener_store,
            message_store,
            new_message,
            message_tx,
            high_watermark: DEFAULT_HIGH_WATERMARK,
        }
    }

    /// Populates the in-memory set from every persisted listener row.
    ///
    /// # Errors
    /// Returns an error if the listener store cannot be read.
    pub async fn load_from_store(&self) -> Result<(), ListenerEngineError> {
        for row in self.listener_store.list_all().await? {
            self.listeners
                .insert((row.instance_id.clone(), row.chat_name.clone()), ListenerState::from(&row));
        }
        Ok(())
    }

    /// The number of active (non-removal-marked) listeners currently tracked for an instance,
    /// used to enforce `max_listeners` (§3 invariant).
    #[must_use]
    pub fn active_count(&self, instance_id: &InstanceId) -> u32 {
        u32::try_from(
            self.listeners
                .iter()
                .filter(|e| &e.key().0 == instance_id && !e.value().marked_for_removal)
                .count(),
        )
        .unwrap_or(u32::MAX)
    }

    /// A snapshot of every `(instance, chat)` currently tracked, for management inspection.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(InstanceId, ChatName, ListenerState)> {
        self.listeners
            .iter()
            .map(|e| (e.key().0.clone(), e.key().1.clone(), e.value().clone()))
            .collect()
    }

    async fn pending_backlog_factor(&self) -> u32 {
        match self.message_store.count_pending().await {
            Ok(count) if count >= self.high_watermark => 1 + count / self.high_watermark,
            _ => 1,
        }
    }

    /// Dedups and persists one raw message, updates the listener's `last_message_ts`, and
    /// wakes the dispatcher. Shared by L1 and L2, per §4.D.
    #[instrument(skip(self, raw), fields(instance_id = %raw.instance_id, chat = %raw.chat_name), err)]
    async fn ingest(&self, raw: crate::storage::RawMessage) -> Result<(), ListenerEngineError> {
        let instance_id = raw.instance_id.clone();
        let chat_name = raw.chat_name.clone();
        let received_ts = raw.received_ts;

        let outcome = self.message_store.ingest(&raw).await?;
        let crate::storage::IngestOutcome::Inserted(message_id) = outcome else {
            return Ok(());
        };

        self.listener_store
            .touch_last_message(&instance_id, &chat_name, received_ts)
            .await?;
        if let Some(mut state) = self.listeners.get_mut(&(instance_id.clone(), chat_name.clone())) {
            state.last_message_ts = state.last_message_ts.max(received_ts);
        }
        self.new_message.notify_waiters();
        let _ = self.message_tx.send(MessageEvent {
            message_id,
            instance_id,
            chat_name,
            sender: raw.sender,
            content: raw.content,
            mtype: raw.mtype,
            received_ts,
        });
        Ok(())
    }

    async fn try_add_listener(
        &self,
        instance: &Instance,
        chat_name: &ChatName,
        now: i64,
    ) -> Result<(), ListenerEngineError> {
        let key = (instance.instance_id.clone(), chat_name.clone());
        if self.listeners.contains_key(&key) {
            return Ok(());
        }
        if self.active_count(&instance.instance_id) >= instance.tunables.max_listeners.into_inner() {
            warn!(
                instance_id = %instance.instance_id,
                chat = %chat_name,
                "at max_listeners capacity, deferring new chat"
            );
            return Ok(());
        }

        let Some(handle) = self.agent_pool.get(&instance.instance_id) else {
            return Ok(());
        };
        handle.add_listener(chat_name).await?;

        let state = ListenerState {
            added_ts: now,
            last_message_ts: now,
            marked_for_removal: false,
            manual: false,
            conversation_started: false,
            fixed: false,
        };
        self.listener_store
            .upsert(&state.to_row(&instance.instance_id, chat_name))
            .await?;
        self.listeners.insert(key, state);
        Ok(())
    }

    /// One L1 tick: scan every enabled, healthy instance's main window.
    async fn tick_l1(&self) -> Result<(), ListenerEngineError> {
        let now = unix_now();
        for instance in self.instance_store.list_enabled().await? {
            let Some(handle) = self.agent_pool.get(&instance.instance_id) else {
                continue;
            };
            if !handle.is_healthy().await {
                continue;
            }

            let batches = match handle.client().get_unread_main_window_messages().await {
                Ok(batches) => batches,
                Err(e) => {
                    warn!(instance_id = %instance.instance_id, error = %e, "L1 scan failed");
                    continue;
                }
            };

            for batch in batches {
                self.try_add_listener(&instance, &batch.chat_name, now).await?;
                for raw in batch.messages {
                    self.ingest(raw).await?;
                }
            }
        }
        Ok(())
    }

    /// One L2 tick: poll every already-registered, non-removal-marked listener whose
    /// instance is healthy.
    async fn tick_l2(&self) -> Result<(), ListenerEngineError> {
        let healthy_instances: std::collections::HashSet<InstanceId> = self
            .instance_store
            .list_enabled()
            .await?
            .into_iter()
            .map(|i| i.instance_id)
            .collect();

        let snapshot: Vec<(InstanceId, ChatName)> = self
            .listeners
            .iter()
            .filter(|e| !e.value().marked_for_removal)
            .map(|e| e.key().clone())
            .collect();

        for (instance_id, chat_name) in snapshot {
            if !healthy_instances.contains(&instance_id) {
                continue;
            }
            let Some(handle) = self.agent_pool.get(&instance_id) else {
                continue;
            };
            if !handle.is_healthy().await {
                continue;
            }

            let messages = match handle.client().get_listener_messages(&chat_name).await {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(instance_id = %instance_id, chat = %chat_name, error = %e, "L2 poll failed");
                    continue;
                }
            };
            for raw in messages {
                self.ingest(raw).await?;
            }
        }
        Ok(())
    }

    /// One L3 tick: evict listeners idle past their instance's `listener_idle_timeout_s`.
    async fn tick_l3(&self) -> Result<(), ListenerEngineError> {
        let now = unix_now();
        let instances: std::collections::HashMap<InstanceId, Instance> = self
            .instance_store
            .list()
            .await?
            .into_iter()
            .map(|i| (i.instance_id.clone(), i))
            .collect();

        let candidates: Vec<(InstanceId, ChatName)> = self
            .listeners
            .iter()
            .filter(|e| {
                let (instance_id, _) = e.key();
                let idle_timeout = instances
                    .get(instance_id)
                    .map_or(1800, |i| i64::from(i.tunables.listener_idle_timeout_s.into_inner()));
                !e.value().marked_for_removal && e.value().is_idle(now, idle_timeout)
            })
            .map(|e| e.key().clone())
            .collect();

        for (instance_id, chat_name) in candidates {
            self.listener_store.mark_for_removal(&instance_id, &chat_name).await?;
            if let Some(mut state) = self.listeners.get_mut(&(instance_id.clone(), chat_name.clone())) {
                state.marked_for_removal = true;
            }

            let Some(handle) = self.agent_pool.get(&instance_id) else {
                continue;
            };
            match handle.remove_listener(&chat_name).await {
                Ok(()) => {
                    self.listener_store.delete(&instance_id, &chat_name).await?;
                    self.listeners.remove(&(instance_id.clone(), chat_name.clone()));
                    info!(%instance_id, %chat_name, "evicted idle listener");
                }
                Err(e) => {
                    warn!(%instance_id, %chat_name, error = %e, "remove_listener failed, will retry next cleanup tick");
                }
            }
        }
        Ok(())
    }

    /// Runs L1 until `token` is cancelled.
    pub async fn run_l1(self: Arc<Self>, base_interval: Duration, token: CancellationToken) {
        self.run_loop("L1-main-window-scan", base_interval, MAX_CONSECUTIVE_ERRORS_POLL, token, |engine| {
            Box::pin(engine.tick_l1())
        })
        .await;
    }

    /// Runs L2 until `token` is cancelled.
    pub async fn run_l2(self: Arc<Self>, base_interval: Duration, token: CancellationToken) {
        self.run_loop("L2-listener-poll", base_interval, MAX_CONSECUTIVE_ERRORS_POLL, token, |engine| {
            Box::pin(engine.tick_l2())
        })
        .await;
    }

    /// Runs L3 until `token` is cancelled.
    pub async fn run_l3(self: Arc<Self>, base_interval: Duration, token: CancellationToken) {
        self.run_loop("L3-cleanup", base_interval, MAX_CONSECUTIVE_ERRORS_CLEANUP, token, |engine| {
            Box::pin(engine.tick_l3())
        })
        .await;
    }

    async fn run_loop<'a, F>(
        self: &'a Arc<Self>,
        name: &'static str,
        base_interval: Duration,
        max_consecutive_errors: u32,
        token: CancellationToken,
        mut tick: F,
    ) where
        F: FnMut(
            &'a Arc<Self>,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), ListenerEngineError>> + Send + 'a>>,
    {
        let mut consecutive_errors: u32 = 0;
        loop {
            if token.is_cancelled() {
                break;
            }

            match tick(self).await {
                Ok(()) => consecutive_errors = 0,
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(loop_name = name, error = %e, consecutive_errors, "loop tick failed");
                }
            }

            let backlog_factor = self.pending_backlog_factor().await;
            let mut wait = base_interval * backlog_factor;
            if consecutive_errors >= max_consecutive_errors {
                wait *= ERROR_BACKOFF_MULTIPLIER;
            }

            tokio::select! {
                () = token.cancelled() => break,
                () = tokio::time::sleep(wait) => {}
            }
        }
        info!(loop_name = name, "loop cancelled, exiting cleanly");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_client::test_support::MockAgentClient;
    use crate::agent_client::{AgentClient, AgentHandle};
    use crate::config::InstanceTunables;
    use crate::domain_types::MessageType;
    use crate::storage::test_utils::{InMemoryInstanceStore, InMemoryListenerStore, InMemoryMessageStore};
    use crate::storage::RawMessage;

    fn iid(s: &str) -> InstanceId {
        InstanceId::try_from(s.to_string()).unwrap()
    }
    fn cname(s: &str) -> ChatName {
        ChatName::try_from(s.to_string()).unwrap()
    }

    async fn engine_with_instance(max_listeners: u32) -> (Arc<ListenerEngine>, Arc<MockAgentClient>, InstanceId) {
        let instance_store: Arc<dyn InstanceStore> = Arc::new(InMemoryInstanceStore::default());
        let listener_store: Arc<dyn ListenerStore> = Arc::new(InMemoryListenerStore::default());
        let message_store: Arc<dyn MessageStore> = Arc::new(InMemoryMessageStore::default());
        let pool = Arc::new(AgentClientPool::new());

        let id = iid("inst-a");
        let mut tunables = InstanceTunables::testing();
        tunables.max_listeners = crate::domain_types::MaxListeners::try_new(max_listeners).unwrap();
        instance_store
            .upsert(&Instance {
                instance_id: id.clone(),
                name: "Agent A".to_string(),
                base_url: "http://agent-a".to_string(),
                api_key: "key".to_string(),
                enabled: true,
                status: InstanceStatus::Online,
                last_active_ts: None,
                tunables,
                last_error: None,
            })
            .await
            .unwrap();

        let mock = Arc::new(MockAgentClient::healthy());
        let handle = Arc::new(AgentHandle::new(id.clone(), mock.clone() as Arc<dyn AgentClient>));
        handle.initialize().await.unwrap();
        pool.insert(handle);

        let (message_tx, _) = broadcast::channel(16);
        let engine = Arc::new(ListenerEngine::new(
            pool,
            instance_store,
            listener_store,
            message_store,
            Arc::new(Notify::new()),
            message_tx,
        ));
        (engine, mock, id)
    }

    #[tokio::test]
    async fn l1_discovers_new_chat_and_ingests_message() {
        let (engine, mock, id) = engine_with_instance(5).await;
        *mock.main_window.lock().unwrap() = vec![crate::agent_client::MainWindowBatch {
            chat_name: cname("g1"),
            messages: vec![RawMessage {
                instance_id: id.clone(),
                chat_name: cname("g1"),
                sender: "alice".to_string(),
                sender_remark: None,
                content: "hi".to_string(),
                mtype: MessageType::Text,
                local_file_path: None,
                received_ts: unix_now(),
                is_outbound: false,
            }],
        }];

        engine.tick_l1().await.unwrap();

        assert_eq!(engine.active_count(&id), 1);
        assert_eq!(mock.added_listeners.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn capacity_backpressure_defers_new_chats() {
        let (engine, mock, id) = engine_with_instance(2).await;
        *mock.main_window.lock().unwrap() = vec![
            crate::agent_client::MainWindowBatch { chat_name: cname("g1"), messages: vec![] },
            crate::agent_client::MainWindowBatch { chat_name: cname("g2"), messages: vec![] },
            crate::agent_client::MainWindowBatch { chat_name: cname("g3"), messages: vec![] },
        ];

        engine.tick_l1().await.unwrap();

        assert_eq!(engine.active_count(&id), 2);
        assert_eq!(mock.added_listeners.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn l3_evicts_idle_listener_and_calls_remove() {
        let (engine, mock, id) = engine_with_instance(5).await;
        engine.listeners.insert(
            (id.clone(), cname("g1")),
            ListenerState {
                added_ts: 0,
                last_message_ts: 0,
                marked_for_removal: false,
                manual: false,
                conversation_started: false,
                fixed: false,
            },
        );

        engine.tick_l3().await.unwrap();

        assert_eq!(engine.active_count(&id), 0);
        assert_eq!(mock.removed_listeners.lock().unwrap(), vec!["g1".to_string()]);
    }

    #[tokio::test]
    async fn l3_never_evicts_manual_or_fixed_listeners() {
        let (engine, _mock, id) = engine_with_instance(5).await;
        engine.listeners.insert(
            (id.clone(), cname("pinned")),
            ListenerState {
                added_ts: 0,
                last_message_ts: 0,
                marked_for_removal: false,
                manual: true,
                conversation_started: false,
                fixed: false,
            },
        );

        engine.tick_l3().await.unwrap();

        assert_eq!(engine.active_count(&id), 1);
    }

    #[tokio::test]
    async fn dedup_across_l1_and_l2_ingests_once() {
        let (engine, mock, id) = engine_with_instance(5).await;
        let now = unix_now();
        let raw = RawMessage {
            instance_id: id.clone(),
            chat_name: cname("g1"),
            sender: "alice".to_string(),
            sender_remark: None,
            content: "hi".to_string(),
            mtype: MessageType::Text,
            local_file_path: None,
            received_ts: now,
            is_outbound: false,
        };
        *mock.main_window.lock().unwrap() =
            vec![crate::agent_client::MainWindowBatch { chat_name: cname("g1"), messages: vec![raw.clone()] }];
        engine.tick_l1().await.unwrap();

        *mock.listener_messages.lock().unwrap() = vec![raw];
        engine.tick_l2().await.unwrap();

        assert_eq!(engine.message_store.count_pending().await.unwrap(), 1);
    }
}
