//! Component C: the agent client pool.
//!
//! One [`AgentClient`] per enabled [`Instance`](crate::storage::Instance), speaking the
//! upstream wire contract in §6 of the design: `X-API-Key` auth, a `{code, message, data}`
//! envelope with `code=0` success and numeric error families (1xxx auth, 2xxx
//! not-initialized, 3xxx op failed). [`AgentClientPool`] owns one handle per instance,
//! serializing the critical section (`initialize`, `add_listener`, `remove_listener`) behind
//! a per-instance `tokio::sync::Mutex` while letting read-only calls run concurrently.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{instrument, warn};

use crate::backoff::Backoff;
use crate::domain_types::{ChatName, ErrorKind, InstanceId};
use crate::storage::RawMessage;

/// Hard timeout applied to every agent call, per §5.
pub const AGENT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Failures from a single agent call.
#[derive(Debug, Error)]
pub enum AgentClientError {
    /// Network/timeout failure reaching the agent.
    #[error("agent unavailable: {0}")]
    Unavailable(String),
    /// The agent rejected the request (4xx, or a 1xxx/3xxx service code).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The agent failed processing the request (5xx, or an unrecognized service code).
    #[error("agent failure: {0}")]
    AgentFailure(String),
    /// The agent has not been initialized (a 2xxx service code).
    #[error("agent not initialized")]
    NotInitialized,
    /// A response body did not match the expected envelope shape.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl AgentClientError {
    /// Maps this error onto the shared retry/terminal classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::InvalidRequest(_) | Self::Malformed(_) => ErrorKind::InvalidRequest,
            Self::AgentFailure(_) => ErrorKind::AgentFailure,
            Self::NotInitialized => ErrorKind::NotInitialized,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i32,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<T>,
}

/// One chat's worth of unread messages discovered in the agent's main window.
#[derive(Debug, Clone)]
pub struct MainWindowBatch {
    /// The chat these messages arrived in.
    pub chat_name: ChatName,
    /// The raw messages, ready for ingest.
    pub messages: Vec<RawMessage>,
}

/// Minimal chat metadata returned by `get_chat_info`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatInfo {
    /// The chat's display name as the agent reports it.
    #[serde(default)]
    pub name: Option<String>,
    /// Whether the agent considers this chat a group conversation.
    #[serde(default)]
    pub is_group: bool,
}

/// The operations the dispatcher, listener engine, and management surface need from a
/// federated agent, per §4.C's contract.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Performs the agent's login/session bootstrap. Must succeed before any other call.
    async fn initialize(&self) -> Result<(), AgentClientError>;
    /// A cheap liveness probe; does not imply the full contract works.
    async fn health_check(&self) -> Result<bool, AgentClientError>;
    /// Unread messages grouped by the chat they arrived in.
    async fn get_unread_main_window_messages(&self) -> Result<Vec<MainWindowBatch>, AgentClientError>;
    /// Registers a chat for polling on the agent side.
    async fn add_listener(&self, chat: &ChatName) -> Result<(), AgentClientError>;
    /// Deregisters a chat on the agent side.
    async fn remove_listener(&self, chat: &ChatName) -> Result<(), AgentClientError>;
    /// Messages newly observed in an already-registered chat.
    async fn get_listener_messages(&self, chat: &ChatName) -> Result<Vec<RawMessage>, AgentClientError>;
    /// Sends a plain text reply, optionally @-mentioning the given handles.
    async fn send_text(
        &self,
        chat: &ChatName,
        text: &str,
        at_list: Option<&[String]>,
    ) -> Result<(), AgentClientError>;
    /// Sends a typing indicator followed by text, where the agent supports it.
    async fn send_typing_text(&self, chat: &ChatName, text: &str) -> Result<(), AgentClientError>;
    /// Sends one or more file attachments.
    async fn send_file(&self, chat: &ChatName, paths: &[String]) -> Result<(), AgentClientError>;
    /// @-mentions everyone in the chat, optionally with accompanying text.
    async fn at_all(&self, chat: &ChatName, text: Option<&str>) -> Result<(), AgentClientError>;
    /// Fetches metadata about a chat.
    async fn get_chat_info(&self, chat: &ChatName) -> Result<ChatInfo, AgentClientError>;
}

/// Production [`AgentClient`] speaking HTTP+JSON to a real agent.
pub struct HttpAgentClient {
    client: Client,
    base_url: String,
    api_key: String,
    instance_id: InstanceId,
}

impl HttpAgentClient {
    /// Builds a client for one agent's `base_url`, authenticating with `api_key`.
    #[must_use]
    pub fn new(client: Client, instance_id: InstanceId, base_url: String, api_key: String) -> Self {
        Self {
            client,
            base_url,
            api_key,
            instance_id,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<Option<T>, AgentClientError> {
        let request = builder.header("X-API-Key", &self.api_key);
        let response = tokio::time::timeout(AGENT_CALL_TIMEOUT, request.send())
            .await
            .map_err(|_| AgentClientError::Unavailable("request timed out".to_string()))?
            .map_err(|e| AgentClientError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(AgentClientError::AgentFailure(format!("http {status}")));
        }
        if status.is_client_error() && status != StatusCode::OK {
            return Err(AgentClientError::InvalidRequest(format!("http {status}")));
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| AgentClientError::Malformed(e.to_string()))?;

        classify_service_code(envelope.code, &envelope.message)?;
        Ok(envelope.data)
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<Option<T>, AgentClientError> {
        self.call(self.client.get(self.url(path))).await
    }

    async fn post<B: serde::Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Option<T>, AgentClientError> {
        self.call(self.client.post(self.url(path)).json(body)).await
    }
}

/// Maps the agent's numeric service code onto the retryable/terminal split, per §6/§7:
/// `0` success, `1xxx` auth, `2xxx` not-initialized, `3xxx` operation failed.
fn classify_service_code(code: i32, message: &str) -> Result<(), AgentClientError> {
    match code {
        0 => Ok(()),
        1000..=1999 => Err(AgentClientError::InvalidRequest(format!(
            "auth error ({code}): {message}"
        ))),
        2000..=2999 => Err(AgentClientError::NotInitialized),
        3000..=3999 => Err(AgentClientError::AgentFailure(format!(
            "operation failed ({code}): {message}"
        ))),
        other => Err(AgentClientError::AgentFailure(format!(
            "unrecognized service code {other}: {message}"
        ))),
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    #[instrument(skip(self), err)]
    async fn initialize(&self) -> Result<(), AgentClientError> {
        self.post::<_, serde_json::Value>("/api/wechat/initialize", &json!({}))
            .await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn health_check(&self) -> Result<bool, AgentClientError> {
        let data: Option<serde_json::Value> = self.get("/api/health").await?;
        Ok(data.is_some())
    }

    #[instrument(skip(self), err)]
    async fn get_unread_main_window_messages(&self) -> Result<Vec<MainWindowBatch>, AgentClientError> {
        #[derive(Deserialize)]
        struct WireMessage {
            chat_name: String,
            sender: String,
            #[serde(default)]
            sender_remark: Option<String>,
            content: String,
            #[serde(default = "default_mtype")]
            mtype: String,
            #[serde(default)]
            local_file_path: Option<String>,
            received_ts: i64,
            #[serde(default)]
            is_outbound: bool,
        }
        fn default_mtype() -> String {
            "text".to_string()
        }

        let data: Option<Vec<WireMessage>> = self.get("/api/message/get-next-new").await?;
        let mut grouped: std::collections::BTreeMap<String, Vec<RawMessage>> = Default::default();
        for wire in data.unwrap_or_default() {
            let chat_name = ChatName::try_from(wire.chat_name.clone())
                .map_err(|e| AgentClientError::Malformed(e.to_string()))?;
            let mtype = wire
                .mtype
                .parse()
                .map_err(|e: String| AgentClientError::Malformed(e))?;
            grouped.entry(wire.chat_name).or_default().push(RawMessage {
                instance_id: self.instance_id.clone(),
                chat_name,
                sender: wire.sender,
                sender_remark: wire.sender_remark,
                content: wire.content,
                mtype,
                local_file_path: wire.local_file_path,
                received_ts: wire.received_ts,
                is_outbound: wire.is_outbound,
            });
        }
        Ok(grouped
            .into_iter()
            .map(|(name, messages)| MainWindowBatch {
                chat_name: ChatName::try_from(name).expect("already validated above"),
                messages,
            })
            .collect())
    }

    #[instrument(skip(self), err)]
    async fn add_listener(&self, chat: &ChatName) -> Result<(), AgentClientError> {
        self.post::<_, serde_json::Value>(
            "/api/message/listen/add",
            &json!({ "who": chat.as_ref() }),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn remove_listener(&self, chat: &ChatName) -> Result<(), AgentClientError> {
        self.post::<_, serde_json::Value>(
            "/api/message/listen/remove",
            &json!({ "who": chat.as_ref() }),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get_listener_messages(&self, chat: &ChatName) -> Result<Vec<RawMessage>, AgentClientError> {
        #[derive(Deserialize)]
        struct WireMessage {
            sender: String,
            #[serde(default)]
            sender_remark: Option<String>,
            content: String,
            #[serde(default = "default_mtype")]
            mtype: String,
            #[serde(default)]
            local_file_path: Option<String>,
            received_ts: i64,
            #[serde(default)]
            is_outbound: bool,
        }
        fn default_mtype() -> String {
            "text".to_string()
        }

        let path = format!("/api/message/listen/get?who={}", chat.as_ref());
        let data: Option<Vec<WireMessage>> = self.get(&path).await?;
        data.unwrap_or_default()
            .into_iter()
            .map(|wire| {
                Ok(RawMessage {
                    instance_id: self.instance_id.clone(),
                    chat_name: chat.clone(),
                    sender: wire.sender,
                    sender_remark: wire.sender_remark,
                    content: wire.content,
                    mtype: wire
                        .mtype
                        .parse()
                        .map_err(|e: String| AgentClientError::Malformed(e))?,
                    local_file_path: wire.local_file_path,
                    received_ts: wire.received_ts,
                    is_outbound: wire.is_outbound,
                })
            })
            .collect()
    }

    #[instrument(skip(self, text), err)]
    async fn send_text(
        &self,
        chat: &ChatName,
        text: &str,
        at_list: Option<&[String]>,
    ) -> Result<(), AgentClientError> {
        let body = json!({
            "who": chat.as_ref(),
            "message": text,
            "at_list": at_list.unwrap_or_default(),
        });
        self.post::<_, serde_json::Value>("/api/message/send", &body)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, text), err)]
    async fn send_typing_text(&self, chat: &ChatName, text: &str) -> Result<(), AgentClientError> {
        let body = json!({ "who": chat.as_ref(), "message": text });
        self.post::<_, serde_json::Value>("/api/message/send-typing", &body)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn send_file(&self, chat: &ChatName, paths: &[String]) -> Result<(), AgentClientError> {
        let body = json!({ "who": chat.as_ref(), "paths": paths });
        self.post::<_, serde_json::Value>("/api/message/send-file", &body)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, text), err)]
    async fn at_all(&self, chat: &ChatName, text: Option<&str>) -> Result<(), AgentClientError> {
        let body = json!({ "who": chat.as_ref(), "message": text });
        self.post::<_, serde_json::Value>("/api/chat-window/message/send-at-all", &body)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get_chat_info(&self, chat: &ChatName) -> Result<ChatInfo, AgentClientError> {
        let path = format!("/api/chat-window/info?who={}", chat.as_ref());
        let data: Option<ChatInfo> = self.get(&path).await?;
        data.ok_or_else(|| AgentClientError::Malformed("missing chat info data".to_string()))
    }
}

/// Health state tracked per instance, per §4.C's health model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Not yet successfully initialized.
    Uninitialized,
    /// Initialized and passing health checks.
    Healthy,
    /// Initialized but the last health check (or re-initialize attempt) failed.
    Unhealthy,
}

/// One agent's client plus the concurrency and health-tracking scaffolding the pool enforces
/// around it: a critical-section mutex for `initialize`/`add_listener`/`remove_listener`, and
/// a health state updated by the pool's periodic probe.
pub struct AgentHandle {
    instance_id: InstanceId,
    client: Arc<dyn AgentClient>,
    critical_section: Mutex<()>,
    health: RwLock<HealthState>,
    consecutive_failures: RwLock<u32>,
}

impl AgentHandle {
    /// Wraps a client for the given instance, starting in the uninitialized health state.
    #[must_use]
    pub fn new(instance_id: InstanceId, client: Arc<dyn AgentClient>) -> Self {
        Self {
            instance_id,
            client,
            critical_section: Mutex::new(()),
            health: RwLock::new(HealthState::Uninitialized),
            consecutive_failures: RwLock::new(0),
        }
    }

    /// The instance this handle serves.
    #[must_use]
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Whether this handle is currently considered healthy for this tick.
    pub async fn is_healthy(&self) -> bool {
        *self.health.read().await == HealthState::Healthy
    }

    /// Runs `initialize`, serialized against any concurrent critical-section call, updating
    /// health state on the outcome.
    pub async fn initialize(&self) -> Result<(), AgentClientError> {
        let _guard = self.critical_section.lock().await;
        match self.client.initialize().await {
            Ok(()) => {
                *self.health.write().await = HealthState::Healthy;
                *self.consecutive_failures.write().await = 0;
                Ok(())
            }
            Err(e) => {
                *self.health.write().await = HealthState::Unhealthy;
                *self.consecutive_failures.write().await += 1;
                Err(e)
            }
        }
    }

    /// Runs the periodic health probe, with up to `max_retry` re-initialize attempts if the
    /// probe itself fails, per §4.C.
    pub async fn probe_health(&self, max_retry: u32) -> bool {
        match self.client.health_check().await {
            Ok(true) => {
                *self.health.write().await = HealthState::Healthy;
                *self.consecutive_failures.write().await = 0;
                return true;
            }
            Ok(false) | Err(_) => {}
        }

        for _ in 0..max_retry {
            if self.initialize().await.is_ok() {
                return true;
            }
        }
        *self.health.write().await = HealthState::Unhealthy;
        false
    }

    /// Serializes `add_listener` against `initialize`/`remove_listener` on this instance.
    pub async fn add_listener(&self, chat: &ChatName) -> Result<(), AgentClientError> {
        let _guard = self.critical_section.lock().await;
        self.client.add_listener(chat).await
    }

    /// Serializes `remove_listener` against `initialize`/`add_listener` on this instance.
    pub async fn remove_listener(&self, chat: &ChatName) -> Result<(), AgentClientError> {
        let _guard = self.critical_section.lock().await;
        self.client.remove_listener(chat).await
    }

    /// Read-only calls share the underlying client without the critical-section lock.
    #[must_use]
    pub fn client(&self) -> &Arc<dyn AgentClient> {
        &self.client
    }
}

/// The pool of per-instance agent handles, keyed by [`InstanceId`].
#[derive(Default)]
pub struct AgentClientPool {
    handles: DashMap<InstanceId, Arc<AgentHandle>>,
}

impl AgentClientPool {
    /// Builds an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the handle for an instance.
    pub fn insert(&self, handle: Arc<AgentHandle>) {
        self.handles.insert(handle.instance_id().clone(), handle);
    }

    /// Removes an instance's handle, e.g. when it is disabled or deleted.
    pub fn remove(&self, instance_id: &InstanceId) {
        self.handles.remove(instance_id);
    }

    /// Looks up a handle by instance id.
    #[must_use]
    pub fn get(&self, instance_id: &InstanceId) -> Option<Arc<AgentHandle>> {
        self.handles.get(instance_id).map(|h| Arc::clone(h.value()))
    }

    /// All currently registered instance ids.
    #[must_use]
    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.handles.iter().map(|e| e.key().clone()).collect()
    }
}

/// The agent client pool's idempotent-GET retry policy: bounded exponential backoff, 2x,
/// capped at 30s, at most 3 tries.
#[must_use]
pub fn retry_backoff() -> Backoff {
    Backoff::agent_retry()
}

/// Retries an idempotent GET-style operation up to 3 times with [`retry_backoff`], per §4.C.
/// Only `Unavailable`/`AgentFailure` are retried; other kinds fail fast.
pub async fn retry_idempotent<T, F, Fut>(mut op: F) -> Result<T, AgentClientError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, AgentClientError>>,
{
    const MAX_TRIES: u32 = 3;
    let backoff = retry_backoff();
    let mut last_err = None;
    for attempt in 1..=MAX_TRIES {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.kind().is_retryable() => {
                warn!(attempt, error = %e, "retrying agent call");
                last_err = Some(e);
                if attempt < MAX_TRIES {
                    tokio::time::sleep(backoff.delay_for(attempt)).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.expect("loop always runs at least once"))
}


#[cfg(test)]
mod tests {
    use super::test_support::MockAgentClient;
    use super::*;

    #[test]
    fn classifies_service_codes() {
        assert!(classify_service_code(0, "").is_ok());
        assert!(matches!(
            classify_service_code(1001, "bad key").unwrap_err(),
            AgentClientError::InvalidRequest(_)
        ));
        assert!(matches!(
            classify_service_code(2001, "").unwrap_err(),
            AgentClientError::NotInitialized
        ));
        assert!(matches!(
            classify_service_code(3001, "").unwrap_err(),
            AgentClientError::AgentFailure(_)
        ));
    }

    #[tokio::test]
    async fn handle_tracks_health_across_initialize() {
        let mock = Arc::new(MockAgentClient::default());
        let handle = AgentHandle::new(
            InstanceId::try_from("inst-a".to_string()).unwrap(),
            mock.clone() as Arc<dyn AgentClient>,
        );
        assert!(!handle.is_healthy().await);
        handle.initialize().await.unwrap();
        assert!(handle.is_healthy().await);
    }

    #[tokio::test]
    async fn pool_insert_get_remove_roundtrip() {
        let pool = AgentClientPool::new();
        let id = InstanceId::try_from("inst-b".to_string()).unwrap();
        let mock = Arc::new(MockAgentClient::default());
        let handle = Arc::new(AgentHandle::new(id.clone(), mock));
        pool.insert(handle);
        assert!(pool.get(&id).is_some());
        pool.remove(&id);
        assert!(pool.get(&id).is_none());
    }

    #[tokio::test]
    async fn retry_idempotent_retries_unavailable_then_succeeds() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result = retry_idempotent(|| {
            let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                if n < 1 {
                    Err(AgentClientError::Unavailable("down".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retry_idempotent_does_not_retry_invalid_request() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<(), _> = retry_idempotent(|| {
            attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Err(AgentClientError::InvalidRequest("nope".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
