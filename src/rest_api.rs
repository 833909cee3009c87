//! Component I: the management HTTP surface.
//!
//! CRUD over instances, platforms, and rules; read-only inspection of listeners, messages,
//! and system resources; two WebSocket routes mirroring D's ingest stream and H's
//! delivery-status stream so an operator dashboard can tail activity live. Authentication in
//! front of this surface is an external collaborator (§1) — nothing here checks credentials.
//!
//! Every DTO in this module redacts encrypted fields unconditionally: an [`Instance`]'s
//! `api_key` and a [`PlatformRow`]'s `config` never leave the store's decrypted in-process
//! form through these types.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::agent_client::{AgentClientPool, AgentHandle, HttpAgentClient};
use crate::config::InstanceTunables;
use crate::config_registry::ConfigRegistry;
use crate::domain_types::{
    ChatName, DeliveryStatus, InstanceId, InstanceStatus, MessageEvent, MessageId, MessageType,
    PlatformId, PlatformKind, Priority, RuleId, StatusEvent,
};
use crate::listener_engine::ListenerEngine;
use crate::platform::{PlatformError, PlatformRegistry};
use crate::rule_engine::find_conflicts;
use crate::storage::{
    Instance, InstanceStore, ListenerStore, MessageRow, MessageStore, PlatformRow, PlatformStore,
    RuleRow, RuleStore, StoreError,
};

/// Shared application state the router is mounted against, built once by the service
/// container and cloned per request — every field is an `Arc`, a `Client`, or a channel
/// sender, so cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    /// Component A: instances.
    pub instance_store: Arc<dyn InstanceStore>,
    /// Component A: listeners.
    pub listener_store: Arc<dyn ListenerStore>,
    /// Component E: messages.
    pub message_store: Arc<dyn MessageStore>,
    /// Component A: platforms.
    pub platform_store: Arc<dyn PlatformStore>,
    /// Component A: rules.
    pub rule_store: Arc<dyn RuleStore>,
    /// Component B.
    pub config_registry: Arc<ConfigRegistry>,
    /// Component C.
    pub agent_pool: Arc<AgentClientPool>,
    /// Component D, read for listener inspection.
    pub listener_engine: Arc<ListenerEngine>,
    /// Component G, read/written for platform CRUD.
    pub platform_registry: Arc<PlatformRegistry>,
    /// Shared outbound client, reused when (re)building an [`AgentHandle`] on instance writes.
    pub http_client: Client,
    /// Live-tailing channels for `/ws/messages` and `/ws/status`.
    pub broadcasts: BroadcastChannels,
}

/// The two broadcast channels D and H publish to; subscribed by the WebSocket routes.
#[derive(Clone)]
pub struct BroadcastChannels {
    /// Published by D on every non-duplicate ingest.
    pub message_tx: broadcast::Sender<MessageEvent>,
    /// Published by H on every delivery-status transition.
    pub status_tx: broadcast::Sender<StatusEvent>,
}

/// Errors the management surface maps to stable HTTP status codes (§7).
#[derive(Debug)]
pub enum ApiError {
    /// The requested entity does not exist. Maps to `404`.
    NotFound(String),
    /// The request body or path failed validation. Maps to `400`.
    BadRequest(String),
    /// The request would create a duplicate of an existing entity. Maps to `409`.
    Conflict(String),
    /// A dependency (store, agent, platform) could not be reached. Maps to `503`.
    Unavailable(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => Self::NotFound(msg),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

impl From<PlatformError> for ApiError {
    fn from(err: PlatformError) -> Self {
        match err.kind() {
            crate::domain_types::ErrorKind::InvalidRequest => Self::BadRequest(err.to_string()),
            _ => Self::Unavailable(err.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            Self::Conflict(m) => (StatusCode::CONFLICT, m),
            Self::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

fn parse_instance_id(raw: &str) -> Result<InstanceId, ApiError> {
    InstanceId::try_from(raw.to_string())
        .map_err(|_| ApiError::BadRequest(format!("invalid instance id: {raw}")))
}

fn parse_chat_name(raw: &str) -> Result<ChatName, ApiError> {
    ChatName::try_from(raw.to_string())
        .map_err(|_| ApiError::BadRequest(format!("invalid chat name: {raw}")))
}

fn parse_platform_id(raw: &str) -> Result<PlatformId, ApiError> {
    Uuid::parse_str(raw)
        .map(PlatformId::from)
        .map_err(|e| ApiError::BadRequest(format!("invalid platform id: {e}")))
}

fn parse_rule_id(raw: &str) -> Result<RuleId, ApiError> {
    Uuid::parse_str(raw)
        .map(RuleId::from)
        .map_err(|e| ApiError::BadRequest(format!("invalid rule id: {e}")))
}

fn default_true() -> bool {
    true
}

fn default_instance_scope() -> String {
    "*".to_string()
}

fn default_message_limit() -> u32 {
    100
}

// ---------------------------------------------------------------------------------------
// Instances
// ---------------------------------------------------------------------------------------

/// Redacted instance view; `api_key` never appears here (§9's redaction requirement).
#[derive(Debug, Serialize)]
pub struct InstanceDto {
    instance_id: InstanceId,
    name: String,
    base_url: String,
    enabled: bool,
    status: InstanceStatus,
    last_active_ts: Option<i64>,
    last_error: Option<String>,
    tunables: InstanceTunables,
    healthy: bool,
}

async fn instance_dto(state: &AppState, instance: &Instance) -> InstanceDto {
    let healthy = match state.agent_pool.get(&instance.instance_id) {
        Some(handle) => handle.is_healthy().await,
        None => false,
    };
    InstanceDto {
        instance_id: instance.instance_id.clone(),
        name: instance.name.clone(),
        base_url: instance.base_url.clone(),
        enabled: instance.enabled,
        status: instance.status,
        last_active_ts: instance.last_active_ts,
        last_error: instance.last_error.clone(),
        tunables: instance.tunables,
        healthy,
    }
}

/// Body accepted to create or replace an instance.
#[derive(Debug, Deserialize)]
pub struct InstanceRequest {
    name: String,
    base_url: String,
    api_key: String,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    tunables: Option<InstanceTunables>,
}

/// Body accepted by `POST /api/instances`, which carries the id in the payload rather than
/// the path.
#[derive(Debug, Deserialize)]
pub struct CreateInstanceRequest {
    instance_id: String,
    #[serde(flatten)]
    fields: InstanceRequest,
}

/// Registers or drops the in-memory agent handle so the pool mirrors the instance's current
/// `enabled`/credentials without waiting for the next process restart.
fn sync_agent_handle(state: &AppState, instance: &Instance) {
    if instance.enabled {
        let client = HttpAgentClient::new(
            state.http_client.clone(),
            instance.instance_id.clone(),
            instance.base_url.clone(),
            instance.api_key.clone(),
        );
        let handle = Arc::new(AgentHandle::new(instance.instance_id.clone(), Arc::new(client)));
        state.agent_pool.insert(handle);
    } else {
        state.agent_pool.remove(&instance.instance_id);
    }
}

async fn apply_instance_upsert(
    state: &AppState,
    instance_id: InstanceId,
    req: InstanceRequest,
) -> Result<Instance, ApiError> {
    let existing = state.instance_store.get(&instance_id).await?;
    let row = Instance {
        instance_id,
        name: req.name,
        base_url: req.base_url,
        api_key: req.api_key,
        enabled: req.enabled,
        status: existing.as_ref().map_or(InstanceStatus::Initializing, |e| e.status),
        last_active_ts: existing.as_ref().and_then(|e| e.last_active_ts),
        tunables: req.tunables.unwrap_or_default(),
        last_error: existing.and_then(|e| e.last_error),
    };
    state.instance_store.upsert(&row).await?;
    sync_agent_handle(state, &row);
    state.config_registry.notify_changed();
    Ok(row)
}

async fn list_instances(State(state): State<AppState>) -> Result<Json<Vec<InstanceDto>>, ApiError> {
    let rows = state.instance_store.list().await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        out.push(instance_dto(&state, row).await);
    }
    Ok(Json(out))
}

async fn create_instance(
    State(state): State<AppState>,
    Json(req): Json<CreateInstanceRequest>,
) -> Result<Json<InstanceDto>, ApiError> {
    let instance_id = parse_instance_id(&req.instance_id)?;
    if state.instance_store.get(&instance_id).await?.is_some() {
        return Err(ApiError::Conflict(format!("instance {instance_id} already exists")));
    }
    let row = apply_instance_upsert(&state, instance_id, req.fields).await?;
    Ok(Json(instance_dto(&state, &row).await))
}

async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<InstanceDto>, ApiError> {
    let instance_id = parse_instance_id(&id)?;
    let row = state
        .instance_store
        .get(&instance_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("instance {id} not found")))?;
    Ok(Json(instance_dto(&state, &row).await))
}

async fn put_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<InstanceRequest>,
) -> Result<Json<InstanceDto>, ApiError> {
    let instance_id = parse_instance_id(&id)?;
    let row = apply_instance_upsert(&state, instance_id, req).await?;
    Ok(Json(instance_dto(&state, &row).await))
}

async fn delete_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let instance_id = parse_instance_id(&id)?;
    state.instance_store.delete(&instance_id).await?;
    state.agent_pool.remove(&instance_id);
    state.config_registry.notify_changed();
    Ok(StatusCode::NO_CONTENT)
}

async fn set_instance_enabled(
    state: &AppState,
    id: &str,
    enabled: bool,
) -> Result<Json<InstanceDto>, ApiError> {
    let instance_id = parse_instance_id(id)?;
    state.instance_store.set_enabled(&instance_id, enabled).await?;
    let row = state
        .instance_store
        .get(&instance_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("instance {id} not found")))?;
    sync_agent_handle(state, &row);
    state.config_registry.notify_changed();
    Ok(Json(instance_dto(state, &row).await))
}

async fn enable_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<InstanceDto>, ApiError> {
    set_instance_enabled(&state, &id, true).await
}

async fn disable_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<InstanceDto>, ApiError> {
    set_instance_enabled(&state, &id, false).await
}

// ---------------------------------------------------------------------------------------
// Platforms
// ---------------------------------------------------------------------------------------

/// Redacted platform view; `config` is never echoed back since it may hold an `api_key`.
#[derive(Debug, Serialize)]
pub struct PlatformDto {
    platform_id: PlatformId,
    name: String,
    kind: PlatformKind,
    enabled: bool,
}

fn platform_dto(row: &PlatformRow) -> PlatformDto {
    PlatformDto {
        platform_id: row.platform_id,
        name: row.name.clone(),
        kind: row.kind,
        enabled: row.enabled,
    }
}

/// Body accepted to create or replace a platform. `config`'s recognized keys are fixed by
/// `kind` (§4.G).
#[derive(Debug, Deserialize)]
pub struct PlatformRequest {
    name: String,
    kind: PlatformKind,
    #[serde(default)]
    config: serde_json::Value,
    #[serde(default = "default_true")]
    enabled: bool,
}

fn rebuild_platform_entry(state: &AppState, row: &PlatformRow) {
    if row.enabled {
        if let Err(e) = state.platform_registry.upsert(row.platform_id, row.kind, &row.config) {
            tracing::warn!(platform_id = %row.platform_id, error = %e, "rejected platform config");
        }
    } else {
        state.platform_registry.remove(&row.platform_id);
    }
}

async fn list_platforms(State(state): State<AppState>) -> Result<Json<Vec<PlatformDto>>, ApiError> {
    let rows = state.platform_store.list().await?;
    Ok(Json(rows.iter().map(platform_dto).collect()))
}

async fn create_platform(
    State(state): State<AppState>,
    Json(req): Json<PlatformRequest>,
) -> Result<Json<PlatformDto>, ApiError> {
    let row = PlatformRow {
        platform_id: PlatformId::generate(),
        name: req.name,
        kind: req.kind,
        config: req.config,
        enabled: req.enabled,
    };
    state.platform_store.upsert(&row).await?;
    rebuild_platform_entry(&state, &row);
    state.config_registry.notify_changed();
    Ok(Json(platform_dto(&row)))
}

async fn update_platform(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PlatformRequest>,
) -> Result<Json<PlatformDto>, ApiError> {
    let platform_id = parse_platform_id(&id)?;
    let row = PlatformRow {
        platform_id,
        name: req.name,
        kind: req.kind,
        config: req.config,
        enabled: req.enabled,
    };
    state.platform_store.upsert(&row).await?;
    rebuild_platform_entry(&state, &row);
    state.config_registry.notify_changed();
    Ok(Json(platform_dto(&row)))
}

async fn delete_platform(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let platform_id = parse_platform_id(&id)?;
    state.platform_store.delete(&platform_id).await?;
    state.platform_registry.remove(&platform_id);
    state.config_registry.notify_changed();
    Ok(StatusCode::NO_CONTENT)
}

async fn test_platform(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let platform_id = parse_platform_id(&id)?;
    let row = state
        .platform_store
        .get(&platform_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("platform {id} not found")))?;
    state.platform_registry.test_config(row.kind, &row.config).await?;
    Ok(StatusCode::OK)
}

// ---------------------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------------------

/// A rule exactly as stored; nothing in a rule row is secret.
#[derive(Debug, Serialize)]
pub struct RuleDto {
    rule_id: RuleId,
    name: String,
    instance_scope: String,
    chat_pattern: String,
    platform_id: PlatformId,
    priority: Priority,
    enabled: bool,
    only_at_messages: bool,
}

fn rule_dto(row: &RuleRow) -> RuleDto {
    RuleDto {
        rule_id: row.rule_id,
        name: row.name.clone(),
        instance_scope: row.instance_scope.clone(),
        chat_pattern: row.chat_pattern.clone(),
        platform_id: row.platform_id,
        priority: row.priority,
        enabled: row.enabled,
        only_at_messages: row.only_at_messages,
    }
}

/// Body accepted to create or replace a rule.
#[derive(Debug, Deserialize)]
pub struct RuleRequest {
    name: String,
    #[serde(default = "default_instance_scope")]
    instance_scope: String,
    chat_pattern: String,
    platform_id: PlatformId,
    #[serde(default)]
    priority: Priority,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    only_at_messages: bool,
}

async fn list_rules(State(state): State<AppState>) -> Result<Json<Vec<RuleDto>>, ApiError> {
    let rows = state.rule_store.list_all().await?;
    Ok(Json(rows.iter().map(rule_dto).collect()))
}

async fn create_rule(
    State(state): State<AppState>,
    Json(req): Json<RuleRequest>,
) -> Result<Json<RuleDto>, ApiError> {
    let row = RuleRow {
        rule_id: RuleId::generate(),
        name: req.name,
        instance_scope: req.instance_scope,
        chat_pattern: req.chat_pattern,
        platform_id: req.platform_id,
        priority: req.priority,
        enabled: req.enabled,
        only_at_messages: req.only_at_messages,
    };
    warn_on_conflicts(&state, &row).await;
    state.rule_store.upsert(&row).await?;
    state.config_registry.notify_changed();
    Ok(Json(rule_dto(&row)))
}

/// Conservative conflict check run at rule-creation/update time: logs a warning when
/// `candidate` shares a scope and could match the same chat name as another enabled rule, but
/// never refuses the write — treated as operator guidance rather than a hard rejection.
async fn warn_on_conflicts(state: &AppState, candidate: &RuleRow) {
    let existing = match state.rule_store.list_enabled().await {
        Ok(rows) => rows,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load rules for conflict check");
            return;
        }
    };
    let conflicts = find_conflicts(&existing, candidate);
    if !conflicts.is_empty() {
        tracing::warn!(
            rule_id = %candidate.rule_id,
            chat_pattern = %candidate.chat_pattern,
            conflicting_rule_ids = ?conflicts,
            "rule potentially conflicts with existing enabled rules"
        );
    }
}

async fn update_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RuleRequest>,
) -> Result<Json<RuleDto>, ApiError> {
    let rule_id = parse_rule_id(&id)?;
    let row = RuleRow {
        rule_id,
        name: req.name,
        instance_scope: req.instance_scope,
        chat_pattern: req.chat_pattern,
        platform_id: req.platform_id,
        priority: req.priority,
        enabled: req.enabled,
        only_at_messages: req.only_at_messages,
    };
    warn_on_conflicts(&state, &row).await;
    state.rule_store.upsert(&row).await?;
    state.config_registry.notify_changed();
    Ok(Json(rule_dto(&row)))
}

async fn delete_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let rule_id = parse_rule_id(&id)?;
    state.rule_store.delete(&rule_id).await?;
    state.config_registry.notify_changed();
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------------------
// Listeners (read-only inspection)
// ---------------------------------------------------------------------------------------

/// A listener exactly as D tracks it in memory.
#[derive(Debug, Serialize)]
pub struct ListenerDto {
    instance_id: InstanceId,
    chat_name: ChatName,
    added_ts: i64,
    last_message_ts: i64,
    marked_for_removal: bool,
    manual: bool,
    conversation_started: bool,
    fixed: bool,
}

async fn list_listeners(State(state): State<AppState>) -> Json<Vec<ListenerDto>> {
    let snapshot = state.listener_engine.snapshot();
    Json(
        snapshot
            .into_iter()
            .map(|(instance_id, chat_name, s)| ListenerDto {
                instance_id,
                chat_name,
                added_ts: s.added_ts,
                last_message_ts: s.last_message_ts,
                marked_for_removal: s.marked_for_removal,
                manual: s.manual,
                conversation_started: s.conversation_started,
                fixed: s.fixed,
            })
            .collect(),
    )
}

// ---------------------------------------------------------------------------------------
// Messages (read-only query)
// ---------------------------------------------------------------------------------------

/// A message exactly as E stores it; nothing here is secret.
#[derive(Debug, Serialize)]
pub struct MessageDto {
    message_id: MessageId,
    instance_id: InstanceId,
    chat_name: ChatName,
    sender: String,
    sender_remark: Option<String>,
    content: String,
    mtype: MessageType,
    local_file_path: Option<String>,
    received_ts: i64,
    delivery_status: DeliveryStatus,
    delivery_attempts: u32,
    reply_content: Option<String>,
    reply_status: Option<String>,
}

fn message_dto(row: &MessageRow) -> MessageDto {
    MessageDto {
        message_id: row.message_id,
        instance_id: row.instance_id.clone(),
        chat_name: row.chat_name.clone(),
        sender: row.sender.clone(),
        sender_remark: row.sender_remark.clone(),
        content: row.content.clone(),
        mtype: row.mtype,
        local_file_path: row.local_file_path.clone(),
        received_ts: row.received_ts,
        delivery_status: row.delivery_status,
        delivery_attempts: row.delivery_attempts,
        reply_content: row.reply_content.clone(),
        reply_status: row.reply_status.clone(),
    }
}

/// Query parameters for `GET /api/messages`.
#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    instance_id: Option<String>,
    chat: Option<String>,
    since: Option<i64>,
    #[serde(default = "default_message_limit")]
    limit: u32,
}

async fn list_messages(
    State(state): State<AppState>,
    Query(q): Query<MessageQuery>,
) -> Result<Json<Vec<MessageDto>>, ApiError> {
    let instance_id = q.instance_id.as_deref().map(parse_instance_id).transpose()?;
    let chat_name = q.chat.as_deref().map(parse_chat_name).transpose()?;
    let rows = state
        .message_store
        .query(instance_id.as_ref(), chat_name.as_ref(), q.since, q.limit)
        .await?;
    Ok(Json(rows.iter().map(message_dto).collect()))
}

// ---------------------------------------------------------------------------------------
// System resources
// ---------------------------------------------------------------------------------------

/// A coarse point-in-time snapshot of the process's managed entity counts, per §4.I.
#[derive(Debug, Serialize)]
pub struct SystemResourcesDto {
    instance_count: usize,
    enabled_instance_count: usize,
    active_listener_count: usize,
    pending_message_count: u32,
    platform_count: usize,
    rule_count: usize,
}

async fn system_resources(State(state): State<AppState>) -> Result<Json<SystemResourcesDto>, ApiError> {
    let instances = state.instance_store.list().await?;
    let enabled_instance_count = instances.iter().filter(|i| i.enabled).count();
    let active_listener_count = state.listener_engine.snapshot().len();
    let pending_message_count = state.message_store.count_pending().await?;
    let platform_count = state.platform_store.list().await?.len();
    let rule_count = state.rule_store.list_all().await?.len();
    Ok(Json(SystemResourcesDto {
        instance_count: instances.len(),
        enabled_instance_count,
        active_listener_count,
        pending_message_count,
        platform_count,
        rule_count,
    }))
}

// ---------------------------------------------------------------------------------------
// Live tailing (§6 push channel)
// ---------------------------------------------------------------------------------------

async fn ws_messages(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let rx = state.broadcasts.message_tx.subscribe();
    ws.on_upgrade(move |socket| forward_broadcast(socket, rx))
}

async fn ws_status(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let rx = state.broadcasts.status_tx.subscribe();
    ws.on_upgrade(move |socket| forward_broadcast(socket, rx))
}

/// Drains `rx` onto `socket` as JSON text frames until the client disconnects or the channel
/// closes. A lagged receiver skips the missed events and keeps streaming rather than closing
/// the connection, since this is a best-effort tail, not a delivery guarantee.
async fn forward_broadcast<T>(mut socket: WebSocket, mut rx: broadcast::Receiver<T>)
where
    T: Serialize + Clone + Send + 'static,
{
    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        let Ok(payload) = serde_json::to_string(&event) else { continue };
                        if socket.send(WsMessage::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                if incoming.is_none() {
                    break;
                }
            }
        }
    }
}

/// Builds the management HTTP router over `state`, per §4.I/§6.
#[must_use]
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/api/instances", get(list_instances).post(create_instance))
        .route(
            "/api/instances/{id}",
            get(get_instance).put(put_instance).delete(delete_instance),
        )
        .route("/api/instances/{id}/enable", post(enable_instance))
        .route("/api/instances/{id}/disable", post(disable_instance))
        .route("/api/platforms", get(list_platforms).post(create_platform))
        .route(
            "/api/platforms/{id}",
            put(update_platform).delete(delete_platform),
        )
        .route("/api/platforms/{id}/test", post(test_platform))
        .route("/api/rules", get(list_rules).post(create_rule))
        .route("/api/rules/{id}", put(update_rule).delete(delete_rule))
        .route("/api/messages", get(list_messages))
        .route("/api/listeners", get(list_listeners))
        .route("/api/system/resources", get(system_resources))
        .route("/ws/messages", get(ws_messages))
        .route("/ws/status", get(ws_status))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_client::AgentClientPool;
    use crate::listener_engine::ListenerEngine;
    use crate::platform::PlatformRegistry;
    use crate::storage::test_utils::{
        InMemoryConfigStore, InMemoryInstanceStore, InMemoryListenerStore, InMemoryMessageStore,
        InMemoryPlatformStore, InMemoryRuleStore,
    };
    use tokio::sync::Notify;

    fn test_state() -> AppState {
        let instance_store: Arc<dyn InstanceStore> = Arc::new(InMemoryInstanceStore::default());
        let listener_store: Arc<dyn ListenerStore> = Arc::new(InMemoryListenerStore::default());
        let message_store: Arc<dyn MessageStore> = Arc::new(InMemoryMessageStore::default());
        let platform_store: Arc<dyn PlatformStore> = Arc::new(InMemoryPlatformStore::default());
        let rule_store: Arc<dyn RuleStore> = Arc::new(InMemoryRuleStore::default());
        let config_store: Arc<dyn crate::storage::ConfigStore> =
            Arc::new(InMemoryConfigStore::default());
        let config_registry = Arc::new(ConfigRegistry::new(config_store));
        let agent_pool = Arc::new(AgentClientPool::new());
        let http_client = Client::new();
        let new_message = Arc::new(Notify::new());
        let (message_tx, _) = broadcast::channel(16);
        let (status_tx, _) = broadcast::channel(16);
        let listener_engine = Arc::new(ListenerEngine::new(
            Arc::clone(&agent_pool),
            Arc::clone(&instance_store),
            Arc::clone(&listener_store),
            Arc::clone(&message_store),
            Arc::clone(&new_message),
            message_tx.clone(),
        ));
        let platform_registry = Arc::new(PlatformRegistry::new(http_client.clone()));
        AppState {
            instance_store,
            listener_store,
            message_store,
            platform_store,
            rule_store,
            config_registry,
            agent_pool,
            listener_engine,
            platform_registry,
            http_client,
            broadcasts: BroadcastChannels { message_tx, status_tx },
        }
    }

    fn instance_request(base_url: &str) -> InstanceRequest {
        InstanceRequest {
            name: "demo".to_string(),
            base_url: base_url.to_string(),
            api_key: "secret".to_string(),
            enabled: true,
            tunables: None,
        }
    }

    #[tokio::test]
    async fn create_then_get_instance_roundtrips() {
        let state = test_state();
        let create = CreateInstanceRequest {
            instance_id: "inst-a".to_string(),
            fields: instance_request("http://localhost:9000"),
        };
        let created = create_instance(State(state.clone()), Json(create)).await.unwrap();
        assert_eq!(created.0.name, "demo");

        let fetched = get_instance(State(state), Path("inst-a".to_string())).await.unwrap();
        assert_eq!(fetched.0.base_url, "http://localhost:9000");
    }

    #[tokio::test]
    async fn create_instance_with_existing_id_is_conflict() {
        let state = test_state();
        let create = CreateInstanceRequest {
            instance_id: "inst-dup".to_string(),
            fields: instance_request("http://localhost:9003"),
        };
        create_instance(State(state.clone()), Json(create)).await.unwrap();

        let duplicate = CreateInstanceRequest {
            instance_id: "inst-dup".to_string(),
            fields: instance_request("http://localhost:9004"),
        };
        let err = create_instance(State(state), Json(duplicate)).await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[tokio::test]
    async fn get_missing_instance_is_not_found() {
        let state = test_state();
        let err = get_instance(State(state), Path("missing".to_string())).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn disabling_instance_drops_its_agent_handle() {
        let state = test_state();
        let create = CreateInstanceRequest {
            instance_id: "inst-b".to_string(),
            fields: instance_request("http://localhost:9001"),
        };
        create_instance(State(state.clone()), Json(create)).await.unwrap();
        let id = parse_instance_id("inst-b").unwrap();
        assert!(state.agent_pool.get(&id).is_some());

        disable_instance(State(state.clone()), Path("inst-b".to_string())).await.unwrap();
        assert!(state.agent_pool.get(&id).is_none());
    }

    #[tokio::test]
    async fn create_rule_then_list_includes_it() {
        let state = test_state();
        let platform = create_platform(
            State(state.clone()),
            Json(PlatformRequest {
                name: "kw".to_string(),
                kind: PlatformKind::Keyword,
                config: serde_json::json!({"rules": []}),
                enabled: true,
            }),
        )
        .await
        .unwrap();

        create_rule(
            State(state.clone()),
            Json(RuleRequest {
                name: "default".to_string(),
                instance_scope: "*".to_string(),
                chat_pattern: "*".to_string(),
                platform_id: platform.0.platform_id,
                priority: Priority::default(),
                enabled: true,
                only_at_messages: false,
            }),
        )
        .await
        .unwrap();

        let rules = list_rules(State(state)).await.unwrap().0;
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].chat_pattern, "*");
    }

    #[tokio::test]
    async fn deleting_platform_removes_registry_entry() {
        let state = test_state();
        let platform = create_platform(
            State(state.clone()),
            Json(PlatformRequest {
                name: "kw".to_string(),
                kind: PlatformKind::Keyword,
                config: serde_json::json!({"rules": []}),
                enabled: true,
            }),
        )
        .await
        .unwrap();
        assert!(state.platform_registry.get(&platform.0.platform_id).is_some());

        delete_platform(State(state.clone()), Path(platform.0.platform_id.to_string()))
            .await
            .unwrap();
        assert!(state.platform_registry.get(&platform.0.platform_id).is_none());
    }

    #[tokio::test]
    async fn system_resources_reports_current_counts() {
        let state = test_state();
        create_instance(
            State(state.clone()),
            Json(CreateInstanceRequest {
                instance_id: "inst-c".to_string(),
                fields: instance_request("http://localhost:9002"),
            }),
        )
        .await
        .unwrap();

        let resources = system_resources(State(state)).await.unwrap().0;
        assert_eq!(resources.instance_count, 1);
        assert_eq!(resources.enabled_instance_count, 1);
    }
}
