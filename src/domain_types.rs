//! Strongly-typed domain values shared across the crate.
//!
//! Identifiers and bounded tunables are wrapped in `nutype`-validated newtypes so that
//! illegal states (an empty instance id, a zero poll interval) are unrepresentable once
//! constructed, rather than re-checked at every call site.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier for a federated agent instance (primary key in the `instances` table).
#[nutype(
    validate(len_char_min = 1, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        AsRef
    )
)]
pub struct InstanceId(String);

/// Human-readable display name for an instance.
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Display, TryFrom)
)]
pub struct InstanceName(String);

/// Base URL of an agent's HTTP API.
#[nutype(
    validate(len_char_min = 1, len_char_max = 2048),
    derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Display, TryFrom, AsRef)
)]
pub struct BaseUrl(String);

/// Name of a chat target as reported by an agent (a group name, contact name, etc).
#[nutype(
    validate(len_char_min = 1, len_char_max = 512),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        AsRef
    )
)]
pub struct ChatName(String);

/// Unique identifier for a locally-assigned message row.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new random message id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for a delivery attempt ledger row.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct AttemptId(Uuid);

impl AttemptId {
    /// Creates a new random attempt id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Stable identifier for a routing rule.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct RuleId(Uuid);

impl RuleId {
    /// Creates a new random rule id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Stable identifier for a configured platform target.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct PlatformId(Uuid);

impl PlatformId {
    /// Creates a new random platform id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Poll interval, in seconds, for an instance's L1/L2 loops. Default 5s.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 3600),
    default = 5,
    derive(
        Debug,
        Default,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize
    )
)]
pub struct PollIntervalSecs(u32);

/// Maximum number of concurrently active listeners per instance. Default 30.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10_000),
    default = 30,
    derive(
        Debug,
        Default,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize
    )
)]
pub struct MaxListeners(u32);

/// Seconds of inactivity before a non-pinned, non-manual listener is evicted. Default 1800.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 604_800),
    default = 1800,
    derive(
        Debug,
        Default,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize
    )
)]
pub struct ListenerIdleTimeoutSecs(u32);

/// Interval, in seconds, between L3 cleanup sweeps. Default 60.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 86_400),
    default = 60,
    derive(
        Debug,
        Default,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize
    )
)]
pub struct CleanupIntervalSecs(u32);

/// Interval, in seconds, between health probes of an instance. Default 60.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 86_400),
    default = 60,
    derive(
        Debug,
        Default,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize
    )
)]
pub struct HealthCheckIntervalSecs(u32);

/// Maximum re-initialize attempts per health interval. Default 3.
#[nutype(
    validate(greater_or_equal = 0, less_or_equal = 100),
    default = 3,
    derive(
        Debug,
        Default,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize
    )
)]
pub struct MaxRetry(u32);

/// Rule priority; higher values win ties before specificity is consulted. Default 0.
#[nutype(
    default = 0,
    derive(
        Debug,
        Default,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize
    )
)]
pub struct Priority(i32);

/// Number of concurrent delivery workers. Default 4.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 256),
    default = 4,
    derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)
)]
pub struct WorkerCount(u32);

/// Maximum delivery attempts before a message is terminally failed. Default 3.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    default = 3,
    derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)
)]
pub struct DeliveryMaxAttempts(u32);

/// Pending-queue depth above which L1/L2 slow their tick rate. Default 1000.
#[nutype(
    validate(greater_or_equal = 1),
    default = 1000,
    derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)
)]
pub struct HighWatermark(u32);

/// Sqlite connection pool size. Default 10.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    default = 10,
    derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)
)]
pub struct ConnectionPoolSize(u32);

impl ConnectionPoolSize {
    /// Returns the pool size as `u32`, the unit `sqlx::pool::PoolOptions` expects.
    #[must_use]
    pub fn as_u32(self) -> u32 {
        self.into_inner()
    }
}

/// Lifecycle status of a federated instance, tracked by the management surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceStatus {
    /// Initial state before the first successful `initialize` call.
    Initializing,
    /// Healthy and reachable.
    Online,
    /// Disabled by configuration or unreachable but not yet marked in error.
    Offline,
    /// Health checks or calls have been failing.
    Error,
    /// Administratively disabled; loops skip it entirely.
    Disabled,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initializing => "INITIALIZING",
            Self::Online => "ONLINE",
            Self::Offline => "OFFLINE",
            Self::Error => "ERROR",
            Self::Disabled => "DISABLED",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INITIALIZING" => Ok(Self::Initializing),
            "ONLINE" => Ok(Self::Online),
            "OFFLINE" => Ok(Self::Offline),
            "ERROR" => Ok(Self::Error),
            "DISABLED" => Ok(Self::Disabled),
            other => Err(format!("unknown instance status: {other}")),
        }
    }
}

/// Content kind of an ingested message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Plain text.
    Text,
    /// An image attachment.
    Image,
    /// An arbitrary file attachment.
    File,
    /// A voice recording.
    Voice,
    /// A video attachment.
    Video,
    /// A system-generated notification (never routed for delivery).
    System,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
            Self::Voice => "voice",
            Self::Video => "video",
            Self::System => "system",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "file" => Ok(Self::File),
            "voice" => Ok(Self::Voice),
            "video" => Ok(Self::Video),
            "system" => Ok(Self::System),
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

/// Delivery lifecycle of a message through the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliveryStatus {
    /// Awaiting a worker claim.
    Pending,
    /// Claimed by a worker, in flight.
    Delivering,
    /// Terminal success.
    Delivered,
    /// Terminal failure after exhausting retries, or a non-retryable error.
    Failed,
    /// Intentionally not routed (no matching rule, system/self message).
    Skipped,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Delivering => "DELIVERING",
            Self::Delivered => "DELIVERED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "DELIVERING" => Ok(Self::Delivering),
            "DELIVERED" => Ok(Self::Delivered),
            "FAILED" => Ok(Self::Failed),
            "SKIPPED" => Ok(Self::Skipped),
            other => Err(format!("unknown delivery status: {other}")),
        }
    }
}

/// The kind of a configured platform target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformKind {
    /// Dify conversation-aware chat completion.
    Dify,
    /// An OpenAI-compatible `chat/completions` endpoint.
    OpenAi,
    /// Local keyword matching, no network call.
    Keyword,
}

impl std::fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Dify => "dify",
            Self::OpenAi => "openai",
            Self::Keyword => "keyword",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for PlatformKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dify" => Ok(Self::Dify),
            "openai" => Ok(Self::OpenAi),
            "keyword" => Ok(Self::Keyword),
            other => Err(format!("unknown platform kind: {other}")),
        }
    }
}

/// Broadcast to `/ws/messages` subscribers whenever D ingests a new, non-duplicate message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEvent {
    /// The persisted message's id.
    pub message_id: MessageId,
    /// Owning instance.
    pub instance_id: InstanceId,
    /// Chat the message arrived in.
    pub chat_name: ChatName,
    /// Sender handle.
    pub sender: String,
    /// Message body.
    pub content: String,
    /// Content kind.
    pub mtype: MessageType,
    /// When the message was received.
    pub received_ts: i64,
}

/// Broadcast to `/ws/status` subscribers whenever H transitions a message's delivery status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    /// The message whose delivery status changed.
    pub message_id: MessageId,
    /// Owning instance.
    pub instance_id: InstanceId,
    /// Chat the message belongs to.
    pub chat_name: ChatName,
    /// The status transitioned to.
    pub delivery_status: DeliveryStatus,
    /// A short human-readable reason, where the transition carries one (e.g. a skip reason).
    pub detail: Option<String>,
}

/// A classification every module's error enum can be asked for, so the dispatcher's
/// retry/terminal logic and the HTTP surface's status-code mapping share one source of truth
/// instead of re-deriving it from the concrete error type at each call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network/timeout; retryable.
    Unavailable,
    /// Agent returned 5xx or a non-zero service code; retryable with backoff.
    AgentFailure,
    /// 4xx or validation failure; terminal for that attempt.
    InvalidRequest,
    /// Agent not ready; triggers re-initialize then retry.
    NotInitialized,
    /// Platform call failed; retryable or terminal per subcode.
    PlatformError,
    /// Persistence failed.
    StoreError,
    /// Missing or invalid configuration; operation refused.
    ConfigError,
    /// Propagated cancellation; never counted as an error.
    Cancelled,
}

impl ErrorKind {
    /// Whether an operation that failed with this kind should be retried.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Unavailable | Self::AgentFailure | Self::NotInitialized | Self::StoreError
        )
    }
}
