//! Component G: the platform registry.
//!
//! A tagged-variant collection, not a `Box<dyn Trait>` registry: §9 fixes the set of platform
//! kinds (Dify, OpenAI-compatible, keyword-match), so new kinds are added by extending
//! [`Platform`] and [`PlatformRegistry::build`], not by loading code at runtime. Each variant
//! implements the same `process_message`/`test_connection` contract as inherent methods.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use reqwest::Client;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::instrument;

use crate::domain_types::{ChatName, ErrorKind, InstanceId, MessageType, PlatformId, PlatformKind};

/// Default per-platform call timeout, per §4.H.
pub const PLATFORM_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Failures from invoking or configuring a platform.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// The platform's config map was missing a required key or had the wrong shape.
    #[error("invalid platform config: {0}")]
    InvalidConfig(String),
    /// Network/timeout failure reaching the platform.
    #[error("platform unavailable: {0}")]
    Unavailable(String),
    /// The platform returned a 4xx-equivalent error.
    #[error("platform rejected request: {0}")]
    Rejected(String),
    /// The platform returned a 5xx-equivalent error.
    #[error("platform failed: {0}")]
    Failed(String),
}

impl PlatformError {
    /// Maps this error onto the shared retry/terminal classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfig(_) | Self::Rejected(_) => ErrorKind::InvalidRequest,
            Self::Unavailable(_) | Self::Failed(_) => ErrorKind::PlatformError,
        }
    }
}

/// The message a platform is asked to respond to, per §4.G's envelope.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Message body.
    pub content: String,
    /// Sender handle.
    pub sender: String,
    /// Chat the message arrived in.
    pub chat_name: ChatName,
    /// Owning instance.
    pub instance_id: InstanceId,
    /// Content kind.
    pub mtype: MessageType,
    /// Local paths of any attachments (images primarily, for Dify).
    pub attachments: Vec<String>,
}

/// A platform's answer to one [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Send this text back, optionally @-mentioning the given handles.
    Text {
        /// Reply body.
        text: String,
        /// Handles to @-mention, if the platform indicated any.
        at_list: Vec<String>,
    },
    /// The platform explicitly declined to reply.
    NoReply,
}

/// Dify conversation-aware chat completion, per §6 downstream.
pub struct DifyPlatform {
    client: Client,
    base_url: String,
    api_key: String,
    conversation_id: std::sync::Mutex<Option<String>>,
}

impl DifyPlatform {
    fn from_config(client: Client, config: &Value) -> Result<Self, PlatformError> {
        let base_url = required_str(config, "base_url")?;
        let api_key = required_str(config, "api_key")?;
        let conversation_id = config
            .get("conversation_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(Self {
            client,
            base_url,
            api_key,
            conversation_id: std::sync::Mutex::new(conversation_id),
        })
    }

    #[instrument(skip(self, envelope), err)]
    async fn process_message(&self, envelope: &Envelope) -> Result<Reply, PlatformError> {
        let conversation_id = self.conversation_id.lock().unwrap().clone().unwrap_or_default();
        let body = json!({
            "inputs": {},
            "query": envelope.content,
            "user": envelope.sender,
            "conversation_id": conversation_id,
            "response_mode": "blocking",
            "files": envelope
                .attachments
                .iter()
                .map(|path| json!({"type": "image", "transfer_method": "local_file", "url": path}))
                .collect::<Vec<_>>(),
        });

        let response = send_json(
            &self.client,
            self.client
                .post(format!("{}/chat-messages", self.base_url.trim_end_matches('/')))
                .bearer_auth(&self.api_key)
                .json(&body),
        )
        .await?;

        if let Some(new_id) = response.get("conversation_id").and_then(Value::as_str) {
            *self.conversation_id.lock().unwrap() = Some(new_id.to_string());
        }

        let answer = response
            .get("answer")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if answer.is_empty() {
            return Ok(Reply::NoReply);
        }
        Ok(Reply::Text {
            text: answer,
            at_list: Vec::new(),
        })
    }

    #[instrument(skip(self), err)]
    async fn test_connection(&self) -> Result<(), PlatformError> {
        send_json(
            &self.client,
            self.client
                .get(format!("{}/parameters", self.base_url.trim_end_matches('/')))
                .bearer_auth(&self.api_key),
        )
        .await?;
        Ok(())
    }
}

/// An OpenAI-compatible `chat/completions` endpoint, per §6 downstream.
pub struct OpenAiPlatform {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    system_prompt: Option<String>,
}

impl OpenAiPlatform {
    fn from_config(client: Client, config: &Value) -> Result<Self, PlatformError> {
        Ok(Self {
            client,
            base_url: required_str(config, "base_url")?,
            api_key: required_str(config, "api_key")?,
            model: config
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or("gpt-4o-mini")
                .to_string(),
            system_prompt: config
                .get("system_prompt")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    #[instrument(skip(self, envelope), err)]
    async fn process_message(&self, envelope: &Envelope) -> Result<Reply, PlatformError> {
        let mut messages = Vec::new();
        if let Some(prompt) = &self.system_prompt {
            messages.push(json!({"role": "system", "content": prompt}));
        }
        messages.push(json!({"role": "user", "content": envelope.content}));

        let body = json!({ "model": self.model, "messages": messages });

        let response = send_json(
            &self.client,
            self.client
                .post(format!(
                    "{}/chat/completions",
                    self.base_url.trim_end_matches('/')
                ))
                .bearer_auth(&self.api_key)
                .json(&body),
        )
        .await?;

        let text = response["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        if text.is_empty() {
            return Ok(Reply::NoReply);
        }
        Ok(Reply::Text {
            text,
            at_list: Vec::new(),
        })
    }

    #[instrument(skip(self), err)]
    async fn test_connection(&self) -> Result<(), PlatformError> {
        send_json(
            &self.client,
            self.client
                .get(format!("{}/models", self.base_url.trim_end_matches('/')))
                .bearer_auth(&self.api_key),
        )
        .await?;
        Ok(())
    }
}

/// Local keyword matching: no external call, returns the configured response for the first
/// keyword found in the message content, per §6 downstream.
pub struct KeywordPlatform {
    rules: Vec<(String, String)>,
    case_sensitive: bool,
}

impl KeywordPlatform {
    fn from_config(config: &Value) -> Result<Self, PlatformError> {
        let rules_value = config.get("rules").ok_or_else(|| {
            PlatformError::InvalidConfig("missing `rules` array".to_string())
        })?;
        let rules_array = rules_value.as_array().ok_or_else(|| {
            PlatformError::InvalidConfig("`rules` must be an array".to_string())
        })?;

        let mut rules = Vec::with_capacity(rules_array.len());
        for entry in rules_array {
            let keyword = entry
                .get("keyword")
                .and_then(Value::as_str)
                .ok_or_else(|| PlatformError::InvalidConfig("rule missing `keyword`".to_string()))?;
            let response = entry
                .get("response")
                .and_then(Value::as_str)
                .ok_or_else(|| PlatformError::InvalidConfig("rule missing `response`".to_string()))?;
            rules.push((keyword.to_string(), response.to_string()));
        }

        Ok(Self {
            rules,
            case_sensitive: config
                .get("case_sensitive")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }

    fn process_message(&self, envelope: &Envelope) -> Reply {
        let haystack = if self.case_sensitive {
            envelope.content.clone()
        } else {
            envelope.content.to_lowercase()
        };
        for (keyword, response) in &self.rules {
            let needle = if self.case_sensitive {
                keyword.clone()
            } else {
                keyword.to_lowercase()
            };
            if haystack.contains(&needle) {
                return Reply::Text {
                    text: response.clone(),
                    at_list: Vec::new(),
                };
            }
        }
        Reply::NoReply
    }
}

/// A tagged-variant platform target: the registry's unit of dispatch.
pub enum Platform {
    /// See [`DifyPlatform`].
    Dify(DifyPlatform),
    /// See [`OpenAiPlatform`].
    OpenAi(OpenAiPlatform),
    /// See [`KeywordPlatform`].
    Keyword(KeywordPlatform),
}

impl Platform {
    /// Builds a platform instance for `kind` from its decrypted config map.
    fn build(client: Client, kind: PlatformKind, config: &Value) -> Result<Self, PlatformError> {
        match kind {
            PlatformKind::Dify => Ok(Self::Dify(DifyPlatform::from_config(client, config)?)),
            PlatformKind::OpenAi => Ok(Self::OpenAi(OpenAiPlatform::from_config(client, config)?)),
            PlatformKind::Keyword => Ok(Self::Keyword(KeywordPlatform::from_config(config)?)),
        }
    }

    /// Routes an envelope to the underlying variant's implementation.
    pub async fn process_message(&self, envelope: &Envelope) -> Result<Reply, PlatformError> {
        match self {
            Self::Dify(platform) => platform.process_message(envelope).await,
            Self::OpenAi(platform) => platform.process_message(envelope).await,
            Self::Keyword(platform) => Ok(platform.process_message(envelope)),
        }
    }

    /// Verifies the platform is reachable and configured correctly, where that is
    /// meaningful (keyword matching performs no I/O and always succeeds).
    pub async fn test_connection(&self) -> Result<(), PlatformError> {
        match self {
            Self::Dify(platform) => platform.test_connection().await,
            Self::OpenAi(platform) => platform.test_connection().await,
            Self::Keyword(_) => Ok(()),
        }
    }
}

/// Caches initialized [`Platform`] instances, rebuilding an entry whenever its config changes
/// (the config registry's change signal in §4.B), per §4.G.
#[derive(Default)]
pub struct PlatformRegistry {
    client: Client,
    platforms: DashMap<PlatformId, Arc<Platform>>,
}

impl PlatformRegistry {
    /// Builds an empty registry sharing `client` across every outbound-calling variant.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            platforms: DashMap::new(),
        }
    }

    /// (Re)builds the entry for `platform_id`, replacing any previous instance.
    pub fn upsert(
        &self,
        platform_id: PlatformId,
        kind: PlatformKind,
        config: &Value,
    ) -> Result<(), PlatformError> {
        let platform = Platform::build(self.client.clone(), kind, config)?;
        self.platforms.insert(platform_id, Arc::new(platform));
        Ok(())
    }

    /// Drops a platform's cached entry, e.g. after deletion or disablement.
    pub fn remove(&self, platform_id: &PlatformId) {
        self.platforms.remove(platform_id);
    }

    /// Looks up a cached platform instance by id.
    #[must_use]
    pub fn get(&self, platform_id: &PlatformId) -> Option<Arc<Platform>> {
        self.platforms.get(platform_id).map(|p| Arc::clone(p.value()))
    }

    /// Builds a transient platform from `kind`/`config` without caching it, and probes it with
    /// [`Platform::test_connection`]. Used by the management surface's connectivity check,
    /// which must work against a config the operator hasn't saved yet.
    pub async fn test_config(&self, kind: PlatformKind, config: &Value) -> Result<(), PlatformError> {
        let platform = Platform::build(self.client.clone(), kind, config)?;
        platform.test_connection().await
    }
}

fn required_str(config: &Value, key: &str) -> Result<String, PlatformError> {
    config
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| PlatformError::InvalidConfig(format!("missing `{key}`")))
}

async fn send_json(client: &Client, builder: reqwest::RequestBuilder) -> Result<Value, PlatformError> {
    let response = tokio::time::timeout(PLATFORM_CALL_TIMEOUT, builder.send())
        .await
        .map_err(|_| PlatformError::Unavailable("request timed out".to_string()))?
        .map_err(|e| PlatformError::Unavailable(e.to_string()))?;

    let status = response.status();
    if status.is_server_error() {
        return Err(PlatformError::Failed(format!("http {status}")));
    }
    if status.is_client_error() {
        return Err(PlatformError::Rejected(format!("http {status}")));
    }

    response
        .json()
        .await
        .map_err(|e| PlatformError::Failed(format!("malformed response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::MessageType;

    fn envelope(content: &str) -> Envelope {
        Envelope {
            content: content.to_string(),
            sender: "alice".to_string(),
            chat_name: ChatName::try_from("g1".to_string()).unwrap(),
            instance_id: InstanceId::try_from("inst-a".to_string()).unwrap(),
            mtype: MessageType::Text,
            attachments: Vec::new(),
        }
    }

    #[tokio::test]
    async fn keyword_platform_matches_configured_keyword() {
        let config = json!({
            "rules": [{"keyword": "help", "response": "call support"}],
        });
        let platform = KeywordPlatform::from_config(&config).unwrap();
        let reply = platform.process_message(&envelope("I need HELP please"));
        assert_eq!(
            reply,
            Reply::Text {
                text: "call support".to_string(),
                at_list: Vec::new(),
            }
        );
    }

    #[tokio::test]
    async fn keyword_platform_no_reply_when_unmatched() {
        let config = json!({ "rules": [{"keyword": "help", "response": "call support"}] });
        let platform = KeywordPlatform::from_config(&config).unwrap();
        assert_eq!(platform.process_message(&envelope("hello there")), Reply::NoReply);
    }

    #[test]
    fn keyword_platform_rejects_missing_rules() {
        assert!(KeywordPlatform::from_config(&json!({})).is_err());
    }

    #[test]
    fn dify_platform_requires_base_url_and_api_key() {
        let client = Client::new();
        assert!(DifyPlatform::from_config(client.clone(), &json!({"api_key": "k"})).is_err());
        assert!(DifyPlatform::from_config(client, &json!({"base_url": "http://x"})).is_ok());
    }

    #[test]
    fn registry_upsert_then_get_roundtrips() {
        let registry = PlatformRegistry::new(Client::new());
        let id = PlatformId::from(uuid::Uuid::from_u128(1));
        registry
            .upsert(
                id,
                PlatformKind::Keyword,
                &json!({"rules": [{"keyword": "hi", "response": "hello"}]}),
            )
            .unwrap();
        assert!(registry.get(&id).is_some());
        registry.remove(&id);
        assert!(registry.get(&id).is_none());
    }

    #[tokio::test]
    async fn dify_platform_process_message_parses_answer_and_conversation_id() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/chat-messages"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(json!({
                "answer": "hi there",
                "conversation_id": "conv-1",
            })))
            .mount(&server)
            .await;

        let config = json!({"base_url": server.uri(), "api_key": "k"});
        let platform = DifyPlatform::from_config(Client::new(), &config).unwrap();
        let reply = platform.process_message(&envelope("hello")).await.unwrap();
        assert_eq!(
            reply,
            Reply::Text {
                text: "hi there".to_string(),
                at_list: Vec::new(),
            }
        );
        assert_eq!(platform.conversation_id.lock().unwrap().as_deref(), Some("conv-1"));
    }

    #[tokio::test]
    async fn dify_platform_server_error_is_retryable() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/chat-messages"))
            .respond_with(wiremock::ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let config = json!({"base_url": server.uri(), "api_key": "k"});
        let platform = DifyPlatform::from_config(Client::new(), &config).unwrap();
        let err = platform.process_message(&envelope("hello")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PlatformError);
    }

    #[tokio::test]
    async fn openai_platform_process_message_reads_first_choice() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/chat/completions"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "an answer"}}],
            })))
            .mount(&server)
            .await;

        let config = json!({"base_url": server.uri(), "api_key": "k"});
        let platform = OpenAiPlatform::from_config(Client::new(), &config).unwrap();
        let reply = platform.process_message(&envelope("hello")).await.unwrap();
        assert_eq!(
            reply,
            Reply::Text {
                text: "an answer".to_string(),
                at_list: Vec::new(),
            }
        );
    }

    #[tokio::test]
    async fn openai_platform_client_error_is_terminal() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/chat/completions"))
            .respond_with(wiremock::ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let config = json!({"base_url": server.uri(), "api_key": "k"});
        let platform = OpenAiPlatform::from_config(Client::new(), &config).unwrap();
        let err = platform.process_message(&envelope("hello")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }
}
