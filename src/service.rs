//! Component: the service container.
//!
//! Constructed once at startup (§9's glossary entry for "Service container"), owning every
//! other component (A-I) and the single root [`CancellationToken`] whose `.child_token()`s are
//! handed to each loop/worker/HTTP server so that [`ServiceContainer::shutdown`] cancels the
//! whole tree from one call, per §5's implementation note.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::agent_client::{AgentClientPool, AgentHandle, HttpAgentClient};
use crate::config::AppConfig;
use crate::config_registry::ConfigRegistry;
use crate::crypto::MasterKey;
use crate::database::{DatabaseConfig, DatabaseConnection, DatabasePath};
use crate::dispatcher::DeliveryDispatcher;
use crate::domain_types::DeliveryMaxAttempts;
use crate::listener_engine::ListenerEngine;
use crate::platform::PlatformRegistry;
use crate::rest_api::{AppState, BroadcastChannels};
use crate::rule_engine::RuleEngine;
use crate::storage::{
    ConfigStore, DeliveryLedgerStore, InstanceStore, ListenerStore, MessageStore, PlatformStore,
    RuleStore, SqliteConfigStore, SqliteDeliveryLedgerStore, SqliteInstanceStore,
    SqliteListenerStore, SqliteMessageStore, SqlitePlatformStore, SqliteRuleStore, StoreError,
};

/// Failures raised while assembling the service container at startup.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Opening or migrating the database failed.
    #[error("database error: {0}")]
    Database(#[from] crate::database::DatabaseError),
    /// A store read required during startup failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// The configured master key was malformed.
    #[error("crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),
}

/// Owns every component (A-I) and the root cancellation tree. One instance per running
/// process; built once by `main`, handed to `server.rs` to mount the HTTP surface.
pub struct ServiceContainer {
    root_token: CancellationToken,
    instance_store: Arc<dyn InstanceStore>,
    listener_store: Arc<dyn ListenerStore>,
    message_store: Arc<dyn MessageStore>,
    platform_store: Arc<dyn PlatformStore>,
    rule_store: Arc<dyn RuleStore>,
    ledger_store: Arc<dyn DeliveryLedgerStore>,
    config_registry: Arc<ConfigRegistry>,
    agent_pool: Arc<AgentClientPool>,
    listener_engine: Arc<ListenerEngine>,
    rule_engine: Arc<RuleEngine>,
    platform_registry: Arc<PlatformRegistry>,
    dispatcher: Arc<DeliveryDispatcher>,
    http_client: Client,
    worker_count: u32,
    broadcasts: BroadcastChannels,
}

impl ServiceContainer {
    /// Opens the store, decrypts secrets with `master_key`, and wires every component
    /// together. Does not start any loop, worker, or server; call [`ServiceContainer::start`]
    /// for that.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened/migrated, or if an initial store read
    /// (enabled instances, platforms, enabled rules) fails.
    #[instrument(skip(config, master_key))]
    pub async fn build(config: &AppConfig, master_key: MasterKey) -> Result<Self, ServiceError> {
        let db_path = DatabasePath::new(config.database_path())?;
        let db_config = DatabaseConfig::new(db_path);
        let connection = DatabaseConnection::initialize(db_config).await?;
        let master_key = Arc::new(master_key);

        let instance_store: Arc<dyn InstanceStore> =
            Arc::new(SqliteInstanceStore::new(connection.clone(), master_key.clone()));
        let listener_store: Arc<dyn ListenerStore> =
            Arc::new(SqliteListenerStore::new(connection.clone()));
        let message_store: Arc<dyn MessageStore> = Arc::new(SqliteMessageStore::new(connection.clone()));
        let platform_store: Arc<dyn PlatformStore> =
            Arc::new(SqlitePlatformStore::new(connection.clone(), master_key.clone()));
        let rule_store: Arc<dyn RuleStore> = Arc::new(SqliteRuleStore::new(connection.clone()));
        let ledger_store: Arc<dyn DeliveryLedgerStore> =
            Arc::new(SqliteDeliveryLedgerStore::new(connection.clone()));
        let config_store: Arc<dyn ConfigStore> =
            Arc::new(SqliteConfigStore::new(connection.clone(), master_key.clone()));

        let config_registry = Arc::new(ConfigRegistry::new(config_store));
        config_registry.reload().await?;

        let http_client = Client::builder()
            .build()
            .expect("reqwest client with default TLS backend always builds");

        let agent_pool = Arc::new(AgentClientPool::new());
        for instance in instance_store.list_enabled().await? {
            let client = HttpAgentClient::new(
                http_client.clone(),
                instance.instance_id.clone(),
                instance.base_url.clone(),
                instance.api_key.clone(),
            );
            let handle = Arc::new(AgentHandle::new(instance.instance_id.clone(), Arc::new(client)));
            agent_pool.insert(handle);
        }

        let new_message = Arc::new(Notify::new());
        let (message_tx, _) = broadcast::channel(1024);
        let (status_tx, _) = broadcast::channel(256);

        let listener_engine = Arc::new(ListenerEngine::new(
            Arc::clone(&agent_pool),
            Arc::clone(&instance_store),
            Arc::clone(&listener_store),
            Arc::clone(&message_store),
            Arc::clone(&new_message),
            message_tx.clone(),
        ));
        listener_engine.load_from_store().await?;

        let rule_engine = Arc::new(RuleEngine::new());
        rule_engine.refresh(&rule_store.list_enabled().await?).await;

        let platform_registry = Arc::new(PlatformRegistry::new(http_client.clone()));
        for platform in platform_store.list().await? {
            if !platform.enabled {
                continue;
            }
            if let Err(e) = platform_registry.upsert(platform.platform_id, platform.kind, &platform.config) {
                warn!(platform_id = %platform.platform_id, error = %e, "skipping misconfigured platform at startup");
            }
        }

        let dispatcher = Arc::new(DeliveryDispatcher::new(
            Arc::clone(&message_store),
            Arc::clone(&ledger_store),
            Arc::clone(&rule_engine),
            Arc::clone(&platform_registry),
            Arc::clone(&agent_pool),
            Arc::clone(&new_message),
            status_tx.clone(),
            DeliveryMaxAttempts::try_new(3).unwrap_or_default(),
        ));

        Ok(Self {
            root_token: CancellationToken::new(),
            instance_store,
            listener_store,
            message_store,
            platform_store,
            rule_store,
            ledger_store,
            config_registry,
            agent_pool,
            listener_engine,
            rule_engine,
            platform_registry,
            dispatcher,
            http_client,
            worker_count: config.worker_count.clamp(1, 256),
            broadcasts: BroadcastChannels { message_tx, status_tx },
        })
    }

    /// Spawns every loop, delivery worker, and the config-change subscriber task. The caller
    /// is responsible for separately starting the HTTP server with [`ServiceContainer::app_state`].
    pub fn start(self: &Arc<Self>) {
        let l1 = Arc::clone(&self.listener_engine);
        let token = self.root_token.child_token();
        tokio::spawn(async move { l1.run_l1(Duration::from_secs(5), token).await });

        let l2 = Arc::clone(&self.listener_engine);
        let token = self.root_token.child_token();
        tokio::spawn(async move { l2.run_l2(Duration::from_secs(5), token).await });

        let l3 = Arc::clone(&self.listener_engine);
        let token = self.root_token.child_token();
        tokio::spawn(async move { l3.run_l3(Duration::from_secs(60), token).await });

        let worker_token = self.root_token.child_token();
        self.dispatcher.spawn_workers(self.worker_count, &worker_token);

        let subscriber = Arc::clone(self);
        let token = self.root_token.child_token();
        tokio::spawn(async move { subscriber.run_config_subscriber(token).await });

        info!(worker_count = self.worker_count, "service container started");
    }

    /// Watches the config registry's version signal and rebuilds the rule engine and platform
    /// registry caches whenever an entity they depend on changes, per §4.B.
    async fn run_config_subscriber(self: Arc<Self>, token: CancellationToken) {
        let mut rx = self.config_registry.subscribe();
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                result = rx.changed() => {
                    if result.is_err() {
                        break;
                    }
                    self.refresh_rule_engine().await;
                    self.refresh_platform_registry().await;
                }
            }
        }
        info!("config-change subscriber cancelled, exiting cleanly");
    }

    async fn refresh_rule_engine(&self) {
        match self.rule_store.list_enabled().await {
            Ok(rows) => self.rule_engine.refresh(&rows).await,
            Err(e) => warn!(error = %e, "failed to refresh rule engine"),
        }
    }

    async fn refresh_platform_registry(&self) {
        let platforms = match self.platform_store.list().await {
            Ok(platforms) => platforms,
            Err(e) => {
                warn!(error = %e, "failed to list platforms for refresh");
                return;
            }
        };
        for platform in platforms {
            if !platform.enabled {
                self.platform_registry.remove(&platform.platform_id);
                continue;
            }
            if let Err(e) =
                self.platform_registry
                    .upsert(platform.platform_id, platform.kind, &platform.config)
            {
                warn!(platform_id = %platform.platform_id, error = %e, "failed to rebuild platform");
            }
        }
    }

    /// Cancels the root token, stopping every loop, worker, and subscriber task. Each loop
    /// finalizes its in-flight call and in-memory state before returning (§5 shutdown).
    pub fn shutdown(&self) {
        info!("shutdown requested, cancelling service container");
        self.root_token.cancel();
    }

    /// Builds the shared application state the management HTTP surface mounts its router
    /// against.
    #[must_use]
    pub fn app_state(self: &Arc<Self>) -> AppState {
        AppState {
            instance_store: Arc::clone(&self.instance_store),
            listener_store: Arc::clone(&self.listener_store),
            message_store: Arc::clone(&self.message_store),
            platform_store: Arc::clone(&self.platform_store),
            rule_store: Arc::clone(&self.rule_store),
            config_registry: Arc::clone(&self.config_registry),
            agent_pool: Arc::clone(&self.agent_pool),
            listener_engine: Arc::clone(&self.listener_engine),
            platform_registry: Arc::clone(&self.platform_registry),
            http_client: self.http_client.clone(),
            broadcasts: self.broadcasts.clone(),
        }
    }

    /// The socket address the management HTTP surface should bind to.
    #[must_use]
    pub fn bind_address(config: &AppConfig) -> SocketAddr {
        SocketAddr::new(config.bind_address, config.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_config(data_dir: std::path::PathBuf) -> AppConfig {
        let mut config = AppConfig::parse_from(["chatrelay"]);
        config.data_dir = data_dir;
        config
    }

    #[tokio::test]
    async fn build_succeeds_on_fresh_database() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = test_config(temp_dir.path().to_path_buf());
        let master_key = MasterKey::from_passphrase("test-key");

        let container = ServiceContainer::build(&config, master_key).await.unwrap();
        assert!(container.agent_pool.instance_ids().is_empty());
    }

    #[tokio::test]
    async fn shutdown_cancels_root_token() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = test_config(temp_dir.path().to_path_buf());
        let master_key = MasterKey::from_passphrase("test-key");

        let container = ServiceContainer::build(&config, master_key).await.unwrap();
        container.shutdown();
        assert!(container.root_token.is_cancelled());
    }

    #[test]
    fn bind_address_combines_config_fields() {
        let mut config = AppConfig::parse_from(["chatrelay"]);
        config.bind_address = std::net::IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        config.port = 9090;
        assert_eq!(
            ServiceContainer::bind_address(&config),
            SocketAddr::new(config.bind_address, 9090)
        );
    }
}
