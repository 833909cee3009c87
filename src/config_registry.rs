//! Component B: the config registry.
//!
//! A singleton keyed store fed by the persistent store, publishing a change signal whenever
//! any entity in (instances, platforms, rules, listener configs, the generic config table) is
//! mutated through it. Subscribers (C, D, H) hold the matching [`tokio::sync::watch`]
//! receiver and refresh their own caches on change rather than polling the store.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;

use crate::storage::{ConfigStore, StoreResult};

/// Monotonically increasing version bumped on every mutating call, cheap to compare against
/// a subscriber's last-seen value.
pub type ConfigVersion = u64;

/// Process-wide keyed configuration. Encryption at rest is the underlying [`ConfigStore`]'s
/// job (it owns the master key): every value this registry caches, whether read via
/// [`ConfigRegistry::reload`] or written via [`ConfigRegistry::set`], is plaintext.
pub struct ConfigRegistry {
    store: Arc<dyn ConfigStore>,
    cache: DashMap<String, String>,
    version_tx: watch::Sender<ConfigVersion>,
}

impl ConfigRegistry {
    /// Builds a registry over `store`. Does not read the store eagerly; call
    /// [`ConfigRegistry::reload`] once at startup.
    #[must_use]
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        let (version_tx, _rx) = watch::channel(0);
        Self {
            store,
            cache: DashMap::new(),
            version_tx,
        }
    }

    /// A receiver subscribers hold to learn when to refresh their own caches.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConfigVersion> {
        self.version_tx.subscribe()
    }

    /// Reloads the in-memory cache from the store wholesale.
    ///
    /// # Errors
    /// Returns an error if the underlying store listing fails.
    pub async fn reload(&self) -> StoreResult<()> {
        self.cache.clear();
        for (key, value) in self.store.list().await? {
            self.cache.insert(key, value);
        }
        Ok(())
    }

    /// Reads a plaintext key from the cache, bypassing the store.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.cache.get(key).map(|v| v.clone())
    }

    /// Reads a secret key from the cache. The store already decrypts encrypted rows on
    /// read (the cache, whether populated by `reload()` or `set()`, always holds the
    /// plaintext), so this is the same lookup as [`ConfigRegistry::get`]; the separate name
    /// documents caller intent rather than doing separate work.
    #[must_use]
    pub fn get_secret(&self, key: &str) -> Option<String> {
        self.get(key)
    }

    /// Sets a key, optionally encrypting it at rest, persists it, updates the cache, and
    /// bumps the version so subscribers know to reload.
    ///
    /// # Errors
    /// Returns an error if the underlying store write fails.
    pub async fn set(&self, key: &str, value: &str, encrypt: bool) -> Result<(), ConfigRegistryError> {
        self.store.set(key, value, encrypt).await?;
        self.cache.insert(key.to_string(), value.to_string());
        self.notify_changed();
        Ok(())
    }

    /// Deletes a key, persists the deletion, and bumps the version.
    ///
    /// # Errors
    /// Returns an error if the underlying store delete fails.
    pub async fn delete(&self, key: &str) -> Result<(), ConfigRegistryError> {
        self.store.delete(key).await?;
        self.cache.remove(key);
        self.notify_changed();
        Ok(())
    }

    /// Called by other components (the instance/rule/platform stores, via their own CRUD
    /// paths) whenever they mutate an entity this registry's subscribers care about, so a
    /// single version counter covers every mutation source, not just this registry's own
    /// `set`/`delete`.
    pub fn notify_changed(&self) {
        self.version_tx.send_modify(|v| *v += 1);
    }
}

/// Failures from a mutating config registry call.
#[derive(Debug, thiserror::Error)]
pub enum ConfigRegistryError {
    /// The underlying store operation failed (including encryption failures, which the
    /// store's own `ConfigStore::set`/`get` wrap as `StoreError::Crypto`).
    #[error("store error: {0}")]
    Store(#[from] crate::storage::StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_utils::InMemoryConfigStore;

    fn registry() -> ConfigRegistry {
        ConfigRegistry::new(Arc::new(InMemoryConfigStore::default()))
    }

    #[tokio::test]
    async fn set_then_get_roundtrips_plaintext() {
        let registry = registry();
        registry.set("bind_address", "0.0.0.0", false).await.unwrap();
        assert_eq!(registry.get("bind_address"), Some("0.0.0.0".to_string()));
    }

    #[tokio::test]
    async fn set_then_get_secret_roundtrips_encrypted() {
        let registry = registry();
        registry.set("webhook_secret", "sk-live-123", true).await.unwrap();
        assert_eq!(
            registry.get_secret("webhook_secret"),
            Some("sk-live-123".to_string())
        );
    }

    #[tokio::test]
    async fn get_secret_survives_reload_after_restart() {
        let store: Arc<dyn crate::storage::ConfigStore> = Arc::new(InMemoryConfigStore::default());
        let registry = ConfigRegistry::new(Arc::clone(&store));
        registry.set("webhook_secret", "sk-live-123", true).await.unwrap();

        // Simulate a process restart: a fresh registry over the same store, populated only
        // via `reload()` rather than `set()`.
        let restarted = ConfigRegistry::new(store);
        restarted.reload().await.unwrap();
        assert_eq!(
            restarted.get_secret("webhook_secret"),
            Some("sk-live-123".to_string())
        );
    }

    #[tokio::test]
    async fn set_bumps_version() {
        let registry = registry();
        let mut rx = registry.subscribe();
        let before = *rx.borrow();
        registry.set("k", "v", false).await.unwrap();
        rx.changed().await.unwrap();
        assert!(*rx.borrow() > before);
    }

    #[tokio::test]
    async fn delete_removes_from_cache() {
        let registry = registry();
        registry.set("k", "v", false).await.unwrap();
        registry.delete("k").await.unwrap();
        assert_eq!(registry.get("k"), None);
    }
}
