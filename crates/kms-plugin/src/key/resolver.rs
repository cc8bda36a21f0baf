//! [`KeyResolver`]: turns the configured [`KeyReference`] into a cached
//! [`ResolvedKeyHandle`].

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use common::ServiceError;

use super::creation::{CreationError, KeyCreator};
use super::{version_from_kid, KeyIdError, KeyReference};
use crate::backend::{
    ConfigStore, ConfigStoreError, ControlPlaneError, KeyBundle, KeyStore, KeyStoreError,
    VaultLocator, VaultSku,
};

/// Errors produced while resolving the key.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("failed to locate vault: {0}")]
    VaultLookup(#[from] ControlPlaneError),

    /// The configured version could not be fetched. Never falls back.
    #[error("failed to verify configured version {version} of key {key}: {source}")]
    PinnedVersionUnavailable {
        key: String,
        version: String,
        #[source]
        source: KeyStoreError,
    },

    #[error("failed to fetch key {key}: {source}")]
    KeyFetch {
        key: String,
        #[source]
        source: KeyStoreError,
    },

    #[error(transparent)]
    Creation(#[from] CreationError),

    #[error(transparent)]
    KeyId(#[from] KeyIdError),

    #[error("failed to persist key version: {0}")]
    Persist(#[from] ConfigStoreError),
}

impl From<ResolveError> for ServiceError {
    fn from(err: ResolveError) -> Self {
        let msg = err.to_string();
        match err {
            ResolveError::PinnedVersionUnavailable { ref source, .. } if source.is_not_found() => {
                ServiceError::Configuration(msg)
            }
            ResolveError::Creation(CreationError::VisibilityTimeout { .. }) => {
                ServiceError::Timeout(msg)
            }
            ResolveError::PinnedVersionUnavailable { .. }
            | ResolveError::VaultLookup(_)
            | ResolveError::KeyFetch { .. }
            | ResolveError::Creation(_) => ServiceError::Unavailable(msg),
            ResolveError::KeyId(_) | ResolveError::Persist(_) => ServiceError::Internal(msg),
        }
    }
}

/// A key ready for encrypt/decrypt calls.
///
/// Immutable once built; shared by every request for the process lifetime.
pub struct ResolvedKeyHandle {
    pub vault_base_url: String,
    pub sku: VaultSku,
    pub key_name: String,
    pub key_version: String,
    client: Arc<dyn KeyStore>,
}

impl ResolvedKeyHandle {
    /// The key store client bound to this key's vault.
    pub fn client(&self) -> &dyn KeyStore {
        self.client.as_ref()
    }
}

impl std::fmt::Debug for ResolvedKeyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedKeyHandle")
            .field("vault_base_url", &self.vault_base_url)
            .field("sku", &self.sku)
            .field("key_name", &self.key_name)
            .field("key_version", &self.key_version)
            .finish_non_exhaustive()
    }
}

/// Resolves the configured key once and caches the result.
///
/// Concurrent first callers are coalesced: one of them performs the lookup,
/// the rest wait for its outcome. A failed resolution is not cached, so the
/// next request tries again from scratch.
pub struct KeyResolver {
    reference: KeyReference,
    locator: Arc<dyn VaultLocator>,
    store: Arc<dyn KeyStore>,
    creator: KeyCreator,
    config_store: Arc<dyn ConfigStore>,
    handle: OnceCell<Arc<ResolvedKeyHandle>>,
}

impl KeyResolver {
    pub fn new(
        reference: KeyReference,
        locator: Arc<dyn VaultLocator>,
        store: Arc<dyn KeyStore>,
        creator: KeyCreator,
        config_store: Arc<dyn ConfigStore>,
    ) -> Self {
        Self {
            reference,
            locator,
            store,
            creator,
            config_store,
            handle: OnceCell::new(),
        }
    }

    pub fn reference(&self) -> &KeyReference {
        &self.reference
    }

    /// The cached handle, if resolution has already succeeded.
    pub fn cached(&self) -> Option<Arc<ResolvedKeyHandle>> {
        self.handle.get().cloned()
    }

    /// Return the resolved key, resolving (and possibly creating) it first if
    /// this is the first successful call.
    ///
    /// # Errors
    ///
    /// See [`ResolveError`]. A pinned version that cannot be fetched always
    /// fails; creation is only attempted for an unpinned, missing key.
    pub async fn resolve(&self) -> Result<Arc<ResolvedKeyHandle>, ResolveError> {
        self.handle
            .get_or_try_init(|| self.resolve_uncached())
            .await
            .cloned()
    }

    async fn resolve_uncached(&self) -> Result<Arc<ResolvedKeyHandle>, ResolveError> {
        let r = &self.reference;
        let vault = self
            .locator
            .locate(&r.subscription_id, &r.resource_group, &r.vault_name)
            .await?;
        info!(
            vault = %r.vault_name,
            vault_url = %vault.base_url,
            sku = ?vault.sku,
            "located vault"
        );

        let pinned = r.key_version.as_deref();
        info!(
            key_name = %r.key_name,
            key_version = pinned.unwrap_or("<latest>"),
            "verifying key in vault"
        );

        let fetched = self
            .store
            .get_key(&vault.base_url, &r.key_name, pinned.unwrap_or(""))
            .await;

        let key_version = match (fetched, pinned) {
            (Ok(_), Some(version)) => version.to_owned(),
            (Ok(bundle), None) => self.adopt(&bundle).await?,
            (Err(source), Some(version)) => {
                warn!(key_name = %r.key_name, key_version = version, error = %source, "configured key version unavailable");
                return Err(ResolveError::PinnedVersionUnavailable {
                    key: r.key_name.clone(),
                    version: version.to_owned(),
                    source,
                });
            }
            (Err(e), None) if e.is_not_found() => {
                let bundle = self.creator.create(&vault, &r.key_name).await?;
                self.adopt(&bundle).await?
            }
            (Err(source), None) => {
                return Err(ResolveError::KeyFetch {
                    key: r.key_name.clone(),
                    source,
                })
            }
        };

        Ok(Arc::new(ResolvedKeyHandle {
            vault_base_url: vault.base_url,
            sku: vault.sku,
            key_name: r.key_name.clone(),
            key_version,
            client: self.store.clone(),
        }))
    }

    /// Take the version of a discovered or created key and make it durable.
    async fn adopt(&self, bundle: &KeyBundle) -> Result<String, ResolveError> {
        let version = version_from_kid(&bundle.kid)?;
        info!(key_name = %self.reference.key_name, key_version = %version, "found key version");
        self.config_store.persist_key_version(&version).await?;
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::backend::{MockConfigStore, MockKeyStore, MockVaultLocator, VaultInfo};
    use crate::key::PollPolicy;
    use crate::testing::{reference, vault, FakeCloud};

    fn resolver(cloud: &FakeCloud, version: Option<&str>) -> KeyResolver {
        KeyResolver::new(
            reference(version),
            cloud.locator.clone(),
            cloud.store.clone(),
            KeyCreator::new(
                cloud.lease.clone(),
                cloud.store.clone(),
                Duration::from_secs(60),
                PollPolicy::default(),
            ),
            cloud.config.clone(),
        )
    }

    #[tokio::test]
    async fn existing_latest_key_is_adopted_and_persisted() {
        let cloud = FakeCloud::new();
        cloud.store.insert_key("k8s", "v1");
        cloud.store.insert_key("k8s", "v2");

        let handle = resolver(&cloud, None).resolve().await.unwrap();

        assert_eq!(handle.key_version, "v2");
        assert_eq!(handle.vault_base_url, crate::testing::VAULT_URL);
        assert_eq!(cloud.config.persisted().as_deref(), Some("v2"));
        assert_eq!(cloud.store.create_calls(), 0);
    }

    #[tokio::test]
    async fn pinned_version_is_used_and_not_persisted() {
        let cloud = FakeCloud::new();
        cloud.store.insert_key("k8s", "v1");
        cloud.store.insert_key("k8s", "v2");

        let handle = resolver(&cloud, Some("v1")).resolve().await.unwrap();

        assert_eq!(handle.key_version, "v1");
        assert_eq!(cloud.config.writes(), 0);
    }

    #[tokio::test]
    async fn missing_pinned_version_fails_without_creation() {
        let mut store = MockKeyStore::new();
        store
            .expect_get_key()
            .withf(|_, name, version| name == "k8s" && version == "gone")
            .times(1)
            .returning(|_, _, _| Err(KeyStoreError::NotFound("k8s/gone".into())));
        store.expect_create_key().never();
        let mut config = MockConfigStore::new();
        config.expect_persist_key_version().never();
        let cloud = FakeCloud::new();

        let store: Arc<dyn KeyStore> = Arc::new(store);
        let r = KeyResolver::new(
            reference(Some("gone")),
            cloud.locator.clone(),
            store.clone(),
            KeyCreator::new(
                cloud.lease.clone(),
                store,
                Duration::from_secs(60),
                PollPolicy::default(),
            ),
            Arc::new(config),
        );

        let err = r.resolve().await.unwrap_err();
        assert!(matches!(err, ResolveError::PinnedVersionUnavailable { .. }));
        assert_eq!(cloud.lease.acquire_calls(), 0);
        assert!(matches!(
            ServiceError::from(err),
            ServiceError::Configuration(_)
        ));
    }

    #[tokio::test]
    async fn absent_key_is_created_and_persisted() {
        let cloud = FakeCloud::new();

        let handle = resolver(&cloud, None).resolve().await.unwrap();

        assert_eq!(cloud.store.create_calls(), 1);
        assert_eq!(handle.key_version, "created0");
        assert_eq!(cloud.config.persisted().as_deref(), Some("created0"));
    }

    #[tokio::test]
    async fn restart_resolves_the_persisted_version() {
        let cloud = FakeCloud::new();

        let first = resolver(&cloud, None).resolve().await.unwrap();
        let persisted = cloud.config.persisted().unwrap();

        // A restarted process reads back the persisted version.
        let second = resolver(&cloud, Some(&persisted)).resolve().await.unwrap();
        // A restart that lost the write resolves to the same latest version.
        let third = resolver(&cloud, None).resolve().await.unwrap();

        assert_eq!(first.key_version, second.key_version);
        assert_eq!(first.key_version, third.key_version);
        assert_eq!(cloud.config.persisted().as_deref(), Some(first.key_version.as_str()));
        assert_eq!(cloud.store.create_calls(), 1);
    }

    #[tokio::test]
    async fn cached_handle_skips_network() {
        let cloud = FakeCloud::new();
        cloud.store.insert_key("k8s", "v1");
        let r = resolver(&cloud, None);
        assert!(r.cached().is_none());

        let a = r.resolve().await.unwrap();
        let b = r.resolve().await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(r.cached().is_some());
        assert_eq!(cloud.locator.calls(), 1);
        assert_eq!(cloud.store.get_calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_first_calls_are_coalesced() {
        let cloud = FakeCloud::new();
        let r = Arc::new(resolver(&cloud, None));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let r = r.clone();
            tasks.spawn(async move { r.resolve().await.map(|h| h.key_version.clone()) });
        }
        let mut versions = Vec::new();
        while let Some(res) = tasks.join_next().await {
            versions.push(res.unwrap().unwrap());
        }

        assert!(versions.iter().all(|v| v == "created0"));
        assert_eq!(cloud.locator.calls(), 1);
        assert_eq!(cloud.store.create_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn replicas_racing_on_absent_key_create_it_once() {
        let cloud = FakeCloud::new();

        // Each resolver plays a separate replica sharing the same vault and
        // lease store, so only the blob lease arbitrates between them.
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let r = resolver(&cloud, None);
            tasks.spawn(async move { r.resolve().await.map(|h| h.key_version.clone()) });
        }
        let mut versions = Vec::new();
        while let Some(res) = tasks.join_next().await {
            versions.push(res.unwrap().unwrap());
        }

        assert_eq!(cloud.store.create_calls(), 1);
        assert_eq!(versions.len(), 8);
        assert!(versions.iter().all(|v| v == "created0"), "{versions:?}");
    }

    #[tokio::test]
    async fn transient_fetch_error_is_surfaced_without_creation() {
        let mut store = MockKeyStore::new();
        store
            .expect_get_key()
            .times(1)
            .returning(|_, _, _| Err(KeyStoreError::Transport("connection reset".into())));
        store.expect_create_key().never();
        let cloud = FakeCloud::new();
        let store: Arc<dyn KeyStore> = Arc::new(store);

        let r = KeyResolver::new(
            reference(None),
            cloud.locator.clone(),
            store.clone(),
            KeyCreator::new(
                cloud.lease.clone(),
                store,
                Duration::from_secs(60),
                PollPolicy::default(),
            ),
            cloud.config.clone(),
        );

        let err = r.resolve().await.unwrap_err();
        assert!(matches!(err, ResolveError::KeyFetch { .. }));
        assert!(r.cached().is_none());
    }

    #[tokio::test]
    async fn vault_lookup_failure_is_not_cached() {
        let mut locator = MockVaultLocator::new();
        let mut seq = mockall::Sequence::new();
        locator
            .expect_locate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(ControlPlaneError::Request("timeout".into())));
        locator
            .expect_locate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(vault(VaultSku::Standard)));
        let cloud = FakeCloud::new();
        cloud.store.insert_key("k8s", "v1");

        let r = KeyResolver::new(
            reference(None),
            Arc::new(locator),
            cloud.store.clone(),
            KeyCreator::new(
                cloud.lease.clone(),
                cloud.store.clone(),
                Duration::from_secs(60),
                PollPolicy::default(),
            ),
            cloud.config.clone(),
        );

        assert!(matches!(
            r.resolve().await.unwrap_err(),
            ResolveError::VaultLookup(_)
        ));
        assert_eq!(r.resolve().await.unwrap().key_version, "v1");
    }

    #[tokio::test]
    async fn unparsable_kid_is_an_error() {
        let mut store = MockKeyStore::new();
        store.expect_get_key().returning(|_, _, _| {
            Ok(KeyBundle {
                kid: "https://v.vault.azure.net/keys/k8s/".into(),
            })
        });
        let cloud = FakeCloud::new();
        let store: Arc<dyn KeyStore> = Arc::new(store);
        let mut locator = MockVaultLocator::new();
        locator.expect_locate().returning(|_, _, _| {
            Ok(VaultInfo {
                base_url: "https://v.vault.azure.net".into(),
                sku: VaultSku::Premium,
            })
        });

        let r = KeyResolver::new(
            reference(None),
            Arc::new(locator),
            store.clone(),
            KeyCreator::new(
                cloud.lease.clone(),
                store,
                Duration::from_secs(60),
                PollPolicy::default(),
            ),
            cloud.config.clone(),
        );

        assert!(matches!(r.resolve().await.unwrap_err(), ResolveError::KeyId(_)));
        assert_eq!(cloud.config.writes(), 0);
    }
}
