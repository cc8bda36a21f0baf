//! In-memory doubles of the external services, shared by unit tests.
//!
//! Unlike the `mockall` mocks these keep state, so several resolvers (playing
//! separate replicas) can race against one simulated key store and lease store.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::{
    ConfigStore, ConfigStoreError, ControlPlaneError, EncryptionAlgorithm, KeyBundle,
    KeyCreateParams, KeyStore, KeyStoreError, LeaseError, LeaseProvider, VaultInfo, VaultLocator,
    VaultSku,
};
use crate::envelope::Envelope;
use crate::key::{KeyCreator, KeyReference, KeyResolver, PollPolicy};

pub const VAULT_URL: &str = "https://test-vault.vault.azure.net";

pub fn vault(sku: VaultSku) -> VaultInfo {
    VaultInfo {
        base_url: VAULT_URL.into(),
        sku,
    }
}

pub fn reference(version: Option<&str>) -> KeyReference {
    KeyReference {
        subscription_id: "00000000-0000-0000-0000-000000000000".into(),
        resource_group: "rg".into(),
        vault_name: "test-vault".into(),
        key_name: "k8s".into(),
        key_version: version.map(str::to_owned),
    }
}

// ---------------------------------------------------------------------------
// Key store
// ---------------------------------------------------------------------------

/// Key store keeping versions per key name, latest last.
///
/// Result tokens are `<name>/<version>/<value>`, which is enough to check that
/// decrypt targets the same key version encrypt used.
#[derive(Default)]
pub struct FakeKeyStore {
    keys: Mutex<HashMap<String, Vec<String>>>,
    create_calls: AtomicUsize,
    get_calls: AtomicUsize,
    latency: Option<Duration>,
    unreachable: bool,
}

impl FakeKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every encrypt and decrypt sleeps for `latency` before answering.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Every call fails with a transport error.
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }

    pub fn insert_key(&self, name: &str, version: &str) {
        self.keys
            .lock()
            .unwrap()
            .entry(name.to_owned())
            .or_default()
            .push(version.to_owned());
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<(), KeyStoreError> {
        if self.unreachable {
            return Err(KeyStoreError::Transport("connection refused".into()));
        }
        Ok(())
    }

    fn lookup(&self, name: &str, version: &str) -> Result<String, KeyStoreError> {
        let keys = self.keys.lock().unwrap();
        let versions = keys
            .get(name)
            .ok_or_else(|| KeyStoreError::NotFound(name.to_owned()))?;
        if version.is_empty() {
            return versions
                .last()
                .cloned()
                .ok_or_else(|| KeyStoreError::NotFound(name.to_owned()));
        }
        versions
            .iter()
            .find(|v| *v == version)
            .cloned()
            .ok_or_else(|| KeyStoreError::NotFound(format!("{name}/{version}")))
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

fn kid(name: &str, version: &str) -> String {
    format!("{VAULT_URL}/keys/{name}/{version}")
}

#[async_trait]
impl KeyStore for FakeKeyStore {
    async fn get_key(
        &self,
        _vault_base_url: &str,
        name: &str,
        version: &str,
    ) -> Result<KeyBundle, KeyStoreError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        let version = self.lookup(name, version)?;
        Ok(KeyBundle {
            kid: kid(name, &version),
        })
    }

    async fn create_key(
        &self,
        _vault_base_url: &str,
        name: &str,
        _params: &KeyCreateParams,
    ) -> Result<KeyBundle, KeyStoreError> {
        self.check_reachable()?;
        let n = self.create_calls.fetch_add(1, Ordering::SeqCst);
        let version = format!("created{n}");
        self.insert_key(name, &version);
        Ok(KeyBundle {
            kid: kid(name, &version),
        })
    }

    async fn encrypt(
        &self,
        _vault_base_url: &str,
        name: &str,
        version: &str,
        _algorithm: EncryptionAlgorithm,
        value: &str,
    ) -> Result<String, KeyStoreError> {
        self.delay().await;
        self.check_reachable()?;
        let version = self.lookup(name, version)?;
        Ok(format!("{name}/{version}/{value}"))
    }

    async fn decrypt(
        &self,
        _vault_base_url: &str,
        name: &str,
        version: &str,
        _algorithm: EncryptionAlgorithm,
        value: &str,
    ) -> Result<String, KeyStoreError> {
        self.delay().await;
        self.check_reachable()?;
        let version = self.lookup(name, version)?;
        let prefix = format!("{name}/{version}/");
        value
            .strip_prefix(&prefix)
            .map(str::to_owned)
            .ok_or_else(|| KeyStoreError::Service {
                status: 400,
                message: "BadParameter: ciphertext does not belong to this key".into(),
            })
    }
}

// ---------------------------------------------------------------------------
// Lease store
// ---------------------------------------------------------------------------

/// Lease store whose leases are never released.
#[derive(Default)]
pub struct FakeLeaseProvider {
    containers: Mutex<HashSet<String>>,
    blobs: Mutex<HashSet<(String, String)>>,
    leased: Mutex<HashSet<(String, String)>>,
    acquire_calls: AtomicUsize,
}

impl FakeLeaseProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate another replica holding the lease on `container/blob`.
    pub fn hold(&self, container: &str, blob: &str) {
        let id = (container.to_owned(), blob.to_owned());
        self.containers.lock().unwrap().insert(container.to_owned());
        self.blobs.lock().unwrap().insert(id.clone());
        self.leased.lock().unwrap().insert(id);
    }

    pub fn container_exists(&self, container: &str) -> bool {
        self.containers.lock().unwrap().contains(container)
    }

    pub fn blob_exists(&self, container: &str, blob: &str) -> bool {
        self.blobs
            .lock()
            .unwrap()
            .contains(&(container.to_owned(), blob.to_owned()))
    }

    pub fn acquire_calls(&self) -> usize {
        self.acquire_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LeaseProvider for FakeLeaseProvider {
    async fn ensure_container(&self, container: &str) -> Result<(), LeaseError> {
        self.containers.lock().unwrap().insert(container.to_owned());
        Ok(())
    }

    async fn ensure_blob(&self, container: &str, blob: &str) -> Result<(), LeaseError> {
        if !self.container_exists(container) {
            return Err(LeaseError::Other("ContainerNotFound".into()));
        }
        self.blobs
            .lock()
            .unwrap()
            .insert((container.to_owned(), blob.to_owned()));
        Ok(())
    }

    async fn acquire_lease(
        &self,
        container: &str,
        blob: &str,
        _duration: Duration,
    ) -> Result<String, LeaseError> {
        self.acquire_calls.fetch_add(1, Ordering::SeqCst);
        if !self.blob_exists(container, blob) {
            return Err(LeaseError::Other("BlobNotFound".into()));
        }
        let fresh = self
            .leased
            .lock()
            .unwrap()
            .insert((container.to_owned(), blob.to_owned()));
        if fresh {
            Ok(uuid::Uuid::new_v4().to_string())
        } else {
            Err(LeaseError::Held)
        }
    }
}

// ---------------------------------------------------------------------------
// Control plane and configuration store
// ---------------------------------------------------------------------------

/// Locator that always finds the test vault.
pub struct FakeVaultLocator {
    sku: VaultSku,
    calls: AtomicUsize,
}

impl FakeVaultLocator {
    pub fn new(sku: VaultSku) -> Self {
        Self {
            sku,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VaultLocator for FakeVaultLocator {
    async fn locate(
        &self,
        _subscription_id: &str,
        _resource_group: &str,
        _vault_name: &str,
    ) -> Result<VaultInfo, ControlPlaneError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vault(self.sku))
    }
}

/// Configuration store that records every persisted version.
#[derive(Default)]
pub struct FakeConfigStore {
    writes: Mutex<Vec<String>>,
}

impl FakeConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn persisted(&self) -> Option<String> {
        self.writes.lock().unwrap().last().cloned()
    }

    pub fn writes(&self) -> usize {
        self.writes.lock().unwrap().len()
    }
}

#[async_trait]
impl ConfigStore for FakeConfigStore {
    async fn persist_key_version(&self, version: &str) -> Result<(), ConfigStoreError> {
        self.writes.lock().unwrap().push(version.to_owned());
        Ok(())
    }
}

/// Shared handles to one simulated environment.
#[derive(Clone)]
pub struct FakeCloud {
    pub store: Arc<FakeKeyStore>,
    pub lease: Arc<FakeLeaseProvider>,
    pub locator: Arc<FakeVaultLocator>,
    pub config: Arc<FakeConfigStore>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::with_store(FakeKeyStore::new())
    }

    pub fn with_store(store: FakeKeyStore) -> Self {
        Self {
            store: Arc::new(store),
            lease: Arc::new(FakeLeaseProvider::new()),
            locator: Arc::new(FakeVaultLocator::new(VaultSku::Standard)),
            config: Arc::new(FakeConfigStore::new()),
        }
    }
}

/// Envelope wired to `cloud` with default creation settings.
pub fn envelope_for(cloud: &FakeCloud, version: Option<&str>) -> Envelope {
    let resolver = KeyResolver::new(
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
    );
    Envelope::new(Arc::new(resolver))
}

pub fn test_envelope() -> Envelope {
    envelope_for(&FakeCloud::new(), None)
}
