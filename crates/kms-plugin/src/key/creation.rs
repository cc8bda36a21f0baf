//! Lease-guarded key creation.
//!
//! When the configured key does not exist, every replica that starts at the
//! same time would otherwise create its own version. A blob named after the key
//! acts as a mutex: the replica that wins the blob lease creates the key, the
//! rest poll the key store until the winner's key becomes visible.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::backend::{
    KeyBundle, KeyCreateParams, KeyStore, KeyStoreError, LeaseError, LeaseProvider, VaultInfo,
};

/// How long a replica that lost the lease waits for the winner's key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    interval: Duration,
    ceiling: Duration,
}

impl PollPolicy {
    pub fn new(interval: Duration, ceiling: Duration) -> Self {
        Self { interval, ceiling }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(60))
    }
}

/// Errors from the creation protocol. All of them are fatal for the request.
#[derive(Debug, Error)]
pub enum CreationError {
    #[error("failed to prepare lease blob for key {key}: {source}")]
    LeaseSetup {
        key: String,
        #[source]
        source: LeaseError,
    },

    #[error("failed to acquire creation lease for key {key}: {source}")]
    Lease {
        key: String,
        #[source]
        source: LeaseError,
    },

    #[error("failed to create key {key}: {source}")]
    CreateKey {
        key: String,
        #[source]
        source: KeyStoreError,
    },

    #[error("key {key} did not become visible within {waited:?}")]
    VisibilityTimeout { key: String, waited: Duration },
}

/// Creates a missing key at most once across all replicas.
pub struct KeyCreator {
    lease: Arc<dyn LeaseProvider>,
    store: Arc<dyn KeyStore>,
    lease_duration: Duration,
    poll: PollPolicy,
}

impl KeyCreator {
    pub fn new(
        lease: Arc<dyn LeaseProvider>,
        store: Arc<dyn KeyStore>,
        lease_duration: Duration,
        poll: PollPolicy,
    ) -> Self {
        Self {
            lease,
            store,
            lease_duration,
            poll,
        }
    }

    /// Create `key_name` in `vault`, or wait for another replica to do so.
    ///
    /// # Errors
    ///
    /// Returns [`CreationError::VisibilityTimeout`] if the lease is held
    /// elsewhere and no key appears within the poll ceiling. Every other
    /// failure is returned immediately without retry.
    pub async fn create(&self, vault: &VaultInfo, key_name: &str) -> Result<KeyBundle, CreationError> {
        info!(key_name, "key not found; provisioning under creation lease");

        // Container and blob share the key's name.
        self.lease
            .ensure_container(key_name)
            .await
            .map_err(|source| CreationError::LeaseSetup {
                key: key_name.to_owned(),
                source,
            })?;
        self.lease
            .ensure_blob(key_name, key_name)
            .await
            .map_err(|source| CreationError::LeaseSetup {
                key: key_name.to_owned(),
                source,
            })?;

        match self
            .lease
            .acquire_lease(key_name, key_name, self.lease_duration)
            .await
        {
            Ok(lease_id) => {
                debug!(key_name, lease_id = %lease_id, "acquired creation lease");
                let params = KeyCreateParams::for_sku(vault.sku);
                let bundle = self
                    .store
                    .create_key(&vault.base_url, key_name, &params)
                    .await
                    .map_err(|source| CreationError::CreateKey {
                        key: key_name.to_owned(),
                        source,
                    })?;
                info!(key_name, key_type = params.key_type.as_str(), "created key");
                Ok(bundle)
            }
            Err(LeaseError::Held) => {
                info!(
                    key_name,
                    interval = ?self.poll.interval(),
                    ceiling = ?self.poll.ceiling(),
                    "creation lease held by another replica; waiting for key"
                );
                self.await_visibility(vault, key_name).await
            }
            Err(source) => Err(CreationError::Lease {
                key: key_name.to_owned(),
                source,
            }),
        }
    }

    /// Poll the latest version of `key_name` until it exists or the ceiling
    /// is exceeded.
    async fn await_visibility(
        &self,
        vault: &VaultInfo,
        key_name: &str,
    ) -> Result<KeyBundle, CreationError> {
        let started = Instant::now();
        loop {
            match self.store.get_key(&vault.base_url, key_name, "").await {
                Ok(bundle) => {
                    info!(key_name, elapsed = ?started.elapsed(), "key became visible");
                    return Ok(bundle);
                }
                Err(e) => debug!(key_name, error = %e, elapsed = ?started.elapsed(), "key not visible yet"),
            }

            if started.elapsed() + self.poll.interval() > self.poll.ceiling() {
                break;
            }
            sleep(self.poll.interval()).await;
        }

        let waited = started.elapsed();
        warn!(key_name, waited = ?waited, "gave up waiting for key creation");
        Err(CreationError::VisibilityTimeout {
            key: key_name.to_owned(),
            waited,
        })
    }
}
