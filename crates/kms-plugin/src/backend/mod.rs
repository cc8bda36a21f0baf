//! Capability interfaces for the external services the plugin depends on.
//!
//! The key resolver and the envelope layer only ever talk to these traits.
//! Production implementations live in [`crate::azure`]; tests substitute
//! `mockall` mocks or the in-memory doubles in `crate::testing`.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Key store
// ---------------------------------------------------------------------------

/// Service tier of a vault. Decides whether created keys are software- or
/// hardware-backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultSku {
    Standard,
    Premium,
}

impl VaultSku {
    /// Parse the SKU name reported by the control plane. Anything other than
    /// `premium` (case-insensitive) is treated as standard.
    pub fn from_name(name: &str) -> Self {
        if name.eq_ignore_ascii_case("premium") {
            VaultSku::Premium
        } else {
            VaultSku::Standard
        }
    }

    /// Key type to request when creating a key in a vault of this tier.
    pub fn key_type(self) -> KeyType {
        match self {
            VaultSku::Standard => KeyType::Rsa,
            VaultSku::Premium => KeyType::RsaHsm,
        }
    }
}

/// JSON Web Key type of a created key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Rsa,
    RsaHsm,
}

impl KeyType {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyType::Rsa => "RSA",
            KeyType::RsaHsm => "RSA-HSM",
        }
    }
}

/// Operations a created key is permitted to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOperation {
    Encrypt,
    Decrypt,
}

impl KeyOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyOperation::Encrypt => "encrypt",
            KeyOperation::Decrypt => "decrypt",
        }
    }
}

/// Algorithm identifier passed to the key store's encrypt/decrypt operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionAlgorithm {
    /// RSAES-PKCS1-v1_5.
    Rsa15,
}

impl EncryptionAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            EncryptionAlgorithm::Rsa15 => "RSA1_5",
        }
    }
}

/// Parameters of a create-key request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCreateParams {
    pub key_type: KeyType,
    pub key_size: u32,
    pub key_ops: Vec<KeyOperation>,
    pub enabled: bool,
}

/// Modulus size of every key this plugin creates.
pub const KEY_SIZE_BITS: u32 = 2048;

impl KeyCreateParams {
    /// The fixed creation parameters for a vault of the given tier.
    pub fn for_sku(sku: VaultSku) -> Self {
        Self {
            key_type: sku.key_type(),
            key_size: KEY_SIZE_BITS,
            key_ops: vec![KeyOperation::Encrypt, KeyOperation::Decrypt],
            enabled: true,
        }
    }
}

/// Metadata of a key as returned by the key store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBundle {
    /// Full key identifier, e.g. `https://v.vault.azure.net/keys/k/<version>`.
    pub kid: String,
}

/// Errors produced by a [`KeyStore`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyStoreError {
    /// The key (or the requested version of it) does not exist.
    #[error("key not found: {0}")]
    NotFound(String),

    /// The key store rejected the caller's credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The request never produced a response (DNS, TLS, connection reset).
    #[error("transport error: {0}")]
    Transport(String),

    /// The key store answered with an unexpected status.
    #[error("key store returned {status}: {message}")]
    Service { status: u16, message: String },

    /// The response body could not be interpreted.
    #[error("malformed key store response: {0}")]
    Decode(String),
}

impl KeyStoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, KeyStoreError::NotFound(_))
    }
}

/// The narrow operation set the plugin needs from the key store.
///
/// Implementations must be safe for concurrent use; every operation is
/// stateless from the caller's point of view.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Fetch key metadata. An empty `version` selects the latest version.
    async fn get_key(
        &self,
        vault_base_url: &str,
        name: &str,
        version: &str,
    ) -> Result<KeyBundle, KeyStoreError>;

    /// Create a new key (or a new version of an existing one).
    async fn create_key(
        &self,
        vault_base_url: &str,
        name: &str,
        params: &KeyCreateParams,
    ) -> Result<KeyBundle, KeyStoreError>;

    /// Encrypt the base64url `value` and return the store's result token.
    async fn encrypt(
        &self,
        vault_base_url: &str,
        name: &str,
        version: &str,
        algorithm: EncryptionAlgorithm,
        value: &str,
    ) -> Result<String, KeyStoreError>;

    /// Decrypt a result token and return the store's base64url plaintext.
    async fn decrypt(
        &self,
        vault_base_url: &str,
        name: &str,
        version: &str,
        algorithm: EncryptionAlgorithm,
        value: &str,
    ) -> Result<String, KeyStoreError>;
}

// ---------------------------------------------------------------------------
// Control plane
// ---------------------------------------------------------------------------

/// Location and tier of a vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultInfo {
    /// Base URL of the vault's data plane, without a trailing slash.
    pub base_url: String,
    pub sku: VaultSku,
}

/// Errors from control plane lookups.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("failed to acquire management token: {0}")]
    Credential(String),

    #[error("control plane request failed: {0}")]
    Request(String),

    #[error("control plane returned {status} for {resource}: {message}")]
    Status {
        resource: String,
        status: u16,
        message: String,
    },

    #[error("malformed control plane response for {resource}: {message}")]
    Decode { resource: String, message: String },
}

/// Resolves a vault name to its data-plane URL and tier.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VaultLocator: Send + Sync {
    async fn locate(
        &self,
        subscription_id: &str,
        resource_group: &str,
        vault_name: &str,
    ) -> Result<VaultInfo, ControlPlaneError>;
}

// ---------------------------------------------------------------------------
// Lease store
// ---------------------------------------------------------------------------

/// Errors from the distributed lease store, classified by kind.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LeaseError {
    /// Another holder currently owns the lease.
    #[error("lease already held by another owner")]
    Held,

    /// Any other failure (auth, network, missing storage account, ...).
    #[error("lease store error: {0}")]
    Other(String),
}

/// Mutual-exclusion primitive backed by an external object store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LeaseProvider: Send + Sync {
    /// Create the container if it does not exist yet.
    async fn ensure_container(&self, container: &str) -> Result<(), LeaseError>;

    /// Create an empty blob inside `container` if it does not exist yet.
    async fn ensure_blob(&self, container: &str, blob: &str) -> Result<(), LeaseError>;

    /// Acquire an exclusive lease on the blob and return its lease id.
    ///
    /// Fails with [`LeaseError::Held`] if another owner holds the lease.
    async fn acquire_lease(
        &self,
        container: &str,
        blob: &str,
        duration: Duration,
    ) -> Result<String, LeaseError>;
}

// ---------------------------------------------------------------------------
// Configuration store
// ---------------------------------------------------------------------------

/// Errors from persisting the resolved key version.
#[derive(Debug, Error)]
pub enum ConfigStoreError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is not a JSON object: {message}")]
    Format { path: String, message: String },
}

/// Durable home of the resolved key version.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Record `version` as the configured key version. Overwriting with the
    /// same value is a no-op from the caller's point of view.
    async fn persist_key_version(&self, version: &str) -> Result<(), ConfigStoreError>;
}
