//! The cloud provider file (`azure.json`) shared with other node components.
//!
//! The plugin reads the subscription, vault, key and credential fields from
//! it at startup and writes `providerKeyVersion` back once a key version has
//! been discovered or created. Every other field is preserved on write.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::cloud::CloudEnvironment;
use super::credential::CredentialSource;
use crate::backend::{ConfigStore, ConfigStoreError};
use crate::key::KeyReference;

/// JSON field the resolved key version is written to.
const KEY_VERSION_FIELD: &str = "providerKeyVersion";

/// Fields of `azure.json` used by the plugin.
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AzureConfig {
    pub cloud: String,
    pub tenant_id: String,
    pub subscription_id: String,
    pub resource_group: String,
    pub aad_client_id: String,
    pub aad_client_secret: String,
    pub use_managed_identity_extension: bool,
    #[serde(rename = "userAssignedIdentityID")]
    pub user_assigned_identity_id: String,
    pub provider_vault_name: String,
    pub provider_key_name: String,
    pub provider_key_version: String,
}

impl std::fmt::Debug for AzureConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureConfig")
            .field("cloud", &self.cloud)
            .field("tenant_id", &self.tenant_id)
            .field("subscription_id", &self.subscription_id)
            .field("resource_group", &self.resource_group)
            .field("aad_client_id", &self.aad_client_id)
            .field("aad_client_secret", &"[REDACTED]")
            .field("use_managed_identity_extension", &self.use_managed_identity_extension)
            .field("user_assigned_identity_id", &self.user_assigned_identity_id)
            .field("provider_vault_name", &self.provider_vault_name)
            .field("provider_key_name", &self.provider_key_name)
            .field("provider_key_version", &self.provider_key_version)
            .finish()
    }
}

impl AzureConfig {
    /// Read, parse and validate the provider file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if a required
    /// field is missing.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .with_context(|| format!("failed to read cloud provider config {}", path.display()))?;
        let cfg: AzureConfig = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse cloud provider config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        ensure_non_empty(&self.subscription_id, "subscriptionId")?;
        ensure_non_empty(&self.resource_group, "resourceGroup")?;
        ensure_non_empty(&self.provider_vault_name, "providerVaultName")?;
        ensure_non_empty(&self.provider_key_name, "providerKeyName")?;
        if !self.use_managed_identity_extension {
            ensure_non_empty(&self.tenant_id, "tenantId")?;
            ensure_non_empty(&self.aad_client_id, "aadClientId")?;
            ensure_non_empty(&self.aad_client_secret, "aadClientSecret")?;
        }
        self.cloud_environment()?;
        Ok(())
    }

    pub fn cloud_environment(&self) -> Result<CloudEnvironment> {
        Ok(self.cloud.parse()?)
    }

    /// The key this configuration names. An empty version is unpinned.
    pub fn key_reference(&self) -> KeyReference {
        let version = self.provider_key_version.trim();
        KeyReference {
            subscription_id: self.subscription_id.clone(),
            resource_group: self.resource_group.clone(),
            vault_name: self.provider_vault_name.clone(),
            key_name: self.provider_key_name.clone(),
            key_version: (!version.is_empty()).then(|| version.to_owned()),
        }
    }

    pub fn credential_source(&self) -> CredentialSource {
        if self.use_managed_identity_extension {
            let client_id = self.user_assigned_identity_id.trim();
            CredentialSource::ManagedIdentity {
                client_id: (!client_id.is_empty()).then(|| client_id.to_owned()),
            }
        } else {
            CredentialSource::ClientSecret {
                tenant_id: self.tenant_id.clone(),
                client_id: self.aad_client_id.clone(),
                client_secret: self.aad_client_secret.clone(),
            }
        }
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("missing {name} in cloud provider config");
    }
    Ok(())
}

/// Persists the key version into the provider file.
///
/// Writes go to a sibling temporary file that is then renamed over the
/// original, so a crash never leaves a truncated config behind.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn display(&self) -> String {
        self.path.display().to_string()
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn persist_key_version(&self, version: &str) -> Result<(), ConfigStoreError> {
        let raw = tokio::fs::read(&self.path)
            .await
            .map_err(|source| ConfigStoreError::Read {
                path: self.display(),
                source,
            })?;
        // The file carries the client secret; the replacement keeps its mode.
        let perms = tokio::fs::metadata(&self.path)
            .await
            .map_err(|source| ConfigStoreError::Read {
                path: self.display(),
                source,
            })?
            .permissions();
        let mut doc: serde_json::Value =
            serde_json::from_slice(&raw).map_err(|e| ConfigStoreError::Format {
                path: self.display(),
                message: e.to_string(),
            })?;
        let fields = doc.as_object_mut().ok_or_else(|| ConfigStoreError::Format {
            path: self.display(),
            message: "top-level value is not an object".into(),
        })?;

        if fields.get(KEY_VERSION_FIELD).and_then(|v| v.as_str()) == Some(version) {
            return Ok(());
        }
        fields.insert(KEY_VERSION_FIELD.into(), version.into());

        let out = serde_json::to_vec_pretty(&doc).map_err(|e| ConfigStoreError::Format {
            path: self.display(),
            message: e.to_string(),
        })?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        write_with_permissions(&tmp, &out, perms)
            .await
            .map_err(|source| ConfigStoreError::Write {
                path: tmp.display().to_string(),
                source,
            })?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| ConfigStoreError::Write {
                path: self.display(),
                source,
            })?;

        info!(path = %self.display(), key_version = version, "persisted key version");
        Ok(())
    }
}

/// Write `contents` to a fresh `path` that is never readable beyond `perms`.
async fn write_with_permissions(
    path: &Path,
    contents: &[u8],
    perms: std::fs::Permissions,
) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(perms.mode())
        .open(path)
        .await?;
    // `mode` only applies on creation; a leftover temp file keeps its own.
    file.set_permissions(perms).await?;
    file.write_all(contents).await?;
    file.sync_all().await
}
