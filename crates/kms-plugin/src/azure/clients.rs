//! Azure client bundle built from the cloud provider file.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use super::blob::BlobLeaseClient;
use super::config::AzureConfig;
use super::credential::AzureCredential;
use super::keyvault::{KeyVaultClient, USER_AGENT};
use super::management::ArmClient;

/// Upper bound on any single Azure request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Bundle of Azure clients sharing one HTTP connection pool and one
/// token credential.
#[derive(Clone)]
pub struct AzureClients {
    /// Vault lookups and storage account keys.
    pub arm: Arc<ArmClient>,
    /// Key metadata, creation, and wrap/unwrap.
    pub keyvault: Arc<KeyVaultClient>,
    /// Creation lock in the storage account named after the vault.
    pub leases: Arc<BlobLeaseClient>,
}

impl AzureClients {
    /// Initialise all clients for the cloud and identity named in `cfg`.
    ///
    /// No request is sent here; credentials are exercised on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the cloud name is unknown or the HTTP client
    /// cannot be built.
    pub fn init(cfg: &AzureConfig) -> Result<Self> {
        let cloud = cfg.cloud_environment()?;
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;

        let credential = Arc::new(AzureCredential::new(
            http.clone(),
            cfg.credential_source(),
            cloud.active_directory_endpoint,
        ));

        let keyvault = Arc::new(KeyVaultClient::new(
            http.clone(),
            credential.clone(),
            cloud.key_vault_resource,
        ));

        // The lease storage account shares the vault's name.
        let account = cfg.provider_vault_name.as_str();
        let blob_endpoint = cloud.blob_endpoint(account);
        let arm = Arc::new(ArmClient::new(http.clone(), credential, cloud));
        let leases = Arc::new(BlobLeaseClient::new(
            http,
            arm.clone(),
            &cfg.subscription_id,
            &cfg.resource_group,
            account,
            blob_endpoint,
        ));

        Ok(Self {
            arm,
            keyvault,
            leases,
        })
    }
}
