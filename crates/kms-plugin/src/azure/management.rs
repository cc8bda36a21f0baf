//! Azure Resource Manager lookups: vault location and storage account keys.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

use super::cloud::CloudEnvironment;
use super::credential::TokenCredential;
use crate::backend::{ControlPlaneError, VaultInfo, VaultLocator, VaultSku};

const VAULT_API_VERSION: &str = "2022-07-01";
const STORAGE_API_VERSION: &str = "2023-01-01";

#[derive(Deserialize)]
struct VaultResource {
    properties: VaultProperties,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VaultProperties {
    vault_uri: String,
    sku: VaultSkuProperty,
}

#[derive(Deserialize)]
struct VaultSkuProperty {
    name: String,
}

#[derive(Deserialize)]
struct StorageKeyList {
    keys: Vec<StorageKey>,
}

#[derive(Deserialize)]
struct StorageKey {
    value: String,
}

/// Client for the management endpoint of one subscription's cloud.
pub struct ArmClient {
    http: reqwest::Client,
    credential: Arc<dyn TokenCredential>,
    cloud: CloudEnvironment,
}

impl ArmClient {
    pub fn new(
        http: reqwest::Client,
        credential: Arc<dyn TokenCredential>,
        cloud: CloudEnvironment,
    ) -> Self {
        Self {
            http,
            credential,
            cloud,
        }
    }

    fn resource_url(&self, subscription_id: &str, resource_group: &str, path: &str) -> String {
        format!(
            "{}subscriptions/{subscription_id}/resourceGroups/{resource_group}/providers/{path}",
            self.cloud.resource_manager_endpoint
        )
    }

    async fn send(
        &self,
        resource: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<Vec<u8>, ControlPlaneError> {
        let token = self
            .credential
            .token(self.cloud.resource_manager_endpoint)
            .await
            .map_err(|e| ControlPlaneError::Credential(e.to_string()))?;
        let resp = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ControlPlaneError::Request(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| ControlPlaneError::Request(e.to_string()))?;
        if !status.is_success() {
            return Err(ControlPlaneError::Status {
                resource: resource.to_owned(),
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(body.to_vec())
    }

    /// Primary access key of the storage account `account`.
    ///
    /// # Errors
    ///
    /// Fails if the account does not exist, the caller may not list its keys,
    /// or the response lists no keys.
    #[instrument(skip(self))]
    pub async fn storage_account_key(
        &self,
        subscription_id: &str,
        resource_group: &str,
        account: &str,
    ) -> Result<String, ControlPlaneError> {
        let url = self.resource_url(
            subscription_id,
            resource_group,
            &format!("Microsoft.Storage/storageAccounts/{account}/listKeys"),
        );
        let request = self
            .http
            .post(url)
            .query(&[("api-version", STORAGE_API_VERSION)])
            .header(reqwest::header::CONTENT_LENGTH, 0);
        let body = self.send(account, request).await?;
        parse_storage_key(account, &body)
    }
}

fn parse_vault(vault_name: &str, body: &[u8]) -> Result<VaultInfo, ControlPlaneError> {
    let vault: VaultResource =
        serde_json::from_slice(body).map_err(|e| ControlPlaneError::Decode {
            resource: vault_name.to_owned(),
            message: e.to_string(),
        })?;
    let base_url = vault.properties.vault_uri.trim_end_matches('/');
    if base_url.is_empty() {
        return Err(ControlPlaneError::Decode {
            resource: vault_name.to_owned(),
            message: "empty vaultUri".into(),
        });
    }
    Ok(VaultInfo {
        base_url: base_url.to_owned(),
        sku: VaultSku::from_name(&vault.properties.sku.name),
    })
}

fn parse_storage_key(account: &str, body: &[u8]) -> Result<String, ControlPlaneError> {
    let list: StorageKeyList =
        serde_json::from_slice(body).map_err(|e| ControlPlaneError::Decode {
            resource: account.to_owned(),
            message: e.to_string(),
        })?;
    list.keys
        .into_iter()
        .next()
        .map(|k| k.value)
        .ok_or_else(|| ControlPlaneError::Decode {
            resource: account.to_owned(),
            message: "no access keys listed".into(),
        })
}

#[async_trait]
impl VaultLocator for ArmClient {
    #[instrument(skip(self))]
    async fn locate(
        &self,
        subscription_id: &str,
        resource_group: &str,
        vault_name: &str,
    ) -> Result<VaultInfo, ControlPlaneError> {
        let url = self.resource_url(
            subscription_id,
            resource_group,
            &format!("Microsoft.KeyVault/vaults/{vault_name}"),
        );
        let request = self
            .http
            .get(url)
            .query(&[("api-version", VAULT_API_VERSION)]);
        let body = self.send(vault_name, request).await?;
        let info = parse_vault(vault_name, &body)?;
        debug!(vault_url = %info.base_url, sku = ?info.sku, "located vault");
        Ok(info)
    }
}
