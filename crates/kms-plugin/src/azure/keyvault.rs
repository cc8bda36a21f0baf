//! Key Vault data plane client.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::credential::TokenCredential;
use crate::backend::{EncryptionAlgorithm, KeyBundle, KeyCreateParams, KeyStore, KeyStoreError};

const API_VERSION: &str = "7.4";

/// User agent sent with every data plane request.
pub const USER_AGENT: &str = "k8s-kms-keyvault";

#[derive(Serialize)]
struct CreateKeyBody<'a> {
    kty: &'a str,
    key_size: u32,
    key_ops: Vec<&'a str>,
    attributes: KeyAttributes,
}

#[derive(Serialize)]
struct KeyAttributes {
    enabled: bool,
}

#[derive(Serialize)]
struct KeyOperationBody<'a> {
    alg: &'a str,
    value: &'a str,
}

#[derive(Deserialize)]
struct KeyOperationResult {
    value: String,
}

#[derive(Deserialize)]
struct KeyBundleBody {
    key: JsonWebKey,
}

#[derive(Deserialize)]
struct JsonWebKey {
    kid: String,
}

/// [`KeyStore`] over the Key Vault REST API.
pub struct KeyVaultClient {
    http: reqwest::Client,
    credential: Arc<dyn TokenCredential>,
    /// Token resource of the vault's cloud.
    resource: String,
}

impl KeyVaultClient {
    pub fn new(http: reqwest::Client, credential: Arc<dyn TokenCredential>, resource: &str) -> Self {
        Self {
            http,
            credential,
            resource: resource.to_owned(),
        }
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, KeyStoreError> {
        let token = self
            .credential
            .token(&self.resource)
            .await
            .map_err(|e| KeyStoreError::Unauthorized(e.to_string()))?;
        let resp = request
            .bearer_auth(token)
            .query(&[("api-version", API_VERSION)])
            .send()
            .await
            .map_err(|e| KeyStoreError::Transport(e.to_string()))?;
        let status = resp.status().as_u16();
        let body = resp
            .bytes()
            .await
            .map_err(|e| KeyStoreError::Transport(e.to_string()))?;
        if let Some(err) = status_error(status, &body) {
            return Err(err);
        }
        serde_json::from_slice(&body).map_err(|e| KeyStoreError::Decode(e.to_string()))
    }
}

/// Classify a non-success response. Returns `None` for 2xx.
fn status_error(status: u16, body: &[u8]) -> Option<KeyStoreError> {
    if (200..300).contains(&status) {
        return None;
    }
    let message = error_message(body);
    Some(match status {
        404 => KeyStoreError::NotFound(message),
        401 | 403 => KeyStoreError::Unauthorized(message),
        _ => KeyStoreError::Service { status, message },
    })
}

/// Pull `error.code: error.message` out of a Key Vault error body, falling
/// back to the raw text.
fn error_message(body: &[u8]) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: ErrorDetail,
    }
    #[derive(Deserialize)]
    struct ErrorDetail {
        #[serde(default)]
        code: String,
        #[serde(default)]
        message: String,
    }

    match serde_json::from_slice::<ErrorBody>(body) {
        Ok(ErrorBody { error }) => format!("{}: {}", error.code, error.message),
        Err(_) => String::from_utf8_lossy(body).into_owned(),
    }
}

fn key_url(vault_base_url: &str, name: &str, version: &str) -> String {
    let base = vault_base_url.trim_end_matches('/');
    if version.is_empty() {
        format!("{base}/keys/{name}")
    } else {
        format!("{base}/keys/{name}/{version}")
    }
}

#[async_trait]
impl KeyStore for KeyVaultClient {
    #[instrument(skip(self))]
    async fn get_key(
        &self,
        vault_base_url: &str,
        name: &str,
        version: &str,
    ) -> Result<KeyBundle, KeyStoreError> {
        let body: KeyBundleBody = self
            .send(self.http.get(key_url(vault_base_url, name, version)))
            .await?;
        Ok(KeyBundle { kid: body.key.kid })
    }

    #[instrument(skip(self, params), fields(kty = params.key_type.as_str()))]
    async fn create_key(
        &self,
        vault_base_url: &str,
        name: &str,
        params: &KeyCreateParams,
    ) -> Result<KeyBundle, KeyStoreError> {
        let body = CreateKeyBody {
            kty: params.key_type.as_str(),
            key_size: params.key_size,
            key_ops: params.key_ops.iter().map(|op| op.as_str()).collect(),
            attributes: KeyAttributes {
                enabled: params.enabled,
            },
        };
        let url = format!("{}/create", key_url(vault_base_url, name, ""));
        let created: KeyBundleBody = self.send(self.http.post(url).json(&body)).await?;
        debug!(kid = %created.key.kid, "key created");
        Ok(KeyBundle {
            kid: created.key.kid,
        })
    }

    async fn encrypt(
        &self,
        vault_base_url: &str,
        name: &str,
        version: &str,
        algorithm: EncryptionAlgorithm,
        value: &str,
    ) -> Result<String, KeyStoreError> {
        let url = format!("{}/encrypt", key_url(vault_base_url, name, version));
        let body = KeyOperationBody {
            alg: algorithm.as_str(),
            value,
        };
        let result: KeyOperationResult = self.send(self.http.post(url).json(&body)).await?;
        Ok(result.value)
    }

    async fn decrypt(
        &self,
        vault_base_url: &str,
        name: &str,
        version: &str,
        algorithm: EncryptionAlgorithm,
        value: &str,
    ) -> Result<String, KeyStoreError> {
        let url = format!("{}/decrypt", key_url(vault_base_url, name, version));
        let body = KeyOperationBody {
            alg: algorithm.as_str(),
            value,
        };
        let result: KeyOperationResult = self.send(self.http.post(url).json(&body)).await?;
        Ok(result.value)
    }
}
