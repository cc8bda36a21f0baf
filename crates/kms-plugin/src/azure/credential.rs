//! Azure AD bearer tokens for the control plane, Key Vault and storage.
//!
//! Two grants are supported: the client-credentials grant with the service
//! principal from `azure.json`, and managed identity through the instance
//! metadata service. Tokens are cached per resource and refreshed shortly
//! before they expire.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// Managed identity token endpoint of the instance metadata service.
const IMDS_TOKEN_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

/// Tokens are refreshed once they are this close to expiry.
const REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// Lifetime assumed when a token response carries no expiry.
const DEFAULT_LIFETIME: Duration = Duration::from_secs(3600);

/// Errors from token acquisition.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("token request failed: {0}")]
    Request(String),

    #[error("token endpoint returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("malformed token response: {0}")]
    Decode(String),
}

/// Source of bearer tokens for a given resource.
#[async_trait]
pub trait TokenCredential: Send + Sync {
    async fn token(&self, resource: &str) -> Result<String, CredentialError>;
}

/// How the plugin authenticates to Azure AD.
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialSource {
    ClientSecret {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
    ManagedIdentity {
        /// Client id of a user-assigned identity; system-assigned when `None`.
        client_id: Option<String>,
    },
}

impl std::fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialSource::ClientSecret {
                tenant_id,
                client_id,
                ..
            } => f
                .debug_struct("ClientSecret")
                .field("tenant_id", tenant_id)
                .field("client_id", client_id)
                .field("client_secret", &"[REDACTED]")
                .finish(),
            CredentialSource::ManagedIdentity { client_id } => f
                .debug_struct("ManagedIdentity")
                .field("client_id", client_id)
                .finish(),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Seconds until expiry. Azure AD sends a string, IMDS sometimes a number.
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
}

impl TokenResponse {
    fn lifetime(&self) -> Duration {
        let secs = match &self.expires_in {
            Some(serde_json::Value::Number(n)) => n.as_u64(),
            Some(serde_json::Value::String(s)) => s.parse().ok(),
            _ => None,
        };
        secs.map(Duration::from_secs).unwrap_or(DEFAULT_LIFETIME)
    }
}

struct CachedToken {
    token: String,
    refresh_at: Instant,
}

/// Token provider backed by Azure AD, with a per-resource cache.
pub struct AzureCredential {
    http: reqwest::Client,
    source: CredentialSource,
    authority: String,
    cache: Mutex<HashMap<String, CachedToken>>,
}

impl AzureCredential {
    /// `authority` is the cloud's Azure AD endpoint, with trailing slash.
    pub fn new(http: reqwest::Client, source: CredentialSource, authority: &str) -> Self {
        Self {
            http,
            source,
            authority: authority.to_owned(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn fetch(&self, resource: &str) -> Result<TokenResponse, CredentialError> {
        let request = match &self.source {
            CredentialSource::ClientSecret {
                tenant_id,
                client_id,
                client_secret,
            } => self
                .http
                .post(format!("{}{tenant_id}/oauth2/token", self.authority))
                .form(&[
                    ("grant_type", "client_credentials"),
                    ("client_id", client_id.as_str()),
                    ("client_secret", client_secret.as_str()),
                    ("resource", resource),
                ]),
            CredentialSource::ManagedIdentity { client_id } => {
                let mut query = vec![("api-version", "2018-02-01"), ("resource", resource)];
                if let Some(id) = client_id {
                    query.push(("client_id", id.as_str()));
                }
                self.http
                    .get(IMDS_TOKEN_ENDPOINT)
                    .header("Metadata", "true")
                    .query(&query)
            }
        };

        let resp = request
            .send()
            .await
            .map_err(|e| CredentialError::Request(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(CredentialError::Status {
                status: status.as_u16(),
                message,
            });
        }
        resp.json::<TokenResponse>()
            .await
            .map_err(|e| CredentialError::Decode(e.to_string()))
    }
}

#[async_trait]
impl TokenCredential for AzureCredential {
    async fn token(&self, resource: &str) -> Result<String, CredentialError> {
        // Held across the fetch so concurrent callers share one token request.
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.get(resource) {
            if Instant::now() < cached.refresh_at {
                return Ok(cached.token.clone());
            }
        }

        let resp = self.fetch(resource).await?;
        let refresh_at = Instant::now() + resp.lifetime().saturating_sub(REFRESH_MARGIN);
        debug!(resource, lifetime = ?resp.lifetime(), "acquired access token");
        cache.insert(
            resource.to_owned(),
            CachedToken {
                token: resp.access_token.clone(),
                refresh_at,
            },
        );
        Ok(resp.access_token)
    }
}
