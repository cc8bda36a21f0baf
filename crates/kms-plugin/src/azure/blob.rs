//! Blob storage leases used as a cross-replica creation lock.
//!
//! Requests are authorized with the storage account's Shared Key. The key is
//! listed through the management API the first time a lease operation runs,
//! so replicas that never need to create a key never touch storage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use sha2::Sha256;
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

use super::management::ArmClient;
use crate::backend::{LeaseError, LeaseProvider};

const STORAGE_API_VERSION: &str = "2021-08-06";

/// Error code returned when a lease is requested on an already leased blob.
const LEASE_ALREADY_PRESENT: &str = "LeaseAlreadyPresent";

/// A storage request as seen by the Shared Key signer.
#[derive(Debug, Clone)]
struct StorageRequest {
    method: Method,
    /// `/{container}` or `/{container}/{blob}`.
    path: String,
    query: Vec<(&'static str, String)>,
    /// `x-ms-*` headers, sent and signed.
    ms_headers: Vec<(&'static str, String)>,
    if_none_match: Option<&'static str>,
}

impl StorageRequest {
    fn new(method: Method, path: String) -> Self {
        Self {
            method,
            path,
            query: Vec::new(),
            ms_headers: Vec::new(),
            if_none_match: None,
        }
    }

    fn query(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.query.push((name, value.into()));
        self
    }

    fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.ms_headers.push((name, value.into()));
        self
    }
}

/// Build the Shared Key string-to-sign for `req` against `account`.
///
/// Bodies are always empty, so Content-Length is signed as the empty string.
fn string_to_sign(account: &str, req: &StorageRequest) -> String {
    let mut headers: Vec<(String, &str)> = req
        .ms_headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.trim()))
        .collect();
    headers.sort();

    let mut query: Vec<(String, &str)> = req
        .query
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.as_str()))
        .collect();
    query.sort();

    let mut out = String::new();
    out.push_str(req.method.as_str());
    out.push('\n');
    // Content-Encoding, Content-Language, Content-Length, Content-MD5,
    // Content-Type, Date, If-Modified-Since, If-Match.
    out.push_str(&"\n".repeat(8));
    out.push_str(req.if_none_match.unwrap_or(""));
    out.push('\n');
    // If-Unmodified-Since, Range.
    out.push_str("\n\n");
    for (name, value) in &headers {
        out.push_str(name);
        out.push(':');
        out.push_str(value);
        out.push('\n');
    }
    out.push('/');
    out.push_str(account);
    out.push_str(&req.path);
    for (name, value) in &query {
        out.push('\n');
        out.push_str(name);
        out.push(':');
        out.push_str(value);
    }
    out
}

/// HMAC-SHA256 of `payload` under the decoded account key, base64 encoded.
fn sign(key: &[u8], payload: &str) -> Result<String, LeaseError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| LeaseError::Other(format!("invalid storage account key: {e}")))?;
    mac.update(payload.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

fn rfc1123_now() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// Outcome of a storage request, reduced to what the lease protocol needs.
struct StorageResponse {
    status: StatusCode,
    error_code: Option<String>,
    lease_id: Option<String>,
}

/// [`LeaseProvider`] backed by blob leases in a storage account.
pub struct BlobLeaseClient {
    http: reqwest::Client,
    arm: Arc<ArmClient>,
    subscription_id: String,
    resource_group: String,
    account: String,
    endpoint: String,
    key: OnceCell<Vec<u8>>,
}

impl BlobLeaseClient {
    /// `endpoint` is the account's blob endpoint, e.g.
    /// `https://<account>.blob.core.windows.net`.
    pub fn new(
        http: reqwest::Client,
        arm: Arc<ArmClient>,
        subscription_id: &str,
        resource_group: &str,
        account: &str,
        endpoint: String,
    ) -> Self {
        Self {
            http,
            arm,
            subscription_id: subscription_id.to_owned(),
            resource_group: resource_group.to_owned(),
            account: account.to_owned(),
            endpoint: endpoint.trim_end_matches('/').to_owned(),
            key: OnceCell::new(),
        }
    }

    async fn account_key(&self) -> Result<&[u8], LeaseError> {
        let key = self
            .key
            .get_or_try_init(|| async {
                let encoded = self
                    .arm
                    .storage_account_key(&self.subscription_id, &self.resource_group, &self.account)
                    .await
                    .map_err(|e| LeaseError::Other(e.to_string()))?;
                STANDARD
                    .decode(encoded)
                    .map_err(|e| LeaseError::Other(format!("storage account key is not base64: {e}")))
            })
            .await?;
        Ok(key.as_slice())
    }

    async fn execute(&self, req: StorageRequest) -> Result<StorageResponse, LeaseError> {
        let key = self.account_key().await?;
        let req = req
            .header("x-ms-date", rfc1123_now())
            .header("x-ms-version", STORAGE_API_VERSION);
        let signature = sign(key, &string_to_sign(&self.account, &req))?;

        let mut builder = self
            .http
            .request(req.method.clone(), format!("{}{}", self.endpoint, req.path))
            .query(&req.query)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("SharedKey {}:{signature}", self.account),
            );
        for (name, value) in &req.ms_headers {
            builder = builder.header(*name, value);
        }
        if let Some(tag) = req.if_none_match {
            builder = builder.header(reqwest::header::IF_NONE_MATCH, tag);
        }
        if req.method == Method::PUT {
            builder = builder.body(Vec::new());
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| LeaseError::Other(format!("storage request failed: {e}")))?;
        let header = |name: &str| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };
        Ok(StorageResponse {
            status: resp.status(),
            error_code: header("x-ms-error-code"),
            lease_id: header("x-ms-lease-id"),
        })
    }

    fn unexpected(&self, what: &str, resp: &StorageResponse) -> LeaseError {
        LeaseError::Other(format!(
            "{what} on account {} returned {} ({})",
            self.account,
            resp.status,
            resp.error_code.as_deref().unwrap_or("no error code")
        ))
    }
}

/// Map a lease acquisition response to its outcome.
fn lease_outcome(resp: StorageResponse) -> Result<String, LeaseError> {
    match resp.status {
        StatusCode::CREATED => resp
            .lease_id
            .ok_or_else(|| LeaseError::Other("lease response carried no lease id".into())),
        StatusCode::CONFLICT if resp.error_code.as_deref() == Some(LEASE_ALREADY_PRESENT) => {
            Err(LeaseError::Held)
        }
        status => Err(LeaseError::Other(format!(
            "lease acquisition returned {status} ({})",
            resp.error_code.as_deref().unwrap_or("no error code")
        ))),
    }
}

#[async_trait]
impl LeaseProvider for BlobLeaseClient {
    #[instrument(skip(self))]
    async fn ensure_container(&self, container: &str) -> Result<(), LeaseError> {
        let path = format!("/{container}");
        let probe = self
            .execute(StorageRequest::new(Method::GET, path.clone()).query("restype", "container"))
            .await?;
        match probe.status {
            StatusCode::OK => return Ok(()),
            StatusCode::NOT_FOUND => {}
            _ => return Err(self.unexpected("container lookup", &probe)),
        }

        // Containers are private; only the account key can lease blobs.
        let created = self
            .execute(StorageRequest::new(Method::PUT, path).query("restype", "container"))
            .await?;
        match created.status {
            StatusCode::CREATED | StatusCode::CONFLICT => {
                debug!(container, "lease container ready");
                Ok(())
            }
            _ => Err(self.unexpected("container creation", &created)),
        }
    }

    #[instrument(skip(self))]
    async fn ensure_blob(&self, container: &str, blob: &str) -> Result<(), LeaseError> {
        let path = format!("/{container}/{blob}");
        let probe = self
            .execute(StorageRequest::new(Method::HEAD, path.clone()))
            .await?;
        match probe.status {
            StatusCode::OK => return Ok(()),
            StatusCode::NOT_FOUND => {}
            _ => return Err(self.unexpected("blob lookup", &probe)),
        }

        let mut req = StorageRequest::new(Method::PUT, path).header("x-ms-blob-type", "BlockBlob");
        // Never overwrite a blob another replica created (and may have leased).
        req.if_none_match = Some("*");
        let created = self.execute(req).await?;
        match created.status {
            StatusCode::CREATED | StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => Ok(()),
            _ => Err(self.unexpected("blob creation", &created)),
        }
    }

    #[instrument(skip(self))]
    async fn acquire_lease(
        &self,
        container: &str,
        blob: &str,
        duration: Duration,
    ) -> Result<String, LeaseError> {
        let req = StorageRequest::new(Method::PUT, format!("/{container}/{blob}"))
            .query("comp", "lease")
            .header("x-ms-lease-action", "acquire")
            .header("x-ms-lease-duration", duration.as_secs().to_string())
            .header("x-ms-proposed-lease-id", uuid::Uuid::new_v4().to_string());
        lease_outcome(self.execute(req).await?)
    }
}
