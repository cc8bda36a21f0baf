//! The `v1beta1` KeyManagementService served to the API server.

use std::time::Instant;

use tonic::{Request, Response, Status};
use tracing::{debug, warn};

use common::protocol::v1beta1::key_management_service_server::KeyManagementService;
use common::protocol::{
    is_supported_version, DecryptRequest, DecryptResponse, EncryptRequest, EncryptResponse,
    VersionRequest, VersionResponse, API_VERSION,
};
use common::ServiceError;

use super::state::PluginState;

/// gRPC front end over the envelope layer.
#[derive(Clone)]
pub struct KmsService {
    state: PluginState,
}

impl KmsService {
    pub fn new(state: PluginState) -> Self {
        Self { state }
    }
}

fn check_version(version: &str) -> Result<(), Status> {
    if is_supported_version(version) {
        Ok(())
    } else {
        Err(ServiceError::InvalidRequest(format!(
            "unsupported API version {version:?}, expected {API_VERSION}"
        ))
        .into())
    }
}

#[tonic::async_trait]
impl KeyManagementService for KmsService {
    async fn version(
        &self,
        _request: Request<VersionRequest>,
    ) -> Result<Response<VersionResponse>, Status> {
        Ok(Response::new(VersionResponse::current()))
    }

    async fn encrypt(
        &self,
        request: Request<EncryptRequest>,
    ) -> Result<Response<EncryptResponse>, Status> {
        let req = request.into_inner();
        check_version(&req.version)?;

        let started = Instant::now();
        match self.state.envelope.encrypt(&req.plain).await {
            Ok(cipher) => {
                debug!(elapsed = ?started.elapsed(), "encrypt succeeded");
                Ok(Response::new(EncryptResponse { cipher }))
            }
            Err(e) => {
                warn!(error = %e, elapsed = ?started.elapsed(), "encrypt failed");
                Err(ServiceError::from(e).into())
            }
        }
    }

    async fn decrypt(
        &self,
        request: Request<DecryptRequest>,
    ) -> Result<Response<DecryptResponse>, Status> {
        let req = request.into_inner();
        check_version(&req.version)?;

        let started = Instant::now();
        match self.state.envelope.decrypt(&req.cipher).await {
            Ok(plain) => {
                debug!(elapsed = ?started.elapsed(), "decrypt succeeded");
                Ok(Response::new(DecryptResponse { plain }))
            }
            Err(e) => {
                warn!(error = %e, elapsed = ?started.elapsed(), "decrypt failed");
                Err(ServiceError::from(e).into())
            }
        }
    }
}
