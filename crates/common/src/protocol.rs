//! The Kubernetes KMS `v1beta1` plugin protocol.
//!
//! Message and service types are generated from `proto/v1beta1/service.proto`
//! at build time. The constants below are the fixed identity the plugin
//! reports from the `Version` call.

/// Generated gRPC types for the `v1beta1` KMS plugin API.
pub mod v1beta1 {
    tonic::include_proto!("v1beta1");
}

pub use v1beta1::{
    DecryptRequest, DecryptResponse, EncryptRequest, EncryptResponse, VersionRequest,
    VersionResponse,
};

/// KMS plugin API version implemented by this plugin.
pub const API_VERSION: &str = "v1beta1";

/// Runtime name reported to the API server.
pub const RUNTIME_NAME: &str = "Microsoft AzureKMS";

/// Runtime version reported to the API server.
pub const RUNTIME_VERSION: &str = "0.0.9";

impl VersionResponse {
    /// The fixed identity of this plugin.
    pub fn current() -> Self {
        Self {
            version: API_VERSION.into(),
            runtime_name: RUNTIME_NAME.into(),
            runtime_version: RUNTIME_VERSION.into(),
        }
    }
}

/// Returns `true` if a request carrying `version` may be served.
///
/// An empty version is accepted; older API servers do not populate it.
pub fn is_supported_version(version: &str) -> bool {
    version.is_empty() || version == API_VERSION
}
