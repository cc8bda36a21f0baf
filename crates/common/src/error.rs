//! Common error type returned across the plugin's gRPC boundary.

use thiserror::Error;
use tonic::{Code, Status};

/// Top-level request error.
///
/// Variants map to gRPC status codes returned to the API server:
/// - [`ServiceError::InvalidRequest`] → `InvalidArgument`
/// - [`ServiceError::Configuration`] → `FailedPrecondition`
/// - [`ServiceError::Unavailable`] → `Unavailable`
/// - [`ServiceError::Timeout`] → `DeadlineExceeded`
/// - [`ServiceError::Internal`] → `Internal`
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The request was malformed, e.g. it names an unsupported API version.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The configured key cannot be used as configured (e.g. a pinned version
    /// that does not exist). Retrying will not help until configuration changes.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A remote dependency (key store, control plane, lease store) failed.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The key did not become visible within the allotted wait.
    #[error("timed out: {0}")]
    Timeout(String),

    /// An unexpected internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Returns the gRPC status code that should be sent for this error.
    pub fn grpc_code(&self) -> Code {
        match self {
            ServiceError::InvalidRequest(_) => Code::InvalidArgument,
            ServiceError::Configuration(_) => Code::FailedPrecondition,
            ServiceError::Unavailable(_) => Code::Unavailable,
            ServiceError::Timeout(_) => Code::DeadlineExceeded,
            ServiceError::Internal(_) => Code::Internal,
        }
    }
}

impl From<ServiceError> for Status {
    fn from(err: ServiceError) -> Self {
        Status::new(err.grpc_code(), err.to_string())
    }
}
