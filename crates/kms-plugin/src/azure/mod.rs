//! Azure implementations of the backend capabilities.
//!
//! Every call goes over HTTPS with `reqwest`: Azure AD for tokens, Resource
//! Manager for vault and storage account metadata, the Key Vault data plane
//! for key operations, and Blob storage for the creation lease.

pub mod blob;
pub mod cloud;
pub mod clients;
pub mod config;
pub mod credential;
pub mod keyvault;
pub mod management;

pub use clients::AzureClients;
pub use config::{AzureConfig, FileConfigStore};
