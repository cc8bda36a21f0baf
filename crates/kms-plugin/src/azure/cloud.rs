//! Endpoints of the Azure clouds the plugin can run in.

use std::str::FromStr;

use thiserror::Error;

/// The endpoints that differ between Azure clouds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudEnvironment {
    pub name: &'static str,
    /// Azure AD authority, with trailing slash.
    pub active_directory_endpoint: &'static str,
    /// Azure Resource Manager endpoint, with trailing slash. Also the token
    /// resource for control plane calls.
    pub resource_manager_endpoint: &'static str,
    /// Token resource for Key Vault data plane calls.
    pub key_vault_resource: &'static str,
    /// DNS suffix of storage accounts, e.g. `core.windows.net`.
    pub storage_endpoint_suffix: &'static str,
}

pub const AZURE_PUBLIC_CLOUD: CloudEnvironment = CloudEnvironment {
    name: "AzurePublicCloud",
    active_directory_endpoint: "https://login.microsoftonline.com/",
    resource_manager_endpoint: "https://management.azure.com/",
    key_vault_resource: "https://vault.azure.net",
    storage_endpoint_suffix: "core.windows.net",
};

pub const AZURE_CHINA_CLOUD: CloudEnvironment = CloudEnvironment {
    name: "AzureChinaCloud",
    active_directory_endpoint: "https://login.chinacloudapi.cn/",
    resource_manager_endpoint: "https://management.chinacloudapi.cn/",
    key_vault_resource: "https://vault.azure.cn",
    storage_endpoint_suffix: "core.chinacloudapi.cn",
};

pub const AZURE_US_GOVERNMENT_CLOUD: CloudEnvironment = CloudEnvironment {
    name: "AzureUSGovernmentCloud",
    active_directory_endpoint: "https://login.microsoftonline.us/",
    resource_manager_endpoint: "https://management.usgovcloudapi.net/",
    key_vault_resource: "https://vault.usgovcloudapi.net",
    storage_endpoint_suffix: "core.usgovcloudapi.net",
};

pub const AZURE_GERMAN_CLOUD: CloudEnvironment = CloudEnvironment {
    name: "AzureGermanCloud",
    active_directory_endpoint: "https://login.microsoftonline.de/",
    resource_manager_endpoint: "https://management.microsoftazure.de/",
    key_vault_resource: "https://vault.microsoftazure.de",
    storage_endpoint_suffix: "core.cloudapi.de",
};

const ALL: [&CloudEnvironment; 4] = [
    &AZURE_PUBLIC_CLOUD,
    &AZURE_CHINA_CLOUD,
    &AZURE_US_GOVERNMENT_CLOUD,
    &AZURE_GERMAN_CLOUD,
];

#[derive(Debug, Error)]
#[error("unknown cloud environment {0:?}")]
pub struct UnknownCloud(String);

impl FromStr for CloudEnvironment {
    type Err = UnknownCloud;

    /// Case-insensitive lookup by name. An empty name selects the public cloud.
    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(AZURE_PUBLIC_CLOUD);
        }
        ALL.iter()
            .find(|env| env.name.eq_ignore_ascii_case(name))
            .map(|env| (*env).clone())
            .ok_or_else(|| UnknownCloud(name.to_owned()))
    }
}

impl CloudEnvironment {
    /// Blob service endpoint of a storage account, without trailing slash.
    pub fn blob_endpoint(&self, account: &str) -> String {
        format!("https://{account}.blob.{}", self.storage_endpoint_suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_name_is_public_cloud() {
        assert_eq!("".parse::<CloudEnvironment>().unwrap(), AZURE_PUBLIC_CLOUD);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let env: CloudEnvironment = "azurechinacloud".parse().unwrap();
        assert_eq!(env.storage_endpoint_suffix, "core.chinacloudapi.cn");
    }

    #[test]
    fn unknown_cloud_is_rejected() {
        assert!("AzureStackCloud".parse::<CloudEnvironment>().is_err());
    }

    #[test]
    fn blob_endpoint() {
        assert_eq!(
            AZURE_PUBLIC_CLOUD.blob_endpoint("kmsvault"),
            "https://kmsvault.blob.core.windows.net"
        );
    }
}
