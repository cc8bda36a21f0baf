//! Runtime configuration for the plugin process.
//!
//! Values are read from `AZURE_KMS_*` environment variables at startup. The
//! cloud provider file that names the vault and key is loaded separately, see
//! [`crate::azure::config`].

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::key::PollPolicy;

/// Validated plugin runtime configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Filesystem path of the Unix domain socket the gRPC server binds.
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// Path of the cloud provider JSON file (`azure.json`).
    #[serde(default = "default_config_file_path")]
    pub config_file_path: String,

    /// Address of the debug HTTP endpoint.
    #[serde(default = "default_debug_listen_addr")]
    pub debug_listen_addr: String,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// OTLP endpoint for span export. Spans are not exported when unset.
    #[serde(default)]
    pub otel_exporter_otlp_endpoint: Option<String>,

    /// Seconds between key visibility polls while another replica holds the
    /// creation lease.
    #[serde(default = "default_key_poll_interval")]
    pub key_poll_interval_secs: u64,

    /// Total seconds to wait for another replica's key to become visible.
    #[serde(default = "default_key_poll_timeout")]
    pub key_poll_timeout_secs: u64,

    /// Duration of the creation lease, in seconds.
    #[serde(default = "default_lease_duration")]
    pub lease_duration_secs: u64,

    /// Upper bound on graceful drain. Unbounded when unset.
    #[serde(default)]
    pub drain_timeout_secs: Option<u64>,
}

fn default_socket_path() -> String {
    "/opt/azurekms.socket".into()
}
fn default_config_file_path() -> String {
    "/etc/kubernetes/azure.json".into()
}
fn default_debug_listen_addr() -> String {
    "127.0.0.1:7901".into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_key_poll_interval() -> u64 {
    5
}
fn default_key_poll_timeout() -> u64 {
    60
}
fn default_lease_duration() -> u64 {
    60
}

/// Blob leases are either 15 to 60 seconds long or infinite; infinite leases
/// are never used here.
const LEASE_DURATION_RANGE: std::ops::RangeInclusive<u64> = 15..=60;

impl Config {
    /// Load and validate configuration from `AZURE_KMS_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed or fails validation.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::with_prefix("AZURE_KMS"))
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        ensure_non_empty(&self.socket_path, "AZURE_KMS_SOCKET_PATH")?;
        ensure_non_empty(&self.config_file_path, "AZURE_KMS_CONFIG_FILE_PATH")?;
        self.debug_addr()?;

        if self.key_poll_interval_secs == 0 {
            anyhow::bail!("AZURE_KMS_KEY_POLL_INTERVAL_SECS must be > 0");
        }
        if self.key_poll_interval_secs > self.key_poll_timeout_secs {
            anyhow::bail!(
                "AZURE_KMS_KEY_POLL_INTERVAL_SECS ({}) must not exceed AZURE_KMS_KEY_POLL_TIMEOUT_SECS ({})",
                self.key_poll_interval_secs,
                self.key_poll_timeout_secs
            );
        }
        if !LEASE_DURATION_RANGE.contains(&self.lease_duration_secs) {
            anyhow::bail!(
                "AZURE_KMS_LEASE_DURATION_SECS must be between 15 and 60, got {}",
                self.lease_duration_secs
            );
        }
        Ok(())
    }

    /// The visibility poll policy used while another replica creates the key.
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_secs(self.key_poll_interval_secs),
            Duration::from_secs(self.key_poll_timeout_secs),
        )
    }

    /// The parsed debug endpoint address.
    pub fn debug_addr(&self) -> Result<SocketAddr> {
        self.debug_listen_addr.trim().parse().with_context(|| {
            format!(
                "AZURE_KMS_DEBUG_LISTEN_ADDR is not a socket address: {:?}",
                self.debug_listen_addr
            )
        })
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_secs.map(Duration::from_secs)
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}
