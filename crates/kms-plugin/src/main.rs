//! `azurekms`: Kubernetes KMS plugin entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise the telemetry pipeline (tracing + optional OTLP).
//! 3. Load the cloud provider file and build the [`key::KeyReference`].
//! 4. Initialise the Azure clients.
//! 5. Wire the key resolver and the envelope layer. The key itself is
//!    resolved lazily on the first Encrypt or Decrypt.
//! 6. Bind the debug endpoint and the Unix socket, serve both until SIGTERM
//!    or SIGINT, then drain and exit. A bind failure exits non-zero.

mod azure;
mod backend;
mod config;
mod envelope;
mod key;
mod server;
mod telemetry;

#[cfg(test)]
mod testing;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use azure::{AzureClients, AzureConfig, FileConfigStore};
use config::Config;
use envelope::Envelope;
use key::{KeyCreator, KeyResolver};
use server::{PluginState, ServerPhase};

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e:#}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init_telemetry(&cfg.log_level, cfg.otel_exporter_otlp_endpoint.as_deref())?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        socket_path = %cfg.socket_path,
        config_file = %cfg.config_file_path,
        "azure kms plugin starting"
    );

    // -----------------------------------------------------------------------
    // 3. Cloud provider configuration
    // -----------------------------------------------------------------------
    let azure_cfg = AzureConfig::load(Path::new(&cfg.config_file_path))?;
    let reference = azure_cfg.key_reference();
    info!(
        vault = %reference.vault_name,
        key_name = %reference.key_name,
        pinned = reference.is_pinned(),
        key_version = reference.key_version.as_deref().unwrap_or("<unpinned>"),
        "loaded key reference"
    );

    // -----------------------------------------------------------------------
    // 4. Azure clients
    // -----------------------------------------------------------------------
    let clients = AzureClients::init(&azure_cfg)?;

    // -----------------------------------------------------------------------
    // 5. Key resolution and envelope layer
    // -----------------------------------------------------------------------
    let creator = KeyCreator::new(
        clients.leases.clone(),
        clients.keyvault.clone(),
        cfg.lease_duration(),
        cfg.poll_policy(),
    );
    let resolver = KeyResolver::new(
        reference,
        clients.arm.clone(),
        clients.keyvault.clone(),
        creator,
        Arc::new(FileConfigStore::new(&cfg.config_file_path)),
    );
    let state = PluginState::new(Envelope::new(Arc::new(resolver)));
    state.advance(ServerPhase::Listening);

    // -----------------------------------------------------------------------
    // 6. Servers
    // -----------------------------------------------------------------------
    let shutdown = CancellationToken::new();
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let token = shutdown.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = tokio::signal::ctrl_c() => "SIGINT",
        };
        info!(signal = name, "shutdown requested");
        token.cancel();
    });

    let debug_listener = server::bind_debug(cfg.debug_addr()?).await?;
    let socket_path = Path::new(&cfg.socket_path);
    let listener = server::bind_socket(socket_path)?;
    info!(path = %socket_path.display(), "listening");

    // A failed debug server takes the gRPC server down with it.
    let debug_shutdown = shutdown.clone();
    let debug_state = state.clone();
    let debug = tokio::spawn(async move {
        let res = server::serve_debug(debug_listener, debug_state, debug_shutdown.clone()).await;
        debug_shutdown.cancel();
        res
    });

    let served = server::serve_grpc(listener, state.clone(), shutdown.clone(), cfg.drain_timeout())
        .await;
    shutdown.cancel();

    let debug_served = match debug.await {
        Ok(res) => res,
        Err(e) => Err(e).context("debug endpoint task failed"),
    };
    if let Err(e) = std::fs::remove_file(socket_path) {
        warn!(error = %e, "failed to remove socket file");
    }

    state.advance(ServerPhase::Stopped);
    if let Err(e) = &served {
        error!(error = %e, "gRPC server failed");
    }
    if let Err(e) = &debug_served {
        error!(error = %e, "debug endpoint failed");
    }
    telemetry::shutdown_telemetry();
    served.and(debug_served)
}
