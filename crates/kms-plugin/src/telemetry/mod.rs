//! Structured logging and optional OpenTelemetry span export.
//!
//! # Telemetry invariants
//!
//! - **No key material, plaintext or ciphertext** appears in any span
//!   attribute or log field. Key names and versions are fine.
//! - Log level is configurable via `AZURE_KMS_LOG_LEVEL` (default: `info`)
//!   and overridden by `RUST_LOG`.

pub mod init;

pub use init::{init_telemetry, shutdown_telemetry};
