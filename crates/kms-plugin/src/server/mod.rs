//! Plugin servers: the KMS gRPC service on a Unix socket and a small axum
//! debug endpoint on loopback.
//!
//! # Responsibilities
//! - Remove a stale socket file and bind the gRPC listener.
//! - Serve `Version`, `Encrypt` and `Decrypt` over the envelope layer.
//! - Track the lifecycle phase and expose it on `/health`.
//! - Drain in-flight calls on shutdown.

pub mod handlers;
pub mod listener;
pub mod middleware;
pub mod router;
pub mod service;
pub mod state;

pub use listener::{bind_debug, bind_socket, serve_debug, serve_grpc};
pub use state::{PluginState, ServerPhase};
