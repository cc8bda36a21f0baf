//! Shared plugin state: the envelope layer and the server lifecycle phase.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use crate::envelope::Envelope;

/// Lifecycle of the plugin process.
///
/// Phases only move forward: `Uninitialized → Listening → Serving →
/// Draining → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerPhase {
    Uninitialized,
    Listening,
    Serving,
    Draining,
    Stopped,
}

impl ServerPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerPhase::Uninitialized => "uninitialized",
            ServerPhase::Listening => "listening",
            ServerPhase::Serving => "serving",
            ServerPhase::Draining => "draining",
            ServerPhase::Stopped => "stopped",
        }
    }
}

/// State shared by the gRPC service and the debug router.
///
/// Cloning is cheap; every field is `Arc`-backed.
#[derive(Clone)]
pub struct PluginState {
    pub envelope: Envelope,
    phase: Arc<watch::Sender<ServerPhase>>,
}

impl PluginState {
    pub fn new(envelope: Envelope) -> Self {
        let (phase, _) = watch::channel(ServerPhase::Uninitialized);
        Self {
            envelope,
            phase: Arc::new(phase),
        }
    }

    pub fn phase(&self) -> ServerPhase {
        *self.phase.borrow()
    }

    /// Move to `next`. Backwards or repeated transitions are ignored.
    pub fn advance(&self, next: ServerPhase) {
        let moved = self.phase.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        });
        if moved {
            info!(phase = next.as_str(), "server phase changed");
        }
    }
}
