//! Key resolution: from a configured (vault, key, version) triple to a usable
//! key handle.
//!
//! # Lifecycle
//!
//! 1. The first encrypt or decrypt call drives [`KeyResolver::resolve`], which
//!    locates the vault, fetches the key and, when the key does not exist and
//!    no version is pinned, provisions it through [`KeyCreator`].
//! 2. A newly discovered version is written back to the configuration store
//!    so a restarted process resolves the same key.
//! 3. The resulting [`ResolvedKeyHandle`] is cached for the lifetime of the
//!    process; later calls never touch the control plane again.
//!
//! # Invariants
//!
//! - A pinned version that the key store cannot produce is fatal; it is never
//!   substituted with another version and never triggers creation.
//! - At most one replica creates the key. Cross-process exclusion comes from
//!   the blob lease, in-process exclusion from the resolver's once-cell.

pub mod creation;
pub mod resolver;
pub mod version;

pub use creation::{KeyCreator, PollPolicy};
pub use resolver::{KeyResolver, ResolveError, ResolvedKeyHandle};
pub use version::KeyVersionSlot;

use thiserror::Error;

/// Identifies the logical key this plugin manages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyReference {
    pub subscription_id: String,
    pub resource_group: String,
    pub vault_name: String,
    pub key_name: String,
    /// Pinned version, or `None` when the latest (or a new) key should be used.
    pub key_version: Option<String>,
}

impl KeyReference {
    pub fn is_pinned(&self) -> bool {
        self.key_version.is_some()
    }
}

/// A key identifier had no `/` or ended in one.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("failed to parse key version from key id {0:?}")]
pub struct KeyIdError(pub String);

/// Extract the version from a key identifier such as
/// `https://vault.vault.azure.net/keys/name/0123abcd`: the segment after the
/// final `/`.
pub fn version_from_kid(kid: &str) -> Result<String, KeyIdError> {
    match kid.rsplit_once('/') {
        Some((_, version)) if !version.is_empty() => Ok(version.to_owned()),
        _ => Err(KeyIdError(kid.to_owned())),
    }
}
