//! Envelope encryption: routes the caller's data-encryption key through the
//! key store under the resolved key.
//!
//! No cryptography happens in this process. The plugin's job is to target the
//! right key version and to keep the payload encoding reversible.

pub mod codec;

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use common::ServiceError;

use crate::backend::{EncryptionAlgorithm, KeyStoreError};
use crate::key::{KeyResolver, KeyVersionSlot, ResolveError, ResolvedKeyHandle};

/// Algorithm used for every encrypt and decrypt call.
pub const ALGORITHM: EncryptionAlgorithm = EncryptionAlgorithm::Rsa15;

/// Errors produced by the envelope layer.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("failed to resolve key: {0}")]
    Resolve(#[from] ResolveError),

    #[error("key store encrypt failed: {0}")]
    Encrypt(#[source] KeyStoreError),

    #[error("key store decrypt failed: {0}")]
    Decrypt(#[source] KeyStoreError),

    /// The ciphertext handed to decrypt is not a key store result token.
    #[error("ciphertext is not a valid result token")]
    MalformedCiphertext,

    #[error("key store returned an undecodable plaintext: {0}")]
    MalformedPlaintext(#[from] codec::DecodeError),
}

impl From<EnvelopeError> for ServiceError {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::Resolve(e) => e.into(),
            EnvelopeError::MalformedCiphertext => ServiceError::InvalidRequest(err.to_string()),
            EnvelopeError::Encrypt(KeyStoreError::Service { status, .. })
            | EnvelopeError::Decrypt(KeyStoreError::Service { status, .. })
                if (400..500).contains(&status) =>
            {
                ServiceError::InvalidRequest(err.to_string())
            }
            EnvelopeError::Encrypt(_) | EnvelopeError::Decrypt(_) => {
                ServiceError::Unavailable(err.to_string())
            }
            EnvelopeError::MalformedPlaintext(_) => ServiceError::Internal(err.to_string()),
        }
    }
}

/// Encrypts and decrypts envelope keys with the configured key.
#[derive(Clone)]
pub struct Envelope {
    resolver: Arc<KeyResolver>,
    version: KeyVersionSlot,
}

impl Envelope {
    pub fn new(resolver: Arc<KeyResolver>) -> Self {
        let version = KeyVersionSlot::new(resolver.reference().key_version.clone());
        Self { resolver, version }
    }

    /// The key version this process is operating on, once known.
    pub fn key_version(&self) -> Option<Arc<String>> {
        self.version.get()
    }

    pub fn resolver(&self) -> &KeyResolver {
        &self.resolver
    }

    /// Encrypt `plaintext` and return the key store's result token as bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Resolve`] if the key cannot be resolved and
    /// [`EnvelopeError::Encrypt`] if the key store rejects the request.
    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        let key = self.key().await?;
        let value = codec::encode(plaintext);
        let token = key
            .client()
            .encrypt(
                &key.vault_base_url,
                &key.key_name,
                &key.key_version,
                ALGORITHM,
                &value,
            )
            .await
            .map_err(EnvelopeError::Encrypt)?;
        Ok(token.into_bytes())
    }

    /// Decrypt a result token produced by [`Envelope::encrypt`].
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::MalformedCiphertext`] if `cipher` is not UTF-8,
    /// [`EnvelopeError::Decrypt`] if the key store rejects it, and
    /// [`EnvelopeError::MalformedPlaintext`] if the result cannot be decoded.
    pub async fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        let token = std::str::from_utf8(cipher).map_err(|_| EnvelopeError::MalformedCiphertext)?;
        let key = self.key().await?;
        let value = key
            .client()
            .decrypt(
                &key.vault_base_url,
                &key.key_name,
                &key.key_version,
                ALGORITHM,
                token,
            )
            .await
            .map_err(EnvelopeError::Decrypt)?;
        Ok(codec::decode(&value)?)
    }

    async fn key(&self) -> Result<Arc<ResolvedKeyHandle>, EnvelopeError> {
        let key = self.resolver.resolve().await?;
        if self.version.set_if_unresolved(&key.key_version) {
            info!(key_name = %key.key_name, key_version = %key.key_version, "key version resolved");
        }
        Ok(key)
    }
}
