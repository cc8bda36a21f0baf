//! Text-safe encoding of envelope payloads.
//!
//! The key store's encrypt operation accepts base64url values. Plaintext is
//! encoded with the URL-safe alphabet and no padding; decrypt results come back
//! in the same form and are decoded here. Result tokens produced by the store
//! are already text and pass through untouched.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use thiserror::Error;

/// A key store result was not valid unpadded base64url.
#[derive(Debug, Error)]
#[error("invalid base64url payload: {0}")]
pub struct DecodeError(#[from] base64::DecodeError);

/// Encode arbitrary bytes for submission to the key store.
pub fn encode(plaintext: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(plaintext)
}

/// Decode a base64url value returned by the key store.
///
/// # Errors
///
/// Returns [`DecodeError`] for padded input or characters outside the URL-safe
/// alphabet.
pub fn decode(value: &str) -> Result<Vec<u8>, DecodeError> {
    Ok(URL_SAFE_NO_PAD.decode(value)?)
}
