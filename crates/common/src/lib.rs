//! Protocol definitions and errors shared across the Azure KMS plugin crates.

pub mod error;
pub mod protocol;

pub use error::ServiceError;
