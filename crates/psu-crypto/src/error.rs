//! Crypto errors

use thiserror::Error;

/// Failures of key handling and signature checks
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("libsodium could not be initialized")]
    InitializationFailed,

    #[error("Malformed Ed25519 key material")]
    MalformedKey,

    #[error("Expected {expected} bytes, got {actual}")]
    WrongLength { expected: usize, actual: usize },

    #[error("Invalid hex: {0}")]
    InvalidHex(String),

    #[error("Signature does not match the signed bytes")]
    SignatureMismatch,
}

pub type Result<T> = std::result::Result<T, CryptoError>;
