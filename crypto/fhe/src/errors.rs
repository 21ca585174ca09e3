//! FHE Error types

use thiserror::Error;

use crate::{BitWidth, OpKind};

/// Errors that can occur during FHE operations
#[derive(Error, Debug)]
pub enum FheError {
    /// Invalid ciphertext
    #[error("Invalid ciphertext: {0}")]
    InvalidCiphertext(String),

    /// Operands of a binary operation have different widths
    #[error("Width mismatch: {left} vs {right}")]
    WidthMismatch { left: BitWidth, right: BitWidth },

    /// Plaintext does not fit the requested width
    #[error("Value {value} does not fit in {width}")]
    ValueOutOfRange { value: u64, width: BitWidth },

    /// Operation kind not valid for the requested evaluation shape
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(OpKind),

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Invalid key
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}
