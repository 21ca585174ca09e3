//! Engine errors

use thiserror::Error;
use umbra_fhe::{BitWidth, FheError};
use umbra_storage::StorageError;

use crate::config::ConfigError;
use crate::types::{AclKind, Address, Handle, RequestId};

/// Engine result type
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine errors
///
/// None of these trigger an automatic retry inside the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Input proof does not bind the ciphertext to the claimed contract and principal
    #[error("Invalid input proof: {0}")]
    InvalidProof(String),

    /// Ciphertext bytes are malformed or of the wrong type
    #[error("Invalid ciphertext: {0}")]
    InvalidCiphertext(String),

    /// No ciphertext stored under this handle
    #[error("Unknown handle: {0}")]
    UnknownHandle(Handle),

    /// Principal lacks the required grant
    #[error("Permission denied: {principal} has no {kind} grant on {handle}")]
    PermissionDenied {
        handle: Handle,
        principal: Address,
        kind: AclKind,
    },

    /// Operands have different widths
    #[error("Width mismatch: {left} vs {right}")]
    WidthMismatch { left: BitWidth, right: BitWidth },

    /// Decryption authorization is not valid for the claimed principal
    #[error("Unauthorized signer: {0}")]
    UnauthorizedSigner(String),

    /// Fulfilment callback from someone other than the gateway
    #[error("Unauthorized callback from {0}")]
    UnauthorizedCallback(Address),

    /// Request is unknown or no longer pending
    #[error("Request {0} is not pending")]
    DoubleFulfillment(RequestId),

    /// Operation would exceed the cost budget of the current window
    #[error("Cost budget exceeded: requested {requested}, remaining {remaining}")]
    CostBudgetExceeded { requested: u64, remaining: u64 },

    /// Plaintext does not fit the width
    #[error("Value {value} does not fit in {width}")]
    ValueOutOfRange { value: u64, width: BitWidth },

    /// Handle already carries the maximum number of grants
    #[error("ACL of {handle} is full ({limit} entries)")]
    AclLimit { handle: Handle, limit: usize },

    /// Same decryptor answered a request twice
    #[error("Duplicate response for request {0}")]
    DuplicateResponse(RequestId),

    /// Sealing a plaintext to a principal, or opening it, failed
    #[error("Re-encryption failed: {0}")]
    Reencryption(String),

    /// Gateway relaying failed outside the engine
    #[error("Relay error: {0}")]
    Relay(String),

    /// FHE error
    #[error("FHE error: {0}")]
    Fhe(FheError),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<FheError> for EngineError {
    fn from(e: FheError) -> Self {
        match e {
            FheError::InvalidCiphertext(msg) => EngineError::InvalidCiphertext(msg),
            FheError::WidthMismatch { left, right } => EngineError::WidthMismatch { left, right },
            FheError::ValueOutOfRange { value, width } => {
                EngineError::ValueOutOfRange { value, width }
            }
            other => EngineError::Fhe(other),
        }
    }
}
