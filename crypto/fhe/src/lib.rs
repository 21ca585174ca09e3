//! Umbra FHE Operations
//!
//! Fully Homomorphic Encryption using TFHE-rs.
//! Typed encrypted integers that the confidential state engine computes on
//! without ever seeing plaintext.
//!
//! # Key Features:
//! - Encrypt/decrypt booleans and 8/32/64-bit unsigned integers
//! - Homomorphic addition, subtraction, multiplication (wrapping)
//! - Equality and less-than comparisons producing encrypted booleans
//! - Branch-free conditional select
//! - Relative cost model used for operation metering
//!
//! # Architecture:
//! - ClientKey: For decryption (held only by decryptor nodes)
//! - ServerKey: For homomorphic operations (held by the engine)
//! - PublicKey: For encrypting inputs (held by clients)
//! - FheEvaluator: Installs the server key per thread and evaluates operations

pub mod errors;
mod real_impl;

pub use errors::FheError;
pub use real_impl::*;

/// FHE Configuration
#[derive(Clone, Debug)]
pub struct FheConfig {
    /// Security parameter (bits)
    pub security_bits: u32,
}

impl Default for FheConfig {
    fn default() -> Self {
        Self { security_bits: 128 }
    }
}

impl FheConfig {
    /// Only the TFHE-rs default 128-bit parameter set is supported
    pub fn validate(&self) -> FheResult<()> {
        if self.security_bits != 128 {
            return Err(FheError::ConfigError(format!(
                "unsupported security level: {} bits",
                self.security_bits
            )));
        }
        Ok(())
    }

    pub(crate) fn hash(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"umbra.fhe.config.v1");
        hasher.update(&self.security_bits.to_le_bytes());
        *hasher.finalize().as_bytes()
    }
}

/// Result type for FHE operations
pub type FheResult<T> = Result<T, FheError>;
