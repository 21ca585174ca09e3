//! Real TFHE-rs implementation
//!
//! Production-grade FHE using TFHE-rs library.

mod ciphertext;
mod evaluator;
mod keys;
mod operations;

pub use ciphertext::{BitWidth, CiphertextBlob, Conformance, FheValue, MAX_CIPHERTEXT_BYTES};
pub use evaluator::FheEvaluator;
pub use keys::{ClientKey, KeySet, PublicKey, ServerKey};
pub use operations::{FheOps, HomomorphicOps, OpKind};
