//! FHE Ciphertext types with Real TFHE-rs
//!
//! `FheValue` is a typed encrypted value of one of the supported widths.
//! `CiphertextBlob` is its serialized form for sealing and transport. Blobs are
//! written with TFHE-rs safe serialization and only decode when the ciphertext
//! conforms to the parameters of the engine's key set.

use super::keys::{ClientKey, PublicKey, ServerKey};
use crate::{FheError, FheResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tfhe::prelude::*;
use tfhe::safe_serialization::{safe_deserialize_conformant, safe_serialize};
use tfhe::{FheBool, FheUint32, FheUint64, FheUint8};
use tfhe::{
    FheBoolConformanceParams, FheUint32ConformanceParams, FheUint64ConformanceParams,
    FheUint8ConformanceParams,
};

/// Upper bound on accepted serialized ciphertext size
pub const MAX_CIPHERTEXT_BYTES: usize = 4 * 1024 * 1024;

/// Plaintext bit width of an encrypted value
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BitWidth {
    Bool,
    U8,
    U32,
    U64,
}

impl BitWidth {
    /// All supported widths
    pub const ALL: [BitWidth; 4] = [BitWidth::Bool, BitWidth::U8, BitWidth::U32, BitWidth::U64];

    /// Number of plaintext bits
    pub const fn bits(self) -> u32 {
        match self {
            BitWidth::Bool => 1,
            BitWidth::U8 => 8,
            BitWidth::U32 => 32,
            BitWidth::U64 => 64,
        }
    }

    /// One-byte tag embedded in handles
    pub const fn tag(self) -> u8 {
        match self {
            BitWidth::Bool => 0,
            BitWidth::U8 => 2,
            BitWidth::U32 => 4,
            BitWidth::U64 => 5,
        }
    }

    /// Inverse of [`BitWidth::tag`]
    pub fn from_tag(tag: u8) -> Option<Self> {
        BitWidth::ALL.into_iter().find(|w| w.tag() == tag)
    }

    /// Largest representable plaintext
    pub const fn max_value(self) -> u64 {
        match self {
            BitWidth::U64 => u64::MAX,
            w => (1u64 << w.bits()) - 1,
        }
    }

    /// Reduce a value modulo 2^bits
    pub const fn wrap(self, value: u64) -> u64 {
        value & self.max_value()
    }

    /// Reject plaintexts that do not fit
    pub fn check(self, value: u64) -> FheResult<u64> {
        if value > self.max_value() {
            return Err(FheError::ValueOutOfRange { value, width: self });
        }
        Ok(value)
    }
}

impl std::fmt::Display for BitWidth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BitWidth::Bool => write!(f, "ebool"),
            BitWidth::U8 => write!(f, "euint8"),
            BitWidth::U32 => write!(f, "euint32"),
            BitWidth::U64 => write!(f, "euint64"),
        }
    }
}

struct ConformanceParams {
    bool: FheBoolConformanceParams,
    u8: FheUint8ConformanceParams,
    u32: FheUint32ConformanceParams,
    u64: FheUint64ConformanceParams,
}

/// Parameter sets a ciphertext must match before it is evaluated on
#[derive(Clone)]
pub struct Conformance {
    params: Arc<ConformanceParams>,
}

impl Conformance {
    /// Parameters of the key set `server_key` belongs to
    pub fn new(server_key: &ServerKey) -> Self {
        let key = &server_key.inner;
        Self {
            params: Arc::new(ConformanceParams {
                bool: FheBoolConformanceParams::from(key),
                u8: FheUint8ConformanceParams::from(key),
                u32: FheUint32ConformanceParams::from(key),
                u64: FheUint64ConformanceParams::from(key),
            }),
        }
    }
}

impl std::fmt::Debug for Conformance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conformance").finish_non_exhaustive()
    }
}

/// Encrypted value of one of the supported widths
#[derive(Clone)]
pub enum FheValue {
    Bool(FheBool),
    U8(FheUint8),
    U32(FheUint32),
    U64(FheUint64),
}

impl FheValue {
    /// Encrypt a plaintext at the given width with a client key
    pub fn encrypt(value: u64, width: BitWidth, client_key: &ClientKey) -> FheResult<Self> {
        let value = width.check(value)?;
        let key = client_key.inner();

        Ok(match width {
            BitWidth::Bool => FheValue::Bool(FheBool::encrypt(value != 0, key)),
            BitWidth::U8 => FheValue::U8(FheUint8::encrypt(value as u8, key)),
            BitWidth::U32 => FheValue::U32(FheUint32::encrypt(value as u32, key)),
            BitWidth::U64 => FheValue::U64(FheUint64::encrypt(value, key)),
        })
    }

    /// Encrypt a plaintext at the given width with the encryption-only public key
    pub fn encrypt_public(value: u64, width: BitWidth, public_key: &PublicKey) -> FheResult<Self> {
        let value = width.check(value)?;
        let key = public_key.inner();
        let failed = |e: tfhe::Error| FheError::EncryptionFailed(e.to_string());

        Ok(match width {
            BitWidth::Bool => FheValue::Bool(FheBool::try_encrypt(value != 0, key).map_err(failed)?),
            BitWidth::U8 => FheValue::U8(FheUint8::try_encrypt(value as u8, key).map_err(failed)?),
            BitWidth::U32 => FheValue::U32(FheUint32::try_encrypt(value as u32, key).map_err(failed)?),
            BitWidth::U64 => FheValue::U64(FheUint64::try_encrypt(value, key).map_err(failed)?),
        })
    }

    /// Decrypt to a plaintext using a client key
    pub fn decrypt(&self, client_key: &ClientKey) -> u64 {
        let key = client_key.inner();
        match self {
            FheValue::Bool(ct) => {
                let clear: bool = ct.decrypt(key);
                clear as u64
            }
            FheValue::U8(ct) => {
                let clear: u8 = ct.decrypt(key);
                clear as u64
            }
            FheValue::U32(ct) => {
                let clear: u32 = ct.decrypt(key);
                clear as u64
            }
            FheValue::U64(ct) => ct.decrypt(key),
        }
    }

    /// Plaintext width of this value
    pub fn width(&self) -> BitWidth {
        match self {
            FheValue::Bool(_) => BitWidth::Bool,
            FheValue::U8(_) => BitWidth::U8,
            FheValue::U32(_) => BitWidth::U32,
            FheValue::U64(_) => BitWidth::U64,
        }
    }

    /// Serialize into a blob carrying width and operation depth
    pub fn to_blob(&self, op_count: u32) -> FheResult<CiphertextBlob> {
        let limit = MAX_CIPHERTEXT_BYTES as u64;
        let mut data = Vec::new();
        match self {
            FheValue::Bool(ct) => safe_serialize(ct, &mut data, limit),
            FheValue::U8(ct) => safe_serialize(ct, &mut data, limit),
            FheValue::U32(ct) => safe_serialize(ct, &mut data, limit),
            FheValue::U64(ct) => safe_serialize(ct, &mut data, limit),
        }
        .map_err(|e| FheError::SerializationError(e.to_string()))?;

        Ok(CiphertextBlob {
            data,
            width: self.width(),
            op_count,
        })
    }
}

impl std::fmt::Debug for FheValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FheValue")
            .field("width", &self.width())
            .finish()
    }
}

/// Serialized ciphertext for storage/transmission
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiphertextBlob {
    /// Serialized ciphertext bytes
    data: Vec<u8>,
    /// Plaintext width the bytes claim to encrypt
    width: BitWidth,
    /// Operation count (noise proxy)
    op_count: u32,
}

impl CiphertextBlob {
    /// Wrap raw bytes received from a client
    pub fn new(data: Vec<u8>, width: BitWidth) -> Self {
        Self {
            data,
            width,
            op_count: 0,
        }
    }

    /// Get the ciphertext data
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Get the claimed width
    pub fn width(&self) -> BitWidth {
        self.width
    }

    /// Get the operation count (noise proxy)
    pub fn op_count(&self) -> u32 {
        self.op_count
    }

    /// Content digest used for input binding
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[self.width.tag()]);
        hasher.update(&self.data);
        *hasher.finalize().as_bytes()
    }

    /// Decode into a typed value, rejecting oversized or malformed bytes and
    /// ciphertexts that do not conform to the declared width and key parameters
    pub fn decode(&self, conformance: &Conformance) -> FheResult<FheValue> {
        if self.data.len() > MAX_CIPHERTEXT_BYTES {
            return Err(FheError::InvalidCiphertext(format!(
                "{} bytes exceeds limit of {}",
                self.data.len(),
                MAX_CIPHERTEXT_BYTES
            )));
        }

        let limit = MAX_CIPHERTEXT_BYTES as u64;
        let reader = self.data.as_slice();
        let params = &conformance.params;
        match self.width {
            BitWidth::Bool => safe_deserialize_conformant(reader, limit, &params.bool).map(FheValue::Bool),
            BitWidth::U8 => safe_deserialize_conformant(reader, limit, &params.u8).map(FheValue::U8),
            BitWidth::U32 => safe_deserialize_conformant(reader, limit, &params.u32).map(FheValue::U32),
            BitWidth::U64 => safe_deserialize_conformant(reader, limit, &params.u64).map(FheValue::U64),
        }
        .map_err(|e| FheError::InvalidCiphertext(format!("{} blob rejected: {}", self.width, e)))
    }
}

impl std::fmt::Debug for CiphertextBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CiphertextBlob")
            .field("size", &self.data.len())
            .field("width", &self.width)
            .field("ops", &self.op_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_keys::KEYS;

    fn conformance() -> Conformance {
        KEYS.server.conformance()
    }

    fn ct_u8_inner() -> FheUint8 {
        FheUint8::encrypt(5u8, KEYS.client.inner())
    }

    #[test]
    fn test_encrypt_decrypt_all_widths() {
        for (value, width) in [(1, BitWidth::Bool), (200, BitWidth::U8), (70_000, BitWidth::U32)] {
            let ct = FheValue::encrypt(value, width, &KEYS.client).unwrap();
            assert_eq!(ct.width(), width);
            assert_eq!(ct.decrypt(&KEYS.client), value);
        }
    }

    #[test]
    fn test_encrypt_u64_max() {
        let ct = FheValue::encrypt(u64::MAX, BitWidth::U64, &KEYS.client).unwrap();
        assert_eq!(ct.decrypt(&KEYS.client), u64::MAX);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let result = FheValue::encrypt(256, BitWidth::U8, &KEYS.client);
        assert!(matches!(result, Err(FheError::ValueOutOfRange { value: 256, .. })));

        let result = FheValue::encrypt(2, BitWidth::Bool, &KEYS.client);
        assert!(result.is_err());
    }

    #[test]
    fn test_blob_decode() {
        let ct = FheValue::encrypt(42, BitWidth::U8, &KEYS.client).unwrap();
        let blob = ct.to_blob(3).unwrap();
        assert_eq!(blob.op_count(), 3);

        let decoded = blob.decode(&conformance()).unwrap();
        assert_eq!(decoded.decrypt(&KEYS.client), 42);
    }

    #[test]
    fn test_public_key_encryption() {
        for (value, width) in [(1, BitWidth::Bool), (77, BitWidth::U8), (u64::MAX, BitWidth::U64)] {
            let ct = FheValue::encrypt_public(value, width, &KEYS.public).unwrap();
            let blob = ct.to_blob(0).unwrap();
            assert_eq!(blob.decode(&conformance()).unwrap().decrypt(&KEYS.client), value);
        }
        assert!(FheValue::encrypt_public(256, BitWidth::U8, &KEYS.public).is_err());
    }

    #[test]
    fn test_foreign_parameters_rejected() {
        // a 32-bit ciphertext has more blocks than an 8-bit parameter set allows
        let ct = FheValue::encrypt(7, BitWidth::U32, &KEYS.client).unwrap();
        let blob = ct.to_blob(0).unwrap();
        let relabelled = CiphertextBlob::new(blob.data().to_vec(), BitWidth::U8);
        assert!(matches!(relabelled.decode(&conformance()), Err(FheError::InvalidCiphertext(_))));

        let plain_bincode = bincode::serialize(&ct_u8_inner()).unwrap();
        let unversioned = CiphertextBlob::new(plain_bincode, BitWidth::U8);
        assert!(matches!(unversioned.decode(&conformance()), Err(FheError::InvalidCiphertext(_))));
    }

    #[test]
    fn test_blob_with_wrong_declared_width() {
        let ct = FheValue::encrypt(42, BitWidth::U8, &KEYS.client).unwrap();
        let blob = ct.to_blob(0).unwrap();
        let lying = CiphertextBlob::new(blob.data().to_vec(), BitWidth::U32);

        assert!(matches!(lying.decode(&conformance()), Err(FheError::InvalidCiphertext(_))));
    }

    #[test]
    fn test_garbage_blob_rejected() {
        let blob = CiphertextBlob::new(vec![0xde, 0xad, 0xbe, 0xef], BitWidth::U8);
        assert!(blob.decode(&conformance()).is_err());

        let oversized = CiphertextBlob::new(vec![0u8; MAX_CIPHERTEXT_BYTES + 1], BitWidth::U8);
        assert!(matches!(oversized.decode(&conformance()), Err(FheError::InvalidCiphertext(_))));
    }

    #[test]
    fn test_width_tags() {
        for width in BitWidth::ALL {
            assert_eq!(BitWidth::from_tag(width.tag()), Some(width));
        }
        assert_eq!(BitWidth::from_tag(0xff), None);
        assert_eq!(BitWidth::U8.wrap(300), 44);
        assert_eq!(BitWidth::Bool.max_value(), 1);
        assert_eq!(BitWidth::U64.max_value(), u64::MAX);
    }
}
