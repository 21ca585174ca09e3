//! Core identifiers: handles, addresses and ACL kinds

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use umbra_fhe::{BitWidth, OpKind};

/// Opaque reference to one stored ciphertext.
///
/// The last byte is the width tag, so a handle's type is known without a
/// store lookup. Handles are write-once: every operation yields a new one.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle([u8; 32]);

impl Handle {
    /// Derive a fresh handle from the engine identity, a unique nonce and the
    /// inputs that produced it
    pub fn derive(engine: &Address, nonce: u64, width: BitWidth, parts: &[&[u8]]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"umbra.handle.v1");
        hasher.update(engine.as_bytes());
        hasher.update(&nonce.to_le_bytes());
        for part in parts {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part);
        }

        let mut bytes = *hasher.finalize().as_bytes();
        bytes[31] = width.tag();
        Self(bytes)
    }

    /// Wrap raw bytes
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Width encoded in the handle's tag byte
    pub fn width(&self) -> Option<BitWidth> {
        BitWidth::from_tag(self.0[31])
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handle({})", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// 32-byte identity of an account, contract or service
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address([u8; 32]);

impl Address {
    /// All-zero address
    pub const ZERO: Address = Address([0u8; 32]);

    /// Wrap raw bytes
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Address controlled by an ed25519 key
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"umbra.address.v1");
        hasher.update(key.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Deterministic address for a named contract or service
    pub fn from_label(label: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"umbra.label.v1");
        hasher.update(label.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Parse a hex string, with or without `0x`
    pub fn from_hex(s: &str) -> Option<Self> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).ok()?;
        let bytes: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Hex string with `0x` prefix
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({})", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Kind of permission a principal holds on a handle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AclKind {
    /// May use the handle as an operation input
    Compute,
    /// May request decryption of the handle
    Decrypt,
}

impl std::fmt::Display for AclKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AclKind::Compute => write!(f, "compute"),
            AclKind::Decrypt => write!(f, "decrypt"),
        }
    }
}

/// Contract and principal a ciphertext is bound to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub contract: Address,
    pub principal: Address,
}

/// How a ciphertext came to exist
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    /// Submitted by a client with a verified input proof
    Input,
    /// Output of a homomorphic operation
    Operation(OpKind),
}

/// Identifier of a public decryption request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    #[test]
    fn test_handle_carries_width() {
        let engine = Address::from_label("engine");
        for width in BitWidth::ALL {
            let handle = Handle::derive(&engine, 7, width, &[b"input"]);
            assert_eq!(handle.width(), Some(width));
        }
    }

    #[test]
    fn test_handles_differ_by_nonce() {
        let engine = Address::from_label("engine");
        let a = Handle::derive(&engine, 1, BitWidth::U8, &[]);
        let b = Handle::derive(&engine, 2, BitWidth::U8, &[]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_address_from_key_is_stable() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let a = Address::from_verifying_key(&key.verifying_key());
        let b = Address::from_verifying_key(&key.verifying_key());
        assert_eq!(a, b);
        assert_ne!(a, Address::from_verifying_key(&SigningKey::from_bytes(&[8u8; 32]).verifying_key()));
    }

    #[test]
    fn test_address_hex() {
        let addr = Address::from_label("gateway");
        assert_eq!(Address::from_hex(&addr.to_hex()), Some(addr));
        assert_eq!(Address::from_hex("0x1234"), None);
        assert_eq!(Address::from_hex("zz"), None);
    }
}
