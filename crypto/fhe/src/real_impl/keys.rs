//! FHE Key Management with Real TFHE-rs
//!
//! Provides key generation and management for FHE operations.
//! - ClientKey: For encryption and decryption (held only by decryptor nodes)
//! - ServerKey: For homomorphic operations (held by the engine)
//! - PublicKey: For encryption only (published to clients)
//!
//! All parts of a [`KeySet`] carry the same fingerprint so a server or public
//! key can be matched against the client key that produced it.

use super::ciphertext::Conformance;
use crate::{FheConfig, FheError, FheResult};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tfhe::{generate_keys, CompactPublicKey, ConfigBuilder};
use tfhe::{ClientKey as TfheClientKey, ServerKey as TfheServerKey};

fn fingerprint(config: &FheConfig, key_id: &[u8; 32]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&config.hash());
    hasher.update(key_id);
    *hasher.finalize().as_bytes()
}

/// Client key for encryption and decryption
/// This key must be kept secret by its holder
#[derive(Clone)]
pub struct ClientKey {
    /// Inner TFHE-rs client key
    pub(crate) inner: TfheClientKey,
    /// Identifies the key set this key belongs to
    fingerprint: [u8; 32],
}

#[derive(Serialize, Deserialize)]
struct StoredClientKey {
    fingerprint: [u8; 32],
    inner: TfheClientKey,
}

impl ClientKey {
    /// Derive server key from client key
    pub fn derive_server_key(&self) -> ServerKey {
        ServerKey {
            inner: TfheServerKey::new(&self.inner),
            fingerprint: self.fingerprint,
        }
    }

    /// Derive the encryption-only public key
    pub fn derive_public_key(&self) -> PublicKey {
        PublicKey {
            inner: CompactPublicKey::new(&self.inner),
            fingerprint: self.fingerprint,
        }
    }

    /// Key set fingerprint
    pub fn fingerprint(&self) -> [u8; 32] {
        self.fingerprint
    }

    /// Get reference to inner TFHE key
    pub fn inner(&self) -> &TfheClientKey {
        &self.inner
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> FheResult<Vec<u8>> {
        let stored = StoredClientKey {
            fingerprint: self.fingerprint,
            inner: self.inner.clone(),
        };
        bincode::serialize(&stored).map_err(|e| FheError::SerializationError(e.to_string()))
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> FheResult<Self> {
        let stored: StoredClientKey = bincode::deserialize(bytes)
            .map_err(|e| FheError::InvalidKey(e.to_string()))?;

        Ok(Self {
            inner: stored.inner,
            fingerprint: stored.fingerprint,
        })
    }
}

impl std::fmt::Debug for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientKey")
            .field("fingerprint", &hex::encode(&self.fingerprint[..8]))
            .finish()
    }
}

/// Server key for homomorphic operations
/// Can be shared with evaluators to enable computation on encrypted data
#[derive(Clone)]
pub struct ServerKey {
    /// Inner TFHE-rs server key
    pub(crate) inner: TfheServerKey,
    /// Identifies the key set this key belongs to
    fingerprint: [u8; 32],
}

impl ServerKey {
    /// Key set fingerprint
    pub fn fingerprint(&self) -> [u8; 32] {
        self.fingerprint
    }

    /// Check that this server key evaluates ciphertexts of the given client key
    pub fn matches(&self, client: &ClientKey) -> bool {
        self.fingerprint == client.fingerprint
    }

    /// Parameters incoming ciphertexts are checked against
    pub fn conformance(&self) -> Conformance {
        Conformance::new(self)
    }
}

impl std::fmt::Debug for ServerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerKey")
            .field("fingerprint", &hex::encode(&self.fingerprint[..8]))
            .finish()
    }
}

/// Public key for encryption only
/// Can be published for anyone to encrypt inputs to the engine
#[derive(Clone)]
pub struct PublicKey {
    /// Inner TFHE-rs compact public key
    inner: CompactPublicKey,
    /// Identifies the key set this key belongs to
    fingerprint: [u8; 32],
}

#[derive(Serialize, Deserialize)]
struct StoredPublicKey {
    fingerprint: [u8; 32],
    inner: CompactPublicKey,
}

impl PublicKey {
    /// Key set fingerprint
    pub fn fingerprint(&self) -> [u8; 32] {
        self.fingerprint
    }

    /// Get reference to inner key
    pub fn inner(&self) -> &CompactPublicKey {
        &self.inner
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> FheResult<Vec<u8>> {
        let stored = StoredPublicKey {
            fingerprint: self.fingerprint,
            inner: self.inner.clone(),
        };
        bincode::serialize(&stored).map_err(|e| FheError::SerializationError(e.to_string()))
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> FheResult<Self> {
        let stored: StoredPublicKey = bincode::deserialize(bytes)
            .map_err(|e| FheError::InvalidKey(e.to_string()))?;

        Ok(Self {
            inner: stored.inner,
            fingerprint: stored.fingerprint,
        })
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicKey")
            .field("fingerprint", &hex::encode(&self.fingerprint[..8]))
            .finish()
    }
}

/// Complete key set for FHE operations
#[derive(Clone)]
pub struct KeySet {
    /// Client key (secret)
    pub client: ClientKey,
    /// Server key (can be shared)
    pub server: ServerKey,
    /// Public key (can be published)
    pub public: PublicKey,
}

impl KeySet {
    /// Generate a new key set
    ///
    /// WARNING: Key generation is slow (seconds)
    pub fn generate(config: &FheConfig) -> FheResult<Self> {
        config.validate()?;

        let tfhe_config = ConfigBuilder::default().build();
        let (client_key, server_key) = generate_keys(tfhe_config);
        let public_key = CompactPublicKey::new(&client_key);

        let mut key_id = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key_id);
        let fingerprint = fingerprint(config, &key_id);

        tracing::info!(fingerprint = %hex::encode(&fingerprint[..8]), "generated FHE key set");

        Ok(Self {
            client: ClientKey {
                inner: client_key,
                fingerprint,
            },
            server: ServerKey {
                inner: server_key,
                fingerprint,
            },
            public: PublicKey {
                inner: public_key,
                fingerprint,
            },
        })
    }
}

impl std::fmt::Debug for KeySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySet")
            .field("fingerprint", &hex::encode(&self.client.fingerprint[..8]))
            .finish()
    }
}
