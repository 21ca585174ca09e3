//! Client Decryption Protocol
//!
//! A principal with a `Decrypt` grant proves control of its address by signing
//! a structured, domain-separated authorization that also names an X25519
//! re-encryption key. The engine checks signature and grant, then asks the
//! [`KeyService`] to decrypt and seal the plaintext to that key. The engine
//! never sees the plaintext and the principal never holds the network key;
//! only the matching [`ClientDecryptor`] can open the answer.
//!
//! Client-side flow: `Requested -> Authorized -> Decrypted`, tracked by
//! [`DecryptionSession`].

use std::sync::Arc;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use umbra_fhe::{BitWidth, CiphertextBlob};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};

use crate::config::EngineSettings;
use crate::error::{EngineError, EngineResult};
use crate::store::CiphertextStore;
use crate::types::{AclKind, Address, Binding, Handle};

const SEALING_KDF: &str = "umbra.reencryption.v1";

/// ChaCha20-Poly1305 nonce length
pub const NONCE_LEN: usize = 12;

/// Signing domain for decryption authorizations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionDomain {
    pub name: String,
    pub version: String,
    pub chain_id: u64,
    /// Engine the authorization is valid for
    pub engine: Address,
}

impl DecryptionDomain {
    /// Domain of a configured engine
    pub fn from_settings(settings: &EngineSettings, engine: Address) -> Self {
        Self {
            name: settings.name.clone(),
            version: settings.version.clone(),
            chain_id: settings.chain_id,
            engine,
        }
    }

    /// Hash of the domain fields
    pub fn separator(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"UmbraDomain(string name,string version,uint64 chainId,address engine)");
        hasher.update(blake3::hash(self.name.as_bytes()).as_bytes());
        hasher.update(blake3::hash(self.version.as_bytes()).as_bytes());
        hasher.update(&self.chain_id.to_le_bytes());
        hasher.update(self.engine.as_bytes());
        *hasher.finalize().as_bytes()
    }
}

/// Signed permission to receive a handle's plaintext, sealed to
/// `reencryption_key`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionAuthorization {
    pub handle: Handle,
    pub principal: Address,
    /// X25519 key the plaintext is sealed to
    pub reencryption_key: [u8; 32],
    /// Unix seconds after which the authorization is void
    pub not_after: u64,
    /// Signer's ed25519 public key
    pub public_key: [u8; 32],
    /// ed25519 signature over [`DecryptionAuthorization::digest`]
    pub signature: Vec<u8>,
}

impl DecryptionAuthorization {
    /// Structured digest the signer commits to
    pub fn digest(
        domain: &DecryptionDomain,
        handle: &Handle,
        principal: &Address,
        reencryption_key: &[u8; 32],
        not_after: u64,
    ) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"\x19\x01");
        hasher.update(&domain.separator());
        hasher.update(
            b"DecryptionRequest(bytes32 handle,address principal,bytes32 reencryptionKey,uint64 notAfter)",
        );
        hasher.update(handle.as_bytes());
        hasher.update(principal.as_bytes());
        hasher.update(reencryption_key);
        hasher.update(&not_after.to_le_bytes());
        *hasher.finalize().as_bytes()
    }

    /// Sign for the address controlled by `signing_key`
    pub fn sign(
        signing_key: &SigningKey,
        domain: &DecryptionDomain,
        handle: Handle,
        reencryption_key: [u8; 32],
        not_after: u64,
    ) -> Self {
        let public_key = signing_key.verifying_key();
        let principal = Address::from_verifying_key(&public_key);
        let digest = Self::digest(domain, &handle, &principal, &reencryption_key, not_after);

        Self {
            handle,
            principal,
            reencryption_key,
            not_after,
            public_key: public_key.to_bytes(),
            signature: signing_key.sign(&digest).to_bytes().to_vec(),
        }
    }

    /// Check the authorization is a valid, unexpired signature by `principal`
    /// for `handle` in `domain`
    pub fn verify(&self, domain: &DecryptionDomain, handle: &Handle, principal: &Address, now: u64) -> EngineResult<()> {
        if self.handle != *handle || self.principal != *principal {
            return Err(EngineError::UnauthorizedSigner(
                "authorization is for a different handle or principal".to_string(),
            ));
        }
        if now > self.not_after {
            return Err(EngineError::UnauthorizedSigner(format!(
                "authorization expired at {}",
                self.not_after
            )));
        }

        let key = VerifyingKey::from_bytes(&self.public_key)
            .map_err(|_| EngineError::UnauthorizedSigner("malformed public key".to_string()))?;
        if Address::from_verifying_key(&key) != *principal {
            return Err(EngineError::UnauthorizedSigner(
                "key does not control the principal".to_string(),
            ));
        }

        let signature = Signature::from_slice(&self.signature)
            .map_err(|_| EngineError::UnauthorizedSigner("malformed signature".to_string()))?;
        let digest = Self::digest(domain, handle, principal, &self.reencryption_key, self.not_after);
        key.verify(&digest, &signature)
            .map_err(|_| EngineError::UnauthorizedSigner("invalid signature".to_string()))
    }
}

/// Ciphertext of a handle as handed to the key service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedCiphertext {
    pub handle: Handle,
    pub width: BitWidth,
    pub blob: CiphertextBlob,
    pub binding: Binding,
}

impl SealedCiphertext {
    pub(crate) fn seal(store: &CiphertextStore, handle: &Handle) -> EngineResult<Self> {
        let ct = store.get(handle)?;
        Ok(Self {
            handle: *handle,
            width: ct.width(),
            blob: ct.value().to_blob(ct.depth())?,
            binding: ct.binding(),
        })
    }

    /// Wire encoding
    pub fn to_bytes(&self) -> EngineResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| EngineError::InvalidCiphertext(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> EngineResult<Self> {
        bincode::deserialize(bytes).map_err(|e| EngineError::InvalidCiphertext(e.to_string()))
    }
}

/// Holder of the network decryption key.
///
/// Lives outside the engine; the engine only calls it for principals whose
/// signature and `Decrypt` grant it has already checked.
pub trait KeyService: Send + Sync {
    /// Decrypt `sealed` and seal the plaintext to the X25519 key `recipient`
    fn reencrypt(&self, sealed: &SealedCiphertext, recipient: &[u8; 32]) -> EngineResult<SealedPlaintext>;
}

fn sealing_key(shared: &[u8; 32], ephemeral_key: &[u8; 32], recipient: &[u8; 32]) -> [u8; 32] {
    let mut material = [0u8; 96];
    material[..32].copy_from_slice(shared);
    material[32..64].copy_from_slice(ephemeral_key);
    material[64..].copy_from_slice(recipient);
    blake3::derive_key(SEALING_KDF, &material)
}

fn sealing_aad(handle: &Handle, width: BitWidth) -> [u8; 33] {
    let mut aad = [0u8; 33];
    aad[..32].copy_from_slice(handle.as_bytes());
    aad[32] = width.tag();
    aad
}

/// Plaintext of a handle sealed to one principal's re-encryption key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedPlaintext {
    pub handle: Handle,
    pub width: BitWidth,
    /// Sender's ephemeral X25519 key
    pub ephemeral_key: [u8; 32],
    pub nonce: [u8; NONCE_LEN],
    /// ChaCha20-Poly1305 ciphertext of the little-endian plaintext
    pub ciphertext: Vec<u8>,
}

impl SealedPlaintext {
    /// Seal `plaintext` so that only the holder of the secret behind
    /// `recipient` can open it
    pub fn seal(handle: Handle, width: BitWidth, plaintext: u64, recipient: &[u8; 32]) -> EngineResult<Self> {
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_key = X25519PublicKey::from(&ephemeral).to_bytes();
        let shared = ephemeral.diffie_hellman(&X25519PublicKey::from(*recipient));
        let key = sealing_key(shared.as_bytes(), &ephemeral_key, recipient);

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let cipher = ChaCha20Poly1305::new_from_slice(&key)
            .map_err(|e| EngineError::Reencryption(format!("cipher init failed: {:?}", e)))?;
        let aad = sealing_aad(&handle, width);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &plaintext.to_le_bytes(),
                    aad: &aad,
                },
            )
            .map_err(|e| EngineError::Reencryption(format!("encryption failed: {:?}", e)))?;

        Ok(Self {
            handle,
            width,
            ephemeral_key,
            nonce,
            ciphertext,
        })
    }

    /// Wire encoding handed to the client
    pub fn to_bytes(&self) -> EngineResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| EngineError::Reencryption(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> EngineResult<Self> {
        bincode::deserialize(bytes).map_err(|e| EngineError::Reencryption(e.to_string()))
    }
}

/// Client-held X25519 key pair; opens plaintexts sealed to it
pub struct ClientDecryptor {
    secret: StaticSecret,
    public: X25519PublicKey,
}

impl ClientDecryptor {
    /// Fresh random key pair
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Restore from secret key bytes
    pub fn from_bytes(secret: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(secret))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Re-encryption key to put in authorizations
    pub fn public_key(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Open a sealed plaintext
    pub fn open(&self, sealed: &SealedPlaintext) -> EngineResult<u64> {
        let shared = self.secret.diffie_hellman(&X25519PublicKey::from(sealed.ephemeral_key));
        let key = sealing_key(shared.as_bytes(), &sealed.ephemeral_key, self.public.as_bytes());

        let cipher = ChaCha20Poly1305::new_from_slice(&key)
            .map_err(|e| EngineError::Reencryption(format!("cipher init failed: {:?}", e)))?;
        let aad = sealing_aad(&sealed.handle, sealed.width);
        let bytes = cipher
            .decrypt(
                Nonce::from_slice(&sealed.nonce),
                Payload {
                    msg: &sealed.ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| EngineError::Reencryption("sealed plaintext does not open with this key".to_string()))?;

        let bytes: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| EngineError::Reencryption(format!("unexpected plaintext length {}", bytes.len())))?;
        Ok(sealed.width.check(u64::from_le_bytes(bytes))?)
    }
}

impl std::fmt::Debug for ClientDecryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientDecryptor")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish()
    }
}

/// Engine side of the protocol
pub struct ClientDecryption {
    store: Arc<CiphertextStore>,
    domain: DecryptionDomain,
    key_service: Arc<dyn KeyService>,
}

impl ClientDecryption {
    pub fn new(store: Arc<CiphertextStore>, domain: DecryptionDomain, key_service: Arc<dyn KeyService>) -> Self {
        Self {
            store,
            domain,
            key_service,
        }
    }

    /// Domain authorizations must be signed under
    pub fn domain(&self) -> &DecryptionDomain {
        &self.domain
    }

    /// Release the plaintext of `handle` to `principal`, sealed to the
    /// re-encryption key in `authorization`.
    ///
    /// The signature is checked before the grant so an unauthenticated caller
    /// learns nothing about the ACL.
    pub fn request_decryption(
        &self,
        handle: &Handle,
        principal: &Address,
        authorization: &DecryptionAuthorization,
        now: u64,
    ) -> EngineResult<SealedPlaintext> {
        if let Err(e) = authorization.verify(&self.domain, handle, principal, now) {
            warn!(%handle, %principal, error = %e, "rejected decryption authorization");
            return Err(e);
        }

        let ct = self.store.get(handle)?;
        if !ct.allows(principal, AclKind::Decrypt) {
            return Err(EngineError::PermissionDenied {
                handle: *handle,
                principal: *principal,
                kind: AclKind::Decrypt,
            });
        }

        let sealed = SealedCiphertext::seal(&self.store, handle)?;
        let answer = self.key_service.reencrypt(&sealed, &authorization.reencryption_key)?;
        debug!(%handle, %principal, "released re-encrypted plaintext");
        Ok(answer)
    }
}

/// Client-local decryption state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Requested,
    Authorized,
    Decrypted,
}

/// One client-side decryption, from intent to plaintext
#[derive(Debug)]
pub struct DecryptionSession {
    handle: Handle,
    state: SessionState,
    authorization: Option<DecryptionAuthorization>,
    plaintext: Option<u64>,
}

impl DecryptionSession {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            state: SessionState::Requested,
            authorization: None,
            plaintext: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Sign the authorization for `decryptor`'s key; `Requested -> Authorized`
    pub fn authorize(
        &mut self,
        signing_key: &SigningKey,
        domain: &DecryptionDomain,
        decryptor: &ClientDecryptor,
        not_after: u64,
    ) -> &DecryptionAuthorization {
        self.state = SessionState::Authorized;
        self.authorization.insert(DecryptionAuthorization::sign(
            signing_key,
            domain,
            self.handle,
            decryptor.public_key(),
            not_after,
        ))
    }

    /// Open the engine's answer; `Authorized -> Decrypted`
    pub fn complete(&mut self, sealed: &SealedPlaintext, decryptor: &ClientDecryptor) -> EngineResult<u64> {
        if self.state != SessionState::Authorized {
            return Err(EngineError::UnauthorizedSigner("session was never authorized".to_string()));
        }
        if sealed.handle != self.handle {
            return Err(EngineError::InvalidCiphertext(format!(
                "expected {} but got {}",
                self.handle, sealed.handle
            )));
        }

        let plaintext = decryptor.open(sealed)?;
        self.plaintext = Some(plaintext);
        self.state = SessionState::Decrypted;
        Ok(plaintext)
    }

    /// Plaintext, once decrypted
    pub fn plaintext(&self) -> Option<u64> {
        self.plaintext
    }
}
