//! Input ingestion
//!
//! Clients encrypt locally under the published [`PublicKey`], which cannot
//! decrypt, and submit the ciphertext together with a proof that
//! binds it to a contract and a principal. The engine accepts proofs through the
//! [`InputVerifier`] seam; [`CoprocessorVerifier`] accepts ed25519 attestations
//! from a configured set of coprocessors.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use umbra_fhe::{BitWidth, CiphertextBlob, FheValue, PublicKey};

use crate::config::ConfigError;
use crate::error::EngineResult;
use crate::types::Address;

const ATTESTATION_DOMAIN: &[u8] = b"umbra.input.v1";

/// Serialized proof length: coprocessor key followed by signature
pub const INPUT_PROOF_LEN: usize = 32 + 64;

/// Client-encrypted value awaiting ingestion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedInput {
    blob: CiphertextBlob,
}

impl EncryptedInput {
    /// Wrap a serialized ciphertext
    pub fn new(blob: CiphertextBlob) -> Self {
        Self { blob }
    }

    /// Encrypt a plaintext with the network public key
    pub fn encrypt(value: u64, width: BitWidth, public_key: &PublicKey) -> EngineResult<Self> {
        let ct = FheValue::encrypt_public(value, width, public_key)?;
        Ok(Self { blob: ct.to_blob(0)? })
    }

    /// Declared width
    pub fn width(&self) -> BitWidth {
        self.blob.width()
    }

    /// Digest the proof must bind
    pub fn digest(&self) -> [u8; 32] {
        self.blob.digest()
    }

    /// Underlying blob
    pub fn blob(&self) -> &CiphertextBlob {
        &self.blob
    }
}

/// Message a coprocessor signs for an input
pub fn attestation_message(digest: &[u8; 32], contract: &Address, principal: &Address) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(ATTESTATION_DOMAIN);
    hasher.update(digest);
    hasher.update(contract.as_bytes());
    hasher.update(principal.as_bytes());
    *hasher.finalize().as_bytes()
}

/// Checks that an input proof binds a ciphertext to a contract and principal
pub trait InputVerifier: Send + Sync {
    fn verify(&self, digest: &[u8; 32], contract: &Address, principal: &Address, proof: &[u8]) -> bool;
}

/// Attestation by a trusted coprocessor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputProof {
    coprocessor: [u8; 32],
    signature: [u8; 64],
}

impl InputProof {
    /// Serialize to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(INPUT_PROOF_LEN);
        bytes.extend_from_slice(&self.coprocessor);
        bytes.extend_from_slice(&self.signature);
        bytes
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != INPUT_PROOF_LEN {
            return None;
        }
        let mut coprocessor = [0u8; 32];
        let mut signature = [0u8; 64];
        coprocessor.copy_from_slice(&bytes[..32]);
        signature.copy_from_slice(&bytes[32..]);
        Some(Self {
            coprocessor,
            signature,
        })
    }
}

/// Verifier accepting attestations from a fixed coprocessor set
#[derive(Debug, Clone, Default)]
pub struct CoprocessorVerifier {
    keys: Vec<VerifyingKey>,
}

impl CoprocessorVerifier {
    /// Trust the given keys
    pub fn new(keys: Vec<VerifyingKey>) -> Self {
        Self { keys }
    }

    /// Trust the keys listed in configuration
    pub fn from_settings(settings: &crate::config::InputSettings) -> Result<Self, ConfigError> {
        Ok(Self::new(settings.coprocessor_keys()?))
    }

    /// Number of trusted coprocessors
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no coprocessor is trusted
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl InputVerifier for CoprocessorVerifier {
    fn verify(&self, digest: &[u8; 32], contract: &Address, principal: &Address, proof: &[u8]) -> bool {
        let Some(proof) = InputProof::from_bytes(proof) else {
            return false;
        };
        let Some(key) = self.keys.iter().find(|k| k.as_bytes() == &proof.coprocessor) else {
            return false;
        };

        let message = attestation_message(digest, contract, principal);
        let signature = Signature::from_bytes(&proof.signature);
        key.verify(&message, &signature).is_ok()
    }
}

/// Coprocessor signing identity
pub struct Coprocessor {
    signing_key: SigningKey,
}

impl Coprocessor {
    /// Generate a new random coprocessor key
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::new(SigningKey::from_bytes(&seed))
    }

    /// Use an existing signing key
    pub fn new(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }

    /// Public key to list in configuration
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Attest that `digest` belongs to `contract` and `principal`
    pub fn attest(&self, digest: &[u8; 32], contract: &Address, principal: &Address) -> InputProof {
        let message = attestation_message(digest, contract, principal);
        InputProof {
            coprocessor: self.signing_key.verifying_key().to_bytes(),
            signature: self.signing_key.sign(&message).to_bytes(),
        }
    }
}

/// Client-side helper producing attested inputs
pub struct InputBuilder<'a> {
    public_key: &'a PublicKey,
    contract: Address,
    principal: Address,
}

impl<'a> InputBuilder<'a> {
    /// Inputs for `principal` calling `contract`
    pub fn new(public_key: &'a PublicKey, contract: Address, principal: Address) -> Self {
        Self {
            public_key,
            contract,
            principal,
        }
    }

    /// Encrypt a value and have it attested
    pub fn encrypt(
        &self,
        value: u64,
        width: BitWidth,
        coprocessor: &Coprocessor,
    ) -> EngineResult<(EncryptedInput, InputProof)> {
        let input = EncryptedInput::encrypt(value, width, self.public_key)?;
        let proof = coprocessor.attest(&input.digest(), &self.contract, &self.principal);
        Ok((input, proof))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Coprocessor, CoprocessorVerifier, [u8; 32], Address, Address) {
        let coprocessor = Coprocessor::new(SigningKey::from_bytes(&[11u8; 32]));
        let verifier = CoprocessorVerifier::new(vec![coprocessor.verifying_key()]);
        let digest = *blake3::hash(b"ciphertext").as_bytes();
        (
            coprocessor,
            verifier,
            digest,
            Address::from_label("contract"),
            Address::from_label("alice"),
        )
    }

    #[test]
    fn test_attestation_verifies() {
        let (coprocessor, verifier, digest, contract, alice) = setup();
        let proof = coprocessor.attest(&digest, &contract, &alice);
        assert!(verifier.verify(&digest, &contract, &alice, &proof.to_bytes()));
    }

    #[test]
    fn test_attestation_bound_to_principal_and_contract() {
        let (coprocessor, verifier, digest, contract, alice) = setup();
        let proof = coprocessor.attest(&digest, &contract, &alice).to_bytes();

        let bob = Address::from_label("bob");
        assert!(!verifier.verify(&digest, &contract, &bob, &proof));
        assert!(!verifier.verify(&digest, &Address::from_label("other"), &alice, &proof));

        let other_digest = *blake3::hash(b"other").as_bytes();
        assert!(!verifier.verify(&other_digest, &contract, &alice, &proof));
    }

    #[test]
    fn test_untrusted_coprocessor_rejected() {
        let (_, verifier, digest, contract, alice) = setup();
        let rogue = Coprocessor::generate();
        let proof = rogue.attest(&digest, &contract, &alice);
        assert!(!verifier.verify(&digest, &contract, &alice, &proof.to_bytes()));
    }

    #[test]
    fn test_malformed_proof_rejected() {
        let (_, verifier, digest, contract, alice) = setup();
        assert!(!verifier.verify(&digest, &contract, &alice, &[]));
        assert!(!verifier.verify(&digest, &contract, &alice, &[0u8; INPUT_PROOF_LEN]));
        assert!(InputProof::from_bytes(&[0u8; 10]).is_none());
    }
}
