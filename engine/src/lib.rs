//! Umbra Confidential State Engine
//!
//! Stores encrypted integers behind opaque handles, computes on them
//! homomorphically and controls who may use or decrypt them.
//!
//! # Architecture
//!
//! ```text
//!   client ──EncryptedInput + proof──▶ CiphertextStore ◀── AccessControl
//!                                           │
//!                                    OperationEngine (FHE, cost meter)
//!                                           │
//!        ┌──────────────────────────────────┴───────────────────────┐
//!        ▼                                                          ▼
//!  ClientDecryption                                        PublicDecryption
//!  (signed request, KeyService                             (redb request lifecycle,
//!   re-seals to client X25519 key)                          gateway-only fulfil)
//!                                                                   │
//!                                                       events ──▶ Relayer ──▶ DecryptorNodes
//! ```
//!
//! # Access rules
//!
//! - Using a handle as an operation input requires a `Compute` grant
//! - Decrypting a handle, privately or publicly, requires a `Decrypt` grant
//! - Operation outputs start with no grants at all
//! - Grants are never removed; rotate a ciphertext to cut access
//!
//! # Keys
//!
//! Clients hold only the network public key and their own X25519 key pair.
//! The engine holds the server key. The network client key lives with the
//! decryptor nodes behind [`KeyService`].

pub mod acl;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod gateway;
pub mod input;
pub mod ops;
pub mod public;
pub mod store;
pub mod types;

pub use acl::{AccessControl, AclSet, RevocationNotice};
pub use client::{
    ClientDecryption, ClientDecryptor, DecryptionAuthorization, DecryptionDomain,
    DecryptionSession, KeyService, SealedCiphertext, SealedPlaintext, SessionState,
};
pub use config::{ConfigError, EngineConfig, LoggingSettings};
pub use engine::{now_secs, ConfidentialEngine};
pub use error::{EngineError, EngineResult};
pub use events::{EngineEvent, EventBus};
pub use gateway::{DecryptionResponse, DecryptorNode, QuorumCollector, Relayer, RelayerHandle};
pub use input::{
    Coprocessor, CoprocessorVerifier, EncryptedInput, InputBuilder, InputProof, InputVerifier,
};
pub use ops::{CostMeter, OperationEngine, ScalePlan};
pub use public::PublicDecryption;
pub use store::{Ciphertext, CiphertextStore};
pub use types::{AclKind, Address, Binding, Handle, Origin, RequestId};
