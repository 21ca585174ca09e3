//! Umbra: confidential state engine
//!
//! Root crate re-exporting the Umbra components for integration testing and
//! embedding.
//!
//! ## Crate Organization
//!
//! - `umbra-fhe`: TFHE keys, typed encrypted integers and the operation cost model
//! - `umbra-storage`: redb-backed public decryption request lifecycle
//! - `umbra-engine`: ciphertext store, ACL, homomorphic operations and both
//!   decryption protocols

pub mod logging;

pub use umbra_engine as engine;
pub use umbra_fhe as fhe;
pub use umbra_storage as storage;

/// Umbra protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build an engine from a config file, initialising logging from its
/// `[logging]` section. Client decryptions go through `key_service`.
pub fn launch(
    path: &std::path::Path,
    server_key: fhe::ServerKey,
    key_service: std::sync::Arc<dyn engine::KeyService>,
) -> anyhow::Result<engine::ConfidentialEngine> {
    let config = engine::EngineConfig::load(path)?;
    logging::init_from_settings(&config.logging)?;
    Ok(engine::ConfidentialEngine::new(config, server_key, key_service)?)
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use umbra_engine::{
        AclKind, Address, ClientDecryptor, ConfidentialEngine, Coprocessor, DecryptionAuthorization,
        DecryptionSession, DecryptorNode, EncryptedInput, EngineConfig, EngineError, EngineEvent,
        Handle, InputBuilder, KeyService, Relayer, RelayerHandle, RequestId, SealedPlaintext,
    };
    pub use umbra_fhe::{BitWidth, ClientKey, Conformance, FheConfig, KeySet, PublicKey, ServerKey};
    pub use umbra_storage::RequestStatus;
}
