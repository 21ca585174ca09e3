//! Confidential state engine facade
//!
//! Wires the ciphertext store, access control, operation engine and both
//! decryption protocols together from one [`EngineConfig`]. Methods that need
//! a timestamp use the wall clock; the components underneath take it explicitly.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::broadcast;
use tracing::info;
use umbra_fhe::{BitWidth, FheEvaluator, ServerKey};
use umbra_storage::{RequestStatus, Storage, StorageConfig};

use crate::acl::{AccessControl, RevocationNotice};
use crate::client::{
    ClientDecryption, DecryptionAuthorization, DecryptionDomain, KeyService, SealedCiphertext,
    SealedPlaintext,
};
use crate::config::{ConfigError, EngineConfig};
use crate::error::EngineResult;
use crate::events::{EngineEvent, EventBus, DEFAULT_EVENT_CAPACITY};
use crate::input::{CoprocessorVerifier, EncryptedInput, InputVerifier};
use crate::ops::{CostMeter, OperationEngine};
use crate::public::PublicDecryption;
use crate::store::{Ciphertext, CiphertextStore};
use crate::types::{AclKind, Address, Handle, RequestId};

/// Current unix time in seconds
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The confidential state engine
pub struct ConfidentialEngine {
    config: EngineConfig,
    address: Address,
    store: Arc<CiphertextStore>,
    acl: AccessControl,
    ops: OperationEngine,
    client: ClientDecryption,
    public: PublicDecryption,
    storage: Storage,
    events: EventBus,
}

impl ConfidentialEngine {
    /// Build an engine that accepts inputs attested by the configured
    /// coprocessors and answers client decryptions through `key_service`
    pub fn new(config: EngineConfig, server_key: ServerKey, key_service: Arc<dyn KeyService>) -> EngineResult<Self> {
        let verifier = Arc::new(CoprocessorVerifier::from_settings(&config.input)?);
        Self::with_verifier(config, server_key, verifier, key_service)
    }

    /// Build an engine with a custom input verifier
    pub fn with_verifier(
        config: EngineConfig,
        server_key: ServerKey,
        verifier: Arc<dyn InputVerifier>,
        key_service: Arc<dyn KeyService>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let address = config.engine.address()?;
        let gateway = config.public_decryption.gateway()?.ok_or_else(|| {
            ConfigError::Invalid("public_decryption.gateway must be set".to_string())
        })?;

        let storage = Storage::with_config(StorageConfig {
            path: config.storage.path.clone(),
        })?;
        let events = EventBus::new(DEFAULT_EVENT_CAPACITY);

        let store = Arc::new(CiphertextStore::new(
            address,
            config.engine.shard_count,
            verifier,
            server_key.conformance(),
            config.acl.max_entries_per_handle,
            events.clone(),
        ));
        let ops = OperationEngine::new(
            store.clone(),
            FheEvaluator::new(server_key),
            CostMeter::new(config.cost.budget_per_window),
        );
        let client = ClientDecryption::new(
            store.clone(),
            DecryptionDomain::from_settings(&config.engine, address),
            key_service,
        );
        let public = PublicDecryption::new(
            store.clone(),
            storage.requests.clone(),
            gateway,
            config.public_decryption.request_ttl_secs,
            events.clone(),
        );

        info!(
            engine = %address,
            gateway = %gateway,
            chain_id = config.engine.chain_id,
            shards = config.engine.shard_count,
            "confidential engine initialised"
        );

        Ok(Self {
            acl: AccessControl::new(store.clone()),
            config,
            address,
            store,
            ops,
            client,
            public,
            storage,
            events,
        })
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Engine address
    pub fn address(&self) -> Address {
        self.address
    }

    /// Configured gateway identity
    pub fn gateway(&self) -> Address {
        self.public.gateway()
    }

    /// Signing domain for decryption authorizations
    pub fn domain(&self) -> &DecryptionDomain {
        self.client.domain()
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &CiphertextStore {
        &self.store
    }

    pub fn ops(&self) -> &OperationEngine {
        &self.ops
    }

    pub fn public(&self) -> &PublicDecryption {
        &self.public
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    // Ciphertext store

    /// Ingest a client input bound to `contract` and `principal`
    pub fn create(
        &self,
        input: &EncryptedInput,
        contract: &Address,
        principal: &Address,
        proof: &[u8],
    ) -> EngineResult<Handle> {
        self.store.create(input, contract, principal, proof)
    }

    /// Look up a ciphertext. Only decryptor nodes can read its payload.
    pub fn get(&self, handle: &Handle) -> EngineResult<Arc<Ciphertext>> {
        self.store.get(handle)
    }

    /// Advisory revocation
    pub fn revoke_conceptually(&self, handle: &Handle, principal: &Address) -> EngineResult<RevocationNotice> {
        self.store.revoke_conceptually(handle, principal)
    }

    /// Check a grant
    pub fn is_allowed(&self, handle: &Handle, principal: &Address, kind: AclKind) -> EngineResult<bool> {
        self.store.is_allowed(handle, principal, kind)
    }

    // Access control

    /// Grant `kind` on `handle` to `grantee`, on behalf of `granter`
    pub fn allow(&self, handle: &Handle, granter: &Address, grantee: &Address, kind: AclKind) -> EngineResult<()> {
        self.acl.allow(handle, granter, grantee, kind)
    }

    /// Grant `Compute` on `handle` to `granter` itself
    pub fn allow_this(&self, handle: &Handle, granter: &Address) -> EngineResult<()> {
        self.acl.allow_this(handle, granter)
    }

    // Operations

    pub fn add(&self, a: &Handle, b: &Handle, caller: &Address) -> EngineResult<Handle> {
        self.ops.add(a, b, caller)
    }

    pub fn sub(&self, a: &Handle, b: &Handle, caller: &Address) -> EngineResult<Handle> {
        self.ops.sub(a, b, caller)
    }

    pub fn mul(&self, a: &Handle, b: &Handle, caller: &Address) -> EngineResult<Handle> {
        self.ops.mul(a, b, caller)
    }

    pub fn eq(&self, a: &Handle, b: &Handle, caller: &Address) -> EngineResult<Handle> {
        self.ops.eq(a, b, caller)
    }

    pub fn lt(&self, a: &Handle, b: &Handle, caller: &Address) -> EngineResult<Handle> {
        self.ops.lt(a, b, caller)
    }

    pub fn select(&self, cond: &Handle, if_true: &Handle, if_false: &Handle, caller: &Address) -> EngineResult<Handle> {
        self.ops.select(cond, if_true, if_false, caller)
    }

    pub fn scale(&self, a: &Handle, k: u64, caller: &Address) -> EngineResult<Handle> {
        self.ops.scale(a, k, caller)
    }

    /// Rotate to a new handle, regranting only `keep`
    pub fn rotate(&self, a: &Handle, caller: &Address, keep: &[(Address, AclKind)]) -> EngineResult<Handle> {
        self.ops.rotate(a, caller, keep)
    }

    pub fn trivial(&self, value: u64, width: BitWidth, caller: &Address) -> EngineResult<Handle> {
        self.ops.trivial(value, width, caller)
    }

    /// Start a new cost window
    pub fn reset_cost_window(&self) {
        self.ops.meter().reset_window();
    }

    // Client decryption

    /// Release a plaintext, sealed to its re-encryption key, to a signed,
    /// permitted principal
    pub fn request_decryption(
        &self,
        handle: &Handle,
        principal: &Address,
        authorization: &DecryptionAuthorization,
    ) -> EngineResult<SealedPlaintext> {
        self.client.request_decryption(handle, principal, authorization, now_secs())
    }

    // Public decryption

    /// Queue a public decryption for the gateway
    pub fn request_public_decryption(&self, handle: &Handle, requester: &Address) -> EngineResult<RequestId> {
        self.public.request_public_decryption(handle, requester, now_secs())
    }

    /// Ciphertext of a pending request, for the decryptor nodes
    pub fn sealed_request(&self, request_id: RequestId) -> EngineResult<SealedCiphertext> {
        self.public.sealed_request(request_id)
    }

    /// Gateway callback
    pub fn fulfill(&self, request_id: RequestId, plaintext: u64, caller: &Address) -> EngineResult<()> {
        self.public.fulfill(request_id, plaintext, caller, now_secs())
    }

    pub fn status(&self, request_id: RequestId) -> EngineResult<Option<RequestStatus>> {
        self.public.status(request_id)
    }

    pub fn public_value(&self, request_id: RequestId) -> EngineResult<Option<u64>> {
        self.public.public_value(request_id)
    }

    pub fn pending(&self) -> EngineResult<Vec<RequestId>> {
        self.public.pending()
    }

    /// Expire stale requests; a no-op unless a request TTL is configured
    pub fn expire_stale(&self, now: u64) -> EngineResult<Vec<RequestId>> {
        self.public.expire_stale(now)
    }
}

impl std::fmt::Debug for ConfidentialEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfidentialEngine")
            .field("address", &self.address)
            .field("store", &self.store)
            .field("events", &self.events)
            .finish()
    }
}
