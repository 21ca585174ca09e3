//! Ciphertext Store
//!
//! Maps handles to ciphertexts and their ACLs. Entries are write-once; the
//! only mutable part of an entry is its grant set, guarded by a per-entry lock.
//! Handles are spread over independently locked shards, so unrelated creations
//! and lookups do not contend.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};
use umbra_fhe::{BitWidth, Conformance, FheValue};

use crate::acl::{AclSet, RevocationNotice};
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::input::{EncryptedInput, InputVerifier};
use crate::types::{AclKind, Address, Binding, Handle, Origin};

/// A stored ciphertext with its metadata
pub struct Ciphertext {
    handle: Handle,
    value: FheValue,
    binding: Binding,
    origin: Origin,
    depth: u32,
    acl: Mutex<AclSet>,
}

impl Ciphertext {
    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub(crate) fn handle_bytes(&self) -> &[u8] {
        self.handle.as_bytes()
    }

    /// Encrypted payload
    pub fn value(&self) -> &FheValue {
        &self.value
    }

    pub fn width(&self) -> BitWidth {
        self.value.width()
    }

    /// Contract and principal the ciphertext belongs to
    pub fn binding(&self) -> Binding {
        self.binding
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Operation depth since ingestion (noise proxy)
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Check a grant
    pub fn allows(&self, principal: &Address, kind: AclKind) -> bool {
        self.acl.lock().allows(principal, kind)
    }

    /// Snapshot of the grant set
    pub fn acl(&self) -> AclSet {
        self.acl.lock().clone()
    }
}

impl std::fmt::Debug for Ciphertext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ciphertext")
            .field("handle", &self.handle)
            .field("width", &self.width())
            .field("origin", &self.origin)
            .field("depth", &self.depth)
            .finish()
    }
}

type Shard = RwLock<HashMap<Handle, Arc<Ciphertext>>>;

/// Sharded handle -> ciphertext map
pub struct CiphertextStore {
    engine: Address,
    shards: Vec<Shard>,
    nonce: AtomicU64,
    verifier: Arc<dyn InputVerifier>,
    conformance: Conformance,
    max_acl_entries: usize,
    events: EventBus,
}

impl CiphertextStore {
    /// Create an empty store accepting inputs that conform to `conformance`
    pub fn new(
        engine: Address,
        shard_count: usize,
        verifier: Arc<dyn InputVerifier>,
        conformance: Conformance,
        max_acl_entries: usize,
        events: EventBus,
    ) -> Self {
        let shards = (0..shard_count.max(1)).map(|_| RwLock::new(HashMap::new())).collect();
        Self {
            engine,
            shards,
            nonce: AtomicU64::new(0),
            verifier,
            conformance,
            max_acl_entries,
            events,
        }
    }

    fn shard(&self, handle: &Handle) -> &Shard {
        let bytes = handle.as_bytes();
        let key = u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]);
        &self.shards[(key % self.shards.len() as u64) as usize]
    }

    /// Ingest a client ciphertext.
    ///
    /// The proof must bind the ciphertext to `contract` and `principal`, and the
    /// ciphertext must conform to the engine's key parameters. The new handle
    /// carries no grants.
    pub fn create(
        &self,
        input: &EncryptedInput,
        contract: &Address,
        principal: &Address,
        proof: &[u8],
    ) -> EngineResult<Handle> {
        let digest = input.digest();
        if !self.verifier.verify(&digest, contract, principal, proof) {
            warn!(%contract, %principal, "rejected input with invalid proof");
            return Err(EngineError::InvalidProof(format!(
                "proof does not bind input to {} / {}",
                contract, principal
            )));
        }

        let value = input.blob().decode(&self.conformance)?;
        let binding = Binding {
            contract: *contract,
            principal: *principal,
        };

        Ok(self.insert(value, binding, Origin::Input, 0, &[&digest]))
    }

    /// Store an operation output under a fresh handle with an empty ACL
    pub(crate) fn insert(
        &self,
        value: FheValue,
        binding: Binding,
        origin: Origin,
        depth: u32,
        parts: &[&[u8]],
    ) -> Handle {
        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
        let handle = Handle::derive(&self.engine, nonce, value.width(), parts);

        let entry = Arc::new(Ciphertext {
            handle,
            value,
            binding,
            origin,
            depth,
            acl: Mutex::new(AclSet::default()),
        });
        self.shard(&handle).write().insert(handle, entry);

        debug!(%handle, ?origin, depth, "stored ciphertext");
        self.events.emit(EngineEvent::HandleCreated { handle, origin });
        handle
    }

    /// Look up a ciphertext
    pub fn get(&self, handle: &Handle) -> EngineResult<Arc<Ciphertext>> {
        self.shard(handle)
            .read()
            .get(handle)
            .cloned()
            .ok_or(EngineError::UnknownHandle(*handle))
    }

    /// Add a grant. Idempotent; returns whether the grant is new.
    pub fn grant(&self, handle: &Handle, principal: &Address, kind: AclKind) -> EngineResult<bool> {
        let entry = self.get(handle)?;
        let mut acl = entry.acl.lock();

        if acl.allows(principal, kind) {
            return Ok(false);
        }
        if acl.len() >= self.max_acl_entries {
            return Err(EngineError::AclLimit {
                handle: *handle,
                limit: self.max_acl_entries,
            });
        }

        acl.grant(*principal, kind);
        drop(acl);

        self.events.emit(EngineEvent::AccessGranted {
            handle: *handle,
            principal: *principal,
            kind,
        });
        Ok(true)
    }

    /// Add several grants under one lock: either all of them are recorded or,
    /// when they would push the ACL past its limit, none are.
    pub fn grant_all(&self, handle: &Handle, grants: &BTreeSet<(Address, AclKind)>) -> EngineResult<usize> {
        let entry = self.get(handle)?;
        let mut acl = entry.acl.lock();

        let new: Vec<_> = grants.iter().filter(|(p, k)| !acl.allows(p, *k)).copied().collect();
        if acl.len() + new.len() > self.max_acl_entries {
            return Err(EngineError::AclLimit {
                handle: *handle,
                limit: self.max_acl_entries,
            });
        }
        for (principal, kind) in &new {
            acl.grant(*principal, *kind);
        }
        drop(acl);

        for (principal, kind) in &new {
            self.events.emit(EngineEvent::AccessGranted {
                handle: *handle,
                principal: *principal,
                kind: *kind,
            });
        }
        Ok(new.len())
    }

    /// Largest number of grants one handle may carry
    pub fn max_acl_entries(&self) -> usize {
        self.max_acl_entries
    }

    /// Ask for a principal's access to be withdrawn.
    ///
    /// Nothing is removed. The notice lists the grants that stay effective and
    /// flags that rotation is needed.
    pub fn revoke_conceptually(&self, handle: &Handle, principal: &Address) -> EngineResult<RevocationNotice> {
        let entry = self.get(handle)?;
        let still_effective = entry.acl.lock().kinds_for(principal);

        warn!(
            %handle,
            %principal,
            grants = still_effective.len(),
            "revocation is advisory; rotate the ciphertext to cut access"
        );
        self.events.emit(EngineEvent::RevocationRequested {
            handle: *handle,
            principal: *principal,
        });

        Ok(RevocationNotice {
            handle: *handle,
            principal: *principal,
            rotation_required: !still_effective.is_empty(),
            still_effective,
        })
    }

    /// Check a grant
    pub fn is_allowed(&self, handle: &Handle, principal: &Address, kind: AclKind) -> EngineResult<bool> {
        Ok(self.get(handle)?.allows(principal, kind))
    }

    /// Number of grants on a handle
    pub fn acl_len(&self, handle: &Handle) -> EngineResult<usize> {
        Ok(self.get(handle)?.acl.lock().len())
    }

    /// Number of stored ciphertexts
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Engine address handles are derived under
    pub fn engine(&self) -> Address {
        self.engine
    }
}

impl std::fmt::Debug for CiphertextStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CiphertextStore")
            .field("engine", &self.engine)
            .field("shards", &self.shards.len())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{Coprocessor, CoprocessorVerifier};
    use crate::test_support::{conformance, KEYS};
    use ed25519_dalek::SigningKey;

    struct Fixture {
        store: CiphertextStore,
        coprocessor: Coprocessor,
        contract: Address,
        alice: Address,
    }

    fn fixture(max_acl_entries: usize) -> Fixture {
        let coprocessor = Coprocessor::new(SigningKey::from_bytes(&[21u8; 32]));
        let verifier = Arc::new(CoprocessorVerifier::new(vec![coprocessor.verifying_key()]));
        Fixture {
            store: CiphertextStore::new(
                Address::from_label("engine"),
                4,
                verifier,
                conformance(),
                max_acl_entries,
                EventBus::default(),
            ),
            coprocessor,
            contract: Address::from_label("contract"),
            alice: Address::from_label("alice"),
        }
    }

    fn create(f: &Fixture, value: u64) -> Handle {
        let input = EncryptedInput::encrypt(value, BitWidth::U8, &KEYS.public).unwrap();
        let proof = f.coprocessor.attest(&input.digest(), &f.contract, &f.alice);
        f.store.create(&input, &f.contract, &f.alice, &proof.to_bytes()).unwrap()
    }

    #[test]
    fn test_create_and_get() {
        let f = fixture(16);
        let handle = create(&f, 42);

        let ct = f.store.get(&handle).unwrap();
        assert_eq!(ct.width(), BitWidth::U8);
        assert_eq!(ct.origin(), Origin::Input);
        assert_eq!(ct.binding().principal, f.alice);
        assert_eq!(ct.value().decrypt(&KEYS.client), 42);
        assert_eq!(handle.width(), Some(BitWidth::U8));
        assert_eq!(f.store.acl_len(&handle).unwrap(), 0);
        assert_eq!(f.store.len(), 1);
    }

    #[test]
    fn test_create_rejects_bad_proof() {
        let f = fixture(16);
        let input = EncryptedInput::encrypt(1, BitWidth::U8, &KEYS.public).unwrap();
        let bob = Address::from_label("bob");
        let proof = f.coprocessor.attest(&input.digest(), &f.contract, &bob);

        let result = f.store.create(&input, &f.contract, &f.alice, &proof.to_bytes());
        assert!(matches!(result, Err(EngineError::InvalidProof(_))));
        assert!(f.store.is_empty());
    }

    #[test]
    fn test_create_rejects_garbage_ciphertext() {
        let f = fixture(16);
        let input = EncryptedInput::new(umbra_fhe::CiphertextBlob::new(vec![1, 2, 3], BitWidth::U8));
        let proof = f.coprocessor.attest(&input.digest(), &f.contract, &f.alice);

        let result = f.store.create(&input, &f.contract, &f.alice, &proof.to_bytes());
        assert!(matches!(result, Err(EngineError::InvalidCiphertext(_))));
    }

    #[test]
    fn test_create_rejects_nonconforming_ciphertext() {
        let f = fixture(16);
        // a well-formed 64-bit ciphertext declared as 8-bit
        let wide = EncryptedInput::encrypt(9, BitWidth::U64, &KEYS.public).unwrap();
        let input = EncryptedInput::new(umbra_fhe::CiphertextBlob::new(wide.blob().data().to_vec(), BitWidth::U8));
        let proof = f.coprocessor.attest(&input.digest(), &f.contract, &f.alice);

        let result = f.store.create(&input, &f.contract, &f.alice, &proof.to_bytes());
        assert!(matches!(result, Err(EngineError::InvalidCiphertext(_))));
        assert!(f.store.is_empty());
    }

    #[test]
    fn test_unknown_handle() {
        let f = fixture(16);
        let missing = Handle::from_bytes([9u8; 32]);
        assert!(matches!(f.store.get(&missing), Err(EngineError::UnknownHandle(_))));
        assert!(f.store.grant(&missing, &f.alice, AclKind::Decrypt).is_err());
    }

    #[test]
    fn test_grant_idempotent_and_revoke_advisory() {
        let f = fixture(16);
        let handle = create(&f, 5);

        assert!(f.store.grant(&handle, &f.alice, AclKind::Decrypt).unwrap());
        assert!(!f.store.grant(&handle, &f.alice, AclKind::Decrypt).unwrap());
        assert_eq!(f.store.acl_len(&handle).unwrap(), 1);

        let notice = f.store.revoke_conceptually(&handle, &f.alice).unwrap();
        assert!(notice.rotation_required);
        assert_eq!(notice.still_effective, vec![AclKind::Decrypt]);
        assert!(f.store.is_allowed(&handle, &f.alice, AclKind::Decrypt).unwrap());
    }

    #[test]
    fn test_acl_limit() {
        let f = fixture(2);
        let handle = create(&f, 5);

        f.store.grant(&handle, &f.alice, AclKind::Decrypt).unwrap();
        f.store.grant(&handle, &f.alice, AclKind::Compute).unwrap();
        let result = f.store.grant(&handle, &f.contract, AclKind::Compute);
        assert!(matches!(result, Err(EngineError::AclLimit { limit: 2, .. })));
    }

    #[test]
    fn test_grant_all_is_all_or_nothing() {
        let f = fixture(2);
        let handle = create(&f, 5);
        let bob = Address::from_label("bob");

        let too_many: BTreeSet<_> = [
            (f.alice, AclKind::Decrypt),
            (f.alice, AclKind::Compute),
            (bob, AclKind::Decrypt),
        ]
        .into_iter()
        .collect();
        let result = f.store.grant_all(&handle, &too_many);
        assert!(matches!(result, Err(EngineError::AclLimit { limit: 2, .. })));
        assert_eq!(f.store.acl_len(&handle).unwrap(), 0);

        let fits: BTreeSet<_> = [(f.alice, AclKind::Decrypt), (bob, AclKind::Decrypt)].into_iter().collect();
        assert_eq!(f.store.grant_all(&handle, &fits).unwrap(), 2);
        assert_eq!(f.store.grant_all(&handle, &fits).unwrap(), 0);
        assert_eq!(f.store.acl_len(&handle).unwrap(), 2);
    }

    #[test]
    fn test_concurrent_grants_on_one_handle() {
        let f = Arc::new(fixture(1024));
        let handle = create(&f, 5);

        let threads: Vec<_> = (0..8)
            .map(|i| {
                let f = f.clone();
                std::thread::spawn(move || {
                    let principal = Address::from_label(&format!("user-{}", i));
                    f.store.grant(&handle, &principal, AclKind::Decrypt).unwrap();
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(f.store.acl_len(&handle).unwrap(), 8);
    }
}
