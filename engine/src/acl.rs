//! Access Control Layer
//!
//! Two independent grant kinds per (handle, principal):
//! - `Compute`: the handle may be used as an operation input
//! - `Decrypt`: the principal may request decryption
//!
//! Grants are add-only. A revocation request produces an advisory notice and
//! never removes anything; the only way to cut someone off is to rotate the
//! ciphertext to a new handle and regrant to the remaining holders.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::store::CiphertextStore;
use crate::types::{AclKind, Address, Handle};

/// Grants attached to one handle
#[derive(Debug, Clone, Default)]
pub struct AclSet {
    entries: BTreeSet<(Address, AclKind)>,
}

impl AclSet {
    /// Add a grant; returns false if it was already present
    pub fn grant(&mut self, principal: Address, kind: AclKind) -> bool {
        self.entries.insert((principal, kind))
    }

    /// Check a grant
    pub fn allows(&self, principal: &Address, kind: AclKind) -> bool {
        self.entries.contains(&(*principal, kind))
    }

    /// Grant kinds held by one principal
    pub fn kinds_for(&self, principal: &Address) -> Vec<AclKind> {
        self.entries
            .iter()
            .filter(|(p, _)| p == principal)
            .map(|(_, kind)| *kind)
            .collect()
    }

    /// All grants
    pub fn entries(&self) -> impl Iterator<Item = &(Address, AclKind)> {
        self.entries.iter()
    }

    /// Number of grants
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no grants exist
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Advisory answer to a revocation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocationNotice {
    pub handle: Handle,
    pub principal: Address,
    /// Grants the principal still holds, unchanged
    pub still_effective: Vec<AclKind>,
    /// Rotation to a new handle is needed to actually cut access
    pub rotation_required: bool,
}

/// Engine-level grant entry points
pub struct AccessControl {
    store: Arc<CiphertextStore>,
}

impl AccessControl {
    /// Create over a store
    pub fn new(store: Arc<CiphertextStore>) -> Self {
        Self { store }
    }

    /// Grant `kind` on `handle` to `grantee`.
    ///
    /// The granter must be the contract the handle is bound to, or already
    /// hold a grant of the same kind. A `Compute` holder cannot hand out
    /// `Decrypt`, to others or to itself.
    pub fn allow(
        &self,
        handle: &Handle,
        granter: &Address,
        grantee: &Address,
        kind: AclKind,
    ) -> EngineResult<()> {
        let ciphertext = self.store.get(handle)?;

        let is_owner = ciphertext.binding().contract == *granter;
        if !is_owner && !ciphertext.allows(granter, kind) {
            warn!(%handle, %granter, %kind, "grant attempt without authority");
            return Err(EngineError::PermissionDenied {
                handle: *handle,
                principal: *granter,
                kind,
            });
        }

        self.store.grant(handle, grantee, kind)?;
        debug!(%handle, %grantee, %kind, "access granted");
        Ok(())
    }

    /// Grant `Compute` to the granter itself
    pub fn allow_this(&self, handle: &Handle, granter: &Address) -> EngineResult<()> {
        self.allow(handle, granter, granter, AclKind::Compute)
    }

    /// Fail unless `principal` holds `kind` on `handle`
    pub fn require(&self, handle: &Handle, principal: &Address, kind: AclKind) -> EngineResult<()> {
        if self.store.is_allowed(handle, principal, kind)? {
            Ok(())
        } else {
            Err(EngineError::PermissionDenied {
                handle: *handle,
                principal: *principal,
                kind,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::input::EncryptedInput;
    use crate::test_support::{conformance, AcceptAll, KEYS};
    use umbra_fhe::BitWidth;

    fn setup() -> (AccessControl, Arc<CiphertextStore>, Handle, Address) {
        let store = Arc::new(CiphertextStore::new(
            Address::from_label("engine"),
            2,
            Arc::new(AcceptAll),
            conformance(),
            16,
            EventBus::default(),
        ));
        let contract = Address::from_label("contract");
        let input = EncryptedInput::encrypt(8, BitWidth::U8, &KEYS.public).unwrap();
        let handle = store.create(&input, &contract, &contract, &[]).unwrap();
        (AccessControl::new(store.clone()), store, handle, contract)
    }

    #[test]
    fn test_compute_holder_cannot_grant_decrypt() {
        let (acl, store, handle, contract) = setup();
        let bob = Address::from_label("bob");
        let carol = Address::from_label("carol");
        acl.allow(&handle, &contract, &bob, AclKind::Compute).unwrap();

        for grantee in [bob, carol] {
            let result = acl.allow(&handle, &bob, &grantee, AclKind::Decrypt);
            assert!(matches!(
                result,
                Err(EngineError::PermissionDenied { kind: AclKind::Decrypt, principal, .. }) if principal == bob
            ));
            assert!(!store.is_allowed(&handle, &grantee, AclKind::Decrypt).unwrap());
        }

        // passing on the kind it holds is still allowed
        acl.allow(&handle, &bob, &carol, AclKind::Compute).unwrap();
        assert!(store.is_allowed(&handle, &carol, AclKind::Compute).unwrap());
    }

    #[test]
    fn test_decrypt_holder_passes_on_decrypt_only() {
        let (acl, store, handle, contract) = setup();
        let alice = Address::from_label("alice");
        let dave = Address::from_label("dave");
        acl.allow(&handle, &contract, &alice, AclKind::Decrypt).unwrap();

        acl.allow(&handle, &alice, &dave, AclKind::Decrypt).unwrap();
        assert!(store.is_allowed(&handle, &dave, AclKind::Decrypt).unwrap());
        assert!(matches!(
            acl.allow_this(&handle, &alice),
            Err(EngineError::PermissionDenied { kind: AclKind::Compute, .. })
        ));
    }

    #[test]
    fn test_acl_set_is_monotonic() {
        let mut acl = AclSet::default();
        let alice = Address::from_label("alice");

        assert!(acl.grant(alice, AclKind::Decrypt));
        assert!(!acl.grant(alice, AclKind::Decrypt));
        assert!(acl.allows(&alice, AclKind::Decrypt));
        assert!(!acl.allows(&alice, AclKind::Compute));
        assert_eq!(acl.len(), 1);
    }

    #[test]
    fn test_kinds_are_independent() {
        let mut acl = AclSet::default();
        let alice = Address::from_label("alice");
        let bob = Address::from_label("bob");

        acl.grant(alice, AclKind::Compute);
        acl.grant(alice, AclKind::Decrypt);
        acl.grant(bob, AclKind::Compute);

        assert_eq!(acl.kinds_for(&alice), vec![AclKind::Compute, AclKind::Decrypt]);
        assert_eq!(acl.kinds_for(&bob), vec![AclKind::Compute]);
        assert!(acl.kinds_for(&Address::ZERO).is_empty());
    }
}
