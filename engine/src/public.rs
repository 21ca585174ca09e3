//! Threshold Public Decryption Protocol
//!
//! `request_public_decryption` records a request and announces it; the
//! plaintext arrives later through `fulfill`, which only the configured gateway
//! may call. The lifecycle is persisted in redb and `fulfill` is exactly-once.
//! Creation and the move to `Pending` share one write transaction:
//!
//! ```text
//! Created -> Pending -> Fulfilled
//!                  \--> Expired      (only with a request TTL)
//! ```

use std::sync::Arc;

use tracing::{debug, info, warn};
use umbra_storage::{DecryptionRecord, RequestStatus, RequestStore, StorageError};

use crate::client::SealedCiphertext;
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::store::CiphertextStore;
use crate::types::{AclKind, Address, Handle, RequestId};

/// Engine side of the public decryption protocol
pub struct PublicDecryption {
    store: Arc<CiphertextStore>,
    requests: Arc<RequestStore>,
    gateway: Address,
    ttl_secs: Option<u64>,
    events: EventBus,
}

impl PublicDecryption {
    pub fn new(
        store: Arc<CiphertextStore>,
        requests: Arc<RequestStore>,
        gateway: Address,
        ttl_secs: Option<u64>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            requests,
            gateway,
            ttl_secs,
            events,
        }
    }

    /// The only identity allowed to fulfil requests
    pub fn gateway(&self) -> Address {
        self.gateway
    }

    /// Ask for `handle` to be decrypted publicly. Returns immediately.
    pub fn request_public_decryption(
        &self,
        handle: &Handle,
        requester: &Address,
        now: u64,
    ) -> EngineResult<RequestId> {
        let ct = self.store.get(handle)?;
        if !ct.allows(requester, AclKind::Decrypt) {
            return Err(EngineError::PermissionDenied {
                handle: *handle,
                principal: *requester,
                kind: AclKind::Decrypt,
            });
        }

        let record = self.requests.create_pending(*handle.as_bytes(), *requester.as_bytes(), now)?;
        let request_id = RequestId(record.id);

        info!(%request_id, %handle, %requester, "public decryption requested");
        self.events.emit(EngineEvent::DecryptionRequested {
            request_id,
            handle: *handle,
            requester: *requester,
        });

        Ok(request_id)
    }

    /// Ciphertext of a pending request, for the decryptor nodes
    pub fn sealed_request(&self, request_id: RequestId) -> EngineResult<SealedCiphertext> {
        let record = self
            .requests
            .get(request_id.0)?
            .filter(|r| r.status == RequestStatus::Pending)
            .ok_or(EngineError::DoubleFulfillment(request_id))?;
        SealedCiphertext::seal(&self.store, &Handle::from_bytes(record.handle))
    }

    /// Deliver the plaintext of a pending request.
    ///
    /// The caller is checked before anything else. A request that is unknown or
    /// no longer pending is left untouched.
    pub fn fulfill(
        &self,
        request_id: RequestId,
        plaintext: u64,
        caller: &Address,
        now: u64,
    ) -> EngineResult<()> {
        if *caller != self.gateway {
            warn!(%request_id, %caller, "fulfilment from non-gateway caller");
            return Err(EngineError::UnauthorizedCallback(*caller));
        }

        let record = self
            .requests
            .get(request_id.0)?
            .ok_or(EngineError::DoubleFulfillment(request_id))?;
        let handle = Handle::from_bytes(record.handle);
        if let Some(width) = handle.width() {
            width.check(plaintext)?;
        }

        let record = match self.requests.fulfill(request_id.0, plaintext, now) {
            Ok(record) => record,
            Err(StorageError::RequestNotFound(_)) | Err(StorageError::InvalidTransition { .. }) => {
                debug!(%request_id, "duplicate or late fulfilment ignored");
                return Err(EngineError::DoubleFulfillment(request_id));
            }
            Err(e) => return Err(e.into()),
        };

        info!(%request_id, %handle, "public decryption fulfilled");
        self.events.emit(EngineEvent::DecryptionFulfilled {
            request_id,
            handle: Handle::from_bytes(record.handle),
            plaintext,
        });
        Ok(())
    }

    /// Current status of a request
    pub fn status(&self, request_id: RequestId) -> EngineResult<Option<RequestStatus>> {
        Ok(self.requests.get(request_id.0)?.map(|r| r.status))
    }

    /// Public plaintext of a fulfilled request
    pub fn public_value(&self, request_id: RequestId) -> EngineResult<Option<u64>> {
        Ok(self.requests.get(request_id.0)?.and_then(|r| r.plaintext))
    }

    /// Full stored record
    pub fn record(&self, request_id: RequestId) -> EngineResult<Option<DecryptionRecord>> {
        Ok(self.requests.get(request_id.0)?)
    }

    /// Requests awaiting the gateway
    pub fn pending(&self) -> EngineResult<Vec<RequestId>> {
        Ok(self.requests.pending()?.into_iter().map(|r| RequestId(r.id)).collect())
    }

    /// Expire pending requests older than the TTL. A no-op without a TTL.
    pub fn expire_stale(&self, now: u64) -> EngineResult<Vec<RequestId>> {
        let Some(ttl) = self.ttl_secs else {
            return Ok(Vec::new());
        };
        let Some(cutoff) = now.checked_sub(ttl) else {
            return Ok(Vec::new());
        };

        let expired = self.requests.expire_created_before(cutoff, now)?;
        for record in &expired {
            let request_id = RequestId(record.id);
            info!(%request_id, "public decryption expired");
            self.events.emit(EngineEvent::DecryptionExpired {
                request_id,
                handle: Handle::from_bytes(record.handle),
            });
        }

        Ok(expired.into_iter().map(|r| RequestId(r.id)).collect())
    }
}
