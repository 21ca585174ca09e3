//! Public decryption request storage
//!
//! Every request is a row keyed by its id. Status changes are a read-check-write
//! inside one redb write transaction, so two concurrent callers can never both
//! move the same request out of `Pending`.

use std::sync::Arc;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use crate::{StorageError, StorageResult};

/// Table for decryption requests by id
const REQUESTS: TableDefinition<u64, &[u8]> = TableDefinition::new("decryption_requests");

/// Table for counters
const META: TableDefinition<&str, u64> = TableDefinition::new("request_meta");

const NEXT_ID_KEY: &str = "next_id";

/// Lifecycle of a public decryption request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RequestStatus {
    /// Recorded, not yet announced to the gateway
    Created,
    /// Announced, awaiting the gateway callback
    Pending,
    /// Plaintext delivered (terminal)
    Fulfilled,
    /// Timed out before fulfilment (terminal)
    Expired,
}

impl RequestStatus {
    /// Terminal states never change again
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Fulfilled | RequestStatus::Expired)
    }
}

/// Stored decryption request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionRecord {
    /// Request id
    pub id: u64,
    /// Handle whose plaintext is requested
    pub handle: [u8; 32],
    /// Principal that asked for decryption
    pub requester: [u8; 32],
    /// Current status
    pub status: RequestStatus,
    /// Creation time (unix seconds)
    pub created_at: u64,
    /// Time the request reached a terminal state
    pub resolved_at: Option<u64>,
    /// Public plaintext, present once fulfilled
    pub plaintext: Option<u64>,
}

/// Decryption request store
pub struct RequestStore {
    db: Arc<Database>,
}

impl RequestStore {
    /// Create new request store
    pub fn new(db: Arc<Database>) -> StorageResult<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(REQUESTS)?;
            let _ = write_txn.open_table(META)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Record a new request in the `Created` state and assign its id
    pub fn create(
        &self,
        handle: [u8; 32],
        requester: [u8; 32],
        now: u64,
    ) -> StorageResult<DecryptionRecord> {
        self.insert_new(handle, requester, now, RequestStatus::Created)
    }

    /// Record a new request and move it to `Pending` in the same write
    /// transaction, so no `Created` row is ever visible
    pub fn create_pending(
        &self,
        handle: [u8; 32],
        requester: [u8; 32],
        now: u64,
    ) -> StorageResult<DecryptionRecord> {
        self.insert_new(handle, requester, now, RequestStatus::Pending)
    }

    fn insert_new(
        &self,
        handle: [u8; 32],
        requester: [u8; 32],
        now: u64,
        status: RequestStatus,
    ) -> StorageResult<DecryptionRecord> {
        let write_txn = self.db.begin_write()?;
        let record = {
            let mut meta = write_txn.open_table(META)?;
            let mut requests = write_txn.open_table(REQUESTS)?;

            let id = meta.get(NEXT_ID_KEY)?.map(|v| v.value()).unwrap_or(1);
            meta.insert(NEXT_ID_KEY, id + 1)?;

            let record = DecryptionRecord {
                id,
                handle,
                requester,
                status,
                created_at: now,
                resolved_at: None,
                plaintext: None,
            };
            let encoded = bincode::serialize(&record)?;
            requests.insert(id, encoded.as_slice())?;
            record
        };
        write_txn.commit()?;

        tracing::debug!(id = record.id, status = ?record.status, "stored decryption request");
        Ok(record)
    }

    /// Move a request from `Created` to `Pending`
    pub fn mark_pending(&self, id: u64) -> StorageResult<DecryptionRecord> {
        self.transition(id, RequestStatus::Created, RequestStatus::Pending, |_| {})
    }

    /// Move a request from `Pending` to `Fulfilled` with its plaintext
    pub fn fulfill(&self, id: u64, plaintext: u64, now: u64) -> StorageResult<DecryptionRecord> {
        self.transition(id, RequestStatus::Pending, RequestStatus::Fulfilled, |record| {
            record.plaintext = Some(plaintext);
            record.resolved_at = Some(now);
        })
    }

    /// Move a request from `Pending` to `Expired`
    pub fn expire(&self, id: u64, now: u64) -> StorageResult<DecryptionRecord> {
        self.transition(id, RequestStatus::Pending, RequestStatus::Expired, |record| {
            record.resolved_at = Some(now);
        })
    }

    /// Expire every pending request created at or before `cutoff`
    pub fn expire_created_before(&self, cutoff: u64, now: u64) -> StorageResult<Vec<DecryptionRecord>> {
        let write_txn = self.db.begin_write()?;
        let expired = {
            let mut table = write_txn.open_table(REQUESTS)?;

            let mut stale = Vec::new();
            for item in table.iter()? {
                let (_, data) = item?;
                let record: DecryptionRecord = bincode::deserialize(data.value())?;
                if record.status == RequestStatus::Pending && record.created_at <= cutoff {
                    stale.push(record);
                }
            }

            for record in &mut stale {
                record.status = RequestStatus::Expired;
                record.resolved_at = Some(now);
                let encoded = bincode::serialize(record)?;
                table.insert(record.id, encoded.as_slice())?;
            }
            stale
        };
        write_txn.commit()?;

        Ok(expired)
    }

    /// Get request by id
    pub fn get(&self, id: u64) -> StorageResult<Option<DecryptionRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(REQUESTS)?;

        let result = match table.get(id)? {
            Some(data) => Some(bincode::deserialize(data.value())?),
            None => None,
        };

        Ok(result)
    }

    /// All requests currently awaiting fulfilment, oldest first
    pub fn pending(&self) -> StorageResult<Vec<DecryptionRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(REQUESTS)?;

        let mut pending = Vec::new();
        for item in table.iter()? {
            let (_, data) = item?;
            let record: DecryptionRecord = bincode::deserialize(data.value())?;
            if record.status == RequestStatus::Pending {
                pending.push(record);
            }
        }

        Ok(pending)
    }

    /// Get request count
    pub fn count(&self) -> StorageResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(REQUESTS)?;
        let len = table.len()?;
        Ok(len)
    }

    fn transition(
        &self,
        id: u64,
        from: RequestStatus,
        to: RequestStatus,
        apply: impl FnOnce(&mut DecryptionRecord),
    ) -> StorageResult<DecryptionRecord> {
        let write_txn = self.db.begin_write()?;
        let record = {
            let mut table = write_txn.open_table(REQUESTS)?;

            let bytes = table
                .get(id)?
                .map(|data| data.value().to_vec())
                .ok_or(StorageError::RequestNotFound(id))?;
            let mut record: DecryptionRecord = bincode::deserialize(&bytes)?;

            if record.id != id {
                return Err(StorageError::Corruption(format!(
                    "row {} holds request {}",
                    id, record.id
                )));
            }
            if record.status != from {
                // Dropping the write transaction aborts it; the row is untouched.
                return Err(StorageError::InvalidTransition {
                    id,
                    from: record.status,
                    to,
                });
            }

            record.status = to;
            apply(&mut record);

            let encoded = bincode::serialize(&record)?;
            table.insert(id, encoded.as_slice())?;
            record
        };
        write_txn.commit()?;

        tracing::debug!(id, status = ?to, "decryption request transitioned");
        Ok(record)
    }
}
