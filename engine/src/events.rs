//! Engine events
//!
//! Broadcast to any number of subscribers. Emitting never blocks and does not
//! need a running runtime; events sent while nobody listens are dropped.

use tokio::sync::broadcast;

use crate::types::{AclKind, Address, Handle, Origin, RequestId};

/// Default channel capacity
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Something observable happened inside the engine
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A ciphertext was stored under a new handle
    HandleCreated { handle: Handle, origin: Origin },
    /// A grant was added
    AccessGranted {
        handle: Handle,
        principal: Address,
        kind: AclKind,
    },
    /// A revocation was asked for; existing grants stay effective
    RevocationRequested { handle: Handle, principal: Address },
    /// A public decryption request awaits the gateway
    DecryptionRequested {
        request_id: RequestId,
        handle: Handle,
        requester: Address,
    },
    /// The gateway delivered a plaintext
    DecryptionFulfilled {
        request_id: RequestId,
        handle: Handle,
        plaintext: u64,
    },
    /// A pending request timed out
    DecryptionExpired { request_id: RequestId, handle: Handle },
}

/// Broadcast channel for engine events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a bus with the given capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Emit an event
    pub fn emit(&self, event: EngineEvent) {
        // Err only means there are no subscribers
        let _ = self.sender.send(event);
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::default();
        bus.emit(EngineEvent::RevocationRequested {
            handle: Handle::from_bytes([0u8; 32]),
            principal: Address::ZERO,
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_subscriber_receives() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        let handle = Handle::from_bytes([1u8; 32]);

        bus.emit(EngineEvent::HandleCreated {
            handle,
            origin: Origin::Input,
        });

        match rx.try_recv().unwrap() {
            EngineEvent::HandleCreated { handle: h, origin } => {
                assert_eq!(h, handle);
                assert_eq!(origin, Origin::Input);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
