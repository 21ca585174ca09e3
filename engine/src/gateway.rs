//! Gateway collaborator
//!
//! Outside the trusted core. Decryptor nodes hold the network client key: they
//! answer announced requests with signed plaintexts and serve as the
//! [`KeyService`] for client decryption. A [`QuorumCollector`] accepts an
//! answer once `threshold` registered nodes agree; the [`Relayer`] drives the
//! loop asynchronously and calls `fulfill` as the gateway.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use umbra_fhe::{ClientKey, Conformance};

use crate::client::{KeyService, SealedCiphertext, SealedPlaintext};
use crate::config::ConfigError;
use crate::engine::ConfidentialEngine;
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::types::{Handle, RequestId};

/// Decided request ids remembered for ignoring late responses
pub const DECIDED_CAPACITY: usize = 4096;

fn response_digest(request_id: RequestId, handle: &Handle, plaintext: u64) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"umbra.decryption.response.v1");
    hasher.update(&request_id.0.to_le_bytes());
    hasher.update(handle.as_bytes());
    hasher.update(&plaintext.to_le_bytes());
    *hasher.finalize().as_bytes()
}

/// One node's signed answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionResponse {
    pub request_id: RequestId,
    pub handle: Handle,
    pub plaintext: u64,
    /// Node public key
    pub node: [u8; 32],
    pub signature: Vec<u8>,
}

/// Decryptor node
pub struct DecryptorNode {
    client_key: ClientKey,
    conformance: Conformance,
    signing_key: SigningKey,
}

impl DecryptorNode {
    /// Node decrypting ciphertexts that conform to `conformance`
    pub fn new(client_key: ClientKey, conformance: Conformance, signing_key: SigningKey) -> Self {
        Self {
            client_key,
            conformance,
            signing_key,
        }
    }

    /// Node public key
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    fn decrypt(&self, sealed: &SealedCiphertext) -> EngineResult<u64> {
        let value = sealed.blob.decode(&self.conformance)?;
        if value.width() != sealed.width {
            return Err(EngineError::InvalidCiphertext(format!(
                "sealed as {} but holds {}",
                sealed.width,
                value.width()
            )));
        }
        Ok(value.decrypt(&self.client_key))
    }

    /// Decrypt and sign
    pub fn respond(&self, request_id: RequestId, sealed: &SealedCiphertext) -> EngineResult<DecryptionResponse> {
        let plaintext = self.decrypt(sealed)?;
        let digest = response_digest(request_id, &sealed.handle, plaintext);

        Ok(DecryptionResponse {
            request_id,
            handle: sealed.handle,
            plaintext,
            node: self.signing_key.verifying_key().to_bytes(),
            signature: self.signing_key.sign(&digest).to_bytes().to_vec(),
        })
    }
}

impl KeyService for DecryptorNode {
    fn reencrypt(&self, sealed: &SealedCiphertext, recipient: &[u8; 32]) -> EngineResult<SealedPlaintext> {
        let plaintext = self.decrypt(sealed)?;
        SealedPlaintext::seal(sealed.handle, sealed.width, plaintext, recipient)
    }
}

impl std::fmt::Debug for DecryptorNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptorNode")
            .field("node", &hex::encode(&self.signing_key.verifying_key().to_bytes()[..8]))
            .field("client_key", &self.client_key)
            .finish()
    }
}

#[derive(Default)]
struct Votes {
    voters: HashSet<[u8; 32]>,
    tally: HashMap<u64, usize>,
}

/// t-of-n response collection
pub struct QuorumCollector {
    nodes: HashMap<[u8; 32], VerifyingKey>,
    threshold: usize,
    votes: HashMap<RequestId, Votes>,
    decided: HashSet<RequestId>,
    decided_order: VecDeque<RequestId>,
}

impl QuorumCollector {
    /// Accept responses from `nodes`, deciding once `threshold` agree
    pub fn new(nodes: Vec<VerifyingKey>, threshold: usize) -> Result<Self, ConfigError> {
        if threshold == 0 || threshold > nodes.len() {
            return Err(ConfigError::Invalid(format!(
                "Threshold {} invalid for {} nodes",
                threshold,
                nodes.len()
            )));
        }

        Ok(Self {
            nodes: nodes.into_iter().map(|k| (k.to_bytes(), k)).collect(),
            threshold,
            votes: HashMap::new(),
            decided: HashSet::new(),
            decided_order: VecDeque::new(),
        })
    }

    /// Record a response. Returns the plaintext when this response completes
    /// the quorum; later responses for a recently decided request are ignored.
    pub fn submit(&mut self, response: &DecryptionResponse) -> EngineResult<Option<u64>> {
        let key = self.nodes.get(&response.node).ok_or_else(|| {
            EngineError::UnauthorizedSigner(format!("unknown node {}", hex::encode(&response.node[..8])))
        })?;

        let signature = Signature::from_slice(&response.signature)
            .map_err(|_| EngineError::UnauthorizedSigner("malformed node signature".to_string()))?;
        let digest = response_digest(response.request_id, &response.handle, response.plaintext);
        key.verify(&digest, &signature)
            .map_err(|_| EngineError::UnauthorizedSigner("invalid node signature".to_string()))?;

        if self.decided.contains(&response.request_id) {
            return Ok(None);
        }

        let votes = self.votes.entry(response.request_id).or_default();
        if !votes.voters.insert(response.node) {
            return Err(EngineError::DuplicateResponse(response.request_id));
        }
        let count = votes.tally.entry(response.plaintext).or_insert(0);
        *count += 1;

        if *count >= self.threshold {
            self.votes.remove(&response.request_id);
            self.mark_decided(response.request_id);
            return Ok(Some(response.plaintext));
        }
        Ok(None)
    }

    /// Submit one round of node answers for `request_id`.
    ///
    /// Failed or rejected answers are logged and skipped, so faulty nodes only
    /// cost their own vote. Without a quorum the round's votes are dropped and
    /// the request can be retried from scratch.
    pub fn collect(
        &mut self,
        request_id: RequestId,
        responses: impl IntoIterator<Item = EngineResult<DecryptionResponse>>,
    ) -> Option<u64> {
        for (node, response) in responses.into_iter().enumerate() {
            let response = match response {
                Ok(response) if response.request_id == request_id => response,
                Ok(response) => {
                    warn!(%request_id, node, answered = %response.request_id, "response for another request");
                    continue;
                }
                Err(e) => {
                    warn!(%request_id, node, error = %e, "decryptor failed");
                    continue;
                }
            };
            match self.submit(&response) {
                Ok(Some(plaintext)) => return Some(plaintext),
                Ok(None) => {}
                Err(e) => warn!(%request_id, node, error = %e, "response rejected"),
            }
        }

        self.forget(request_id);
        None
    }

    /// Drop partial votes for a request
    pub fn forget(&mut self, request_id: RequestId) {
        self.votes.remove(&request_id);
    }

    /// Whether a quorum was recently reached for `request_id`
    pub fn is_decided(&self, request_id: RequestId) -> bool {
        self.decided.contains(&request_id)
    }

    /// Requests with some but not enough agreeing responses
    pub fn open_requests(&self) -> usize {
        self.votes.len()
    }

    /// Decided requests still remembered
    pub fn decided_len(&self) -> usize {
        self.decided.len()
    }

    fn mark_decided(&mut self, request_id: RequestId) {
        if self.decided.insert(request_id) {
            self.decided_order.push_back(request_id);
        }
        while self.decided_order.len() > DECIDED_CAPACITY {
            if let Some(oldest) = self.decided_order.pop_front() {
                self.decided.remove(&oldest);
            }
        }
    }
}

/// Running relayer task
pub struct RelayerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RelayerHandle {
    /// Stop after the request in flight and wait for the task to finish.
    /// Dropping the handle also stops the relayer.
    pub async fn shutdown(self) -> EngineResult<()> {
        let _ = self.shutdown.send(true);
        self.task
            .await
            .map_err(|e| EngineError::Relay(format!("relayer task failed: {}", e)))
    }

    /// Whether the task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Async loop answering announced requests
pub struct Relayer {
    engine: Arc<ConfidentialEngine>,
    nodes: Arc<Vec<DecryptorNode>>,
    collector: QuorumCollector,
}

impl Relayer {
    /// Relayer for `engine`, whose configured gateway must be the identity this
    /// relayer acts as
    pub fn new(engine: Arc<ConfidentialEngine>, nodes: Vec<DecryptorNode>, threshold: usize) -> Result<Self, ConfigError> {
        let keys = nodes.iter().map(|n| n.verifying_key()).collect();
        Ok(Self {
            engine,
            nodes: Arc::new(nodes),
            collector: QuorumCollector::new(keys, threshold)?,
        })
    }

    /// Subscribe now and run in the background until shut down
    pub fn spawn(self) -> RelayerHandle {
        let events = self.engine.subscribe();
        let (shutdown, signal) = watch::channel(false);
        RelayerHandle {
            shutdown,
            task: tokio::spawn(self.run(events, signal)),
        }
    }

    /// Relay requests already pending, then process events until `shutdown`
    /// fires, its sender is dropped, or the event channel closes
    pub async fn run(mut self, mut events: broadcast::Receiver<EngineEvent>, mut shutdown: watch::Receiver<bool>) {
        info!(nodes = self.nodes.len(), "relayer started");
        self.resync().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Ok(EngineEvent::DecryptionRequested { request_id, .. }) => self.relay(request_id).await,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "relayer lagged behind engine events; resyncing");
                        self.resync().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        info!("relayer stopped");
    }

    /// Relay every request the engine still lists as pending
    async fn resync(&mut self) {
        match self.engine.pending() {
            Ok(pending) => {
                if !pending.is_empty() {
                    debug!(count = pending.len(), "relaying pending requests");
                }
                for request_id in pending {
                    self.relay(request_id).await;
                }
            }
            Err(e) => error!(error = %e, "listing pending requests failed"),
        }
    }

    async fn relay(&mut self, request_id: RequestId) {
        if let Err(e) = self.handle_request(request_id).await {
            error!(%request_id, error = %e, "relaying decryption failed");
        }
    }

    async fn handle_request(&mut self, request_id: RequestId) -> EngineResult<()> {
        if self.collector.is_decided(request_id) {
            return Ok(());
        }
        let sealed = match self.engine.sealed_request(request_id) {
            Ok(sealed) => sealed,
            Err(EngineError::DoubleFulfillment(_)) => {
                debug!(%request_id, "request no longer pending");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let nodes = self.nodes.clone();
        let responses = tokio::task::spawn_blocking(move || {
            nodes
                .iter()
                .map(|node| node.respond(request_id, &sealed))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| EngineError::Relay(format!("decryptor task failed: {}", e)))?;

        let Some(plaintext) = self.collector.collect(request_id, responses) else {
            warn!(%request_id, "no quorum; request stays pending");
            return Ok(());
        };

        let gateway = self.engine.gateway();
        match self.engine.fulfill(request_id, plaintext, &gateway) {
            Ok(()) => {
                debug!(%request_id, "relayed quorum plaintext");
                Ok(())
            }
            Err(EngineError::DoubleFulfillment(_)) => {
                debug!(%request_id, "request resolved elsewhere");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
