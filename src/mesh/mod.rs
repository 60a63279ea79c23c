//! The peer mesh: registry, wire records, and the sealed inbound message
//! set.
//!
//! Every protocol message a node can receive is one variant of [`Inbound`],
//! delivered through a single queue consumed by the node event loop. HTTP
//! handlers never touch consensus state themselves; they enqueue a message
//! and, where the protocol answers synchronously (challenges, proposals,
//! commits, transactions), await a oneshot reply.

pub mod client;
pub mod server;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::block::Block;
use crate::consensus::{EquivocationEvidence, ViewChangeMsg};
use crate::crypto::keys::{Address, PublicKey, Signature};
use crate::crypto::Digest;
use crate::receipt::{Challenge, Receipt};
use crate::transaction::Transaction;

/// Transport-level errors. Absorbed silently by callers: a dead peer only
/// affects liveness, never consensus state.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("peer returned status {0}")]
    Status(u16),
    #[error("undecodable reply: {0}")]
    Decode(String),
}

// ── Wire records ──

/// A peer's self-description, as sent in `/announce` and gossip.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    /// Human-readable node name; logging only.
    pub id: String,
    pub url: String,
    pub public_key_pem: String,
    pub public_key_hash: Address,
}

/// Entry of the `/peers` listing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub id: String,
    pub url: String,
    pub public_key_hash: Address,
}

/// A vote travelling on the wire: in the `/propose` reply and on `/vote`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteMsg {
    pub epoch: u64,
    pub block_hash: Digest,
    pub voter: Address,
    pub voter_pub_key: String,
    pub signature: Signature,
}

/// Reply to a `/challenge` request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeReply {
    pub receipt: Receipt,
    pub public_key_pem: String,
}

/// Reply to a `/propose` request: a vote, or a refusal (possibly carrying
/// equivocation evidence).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposeReply {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vote: Option<VoteMsg>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Box<EquivocationEvidence>>,
}

impl ProposeReply {
    pub fn accepted(vote: VoteMsg) -> Self {
        ProposeReply {
            ok: true,
            vote: Some(vote),
            error: None,
            evidence: None,
        }
    }

    pub fn refused(error: String, evidence: Option<Box<EquivocationEvidence>>) -> Self {
        ProposeReply {
            ok: false,
            vote: None,
            error: Some(error),
            evidence,
        }
    }
}

/// Periodic gossip payload: liveness, chain height, and the sender's view
/// of the mesh.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GossipMsg {
    pub from: Address,
    pub chain_length: u64,
    pub last_block_hash: Digest,
    pub peers: Vec<PeerInfo>,
}

/// Generic `{ok: true}` acknowledgement.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

impl Ack {
    pub fn ok() -> Self {
        Ack { ok: true }
    }
}

// ── Inbound message set ──

/// Every message the node event loop consumes: the sealed protocol set
/// plus loop-internal completions posted by outbound I/O tasks.
pub enum Inbound {
    Announce {
        peer: PeerInfo,
    },
    Challenge {
        challenge: Challenge,
        reply: oneshot::Sender<ChallengeReply>,
    },
    Propose {
        block: Box<Block>,
        reply: oneshot::Sender<ProposeReply>,
    },
    Vote {
        vote: VoteMsg,
    },
    Commit {
        block: Box<Block>,
        reply: oneshot::Sender<bool>,
    },
    ViewChange {
        msg: ViewChangeMsg,
    },
    Transaction {
        tx: Box<Transaction>,
        reply: oneshot::Sender<Result<(), String>>,
    },
    Gossip {
        gossip: GossipMsg,
    },
    // ── loop-internal completions ──
    /// The leader's proposal delay elapsed; time to build and broadcast.
    ProposalDue {
        epoch: u64,
        view: u64,
    },
    /// A challenged peer returned a signed receipt.
    ReceiptReturned {
        receipt: Receipt,
        public_key_pem: String,
    },
    /// Votes gathered from a proposal broadcast round.
    VotesCollected {
        epoch: u64,
        view: u64,
        block_hash: Digest,
        votes: Vec<VoteMsg>,
    },
    /// A full chain fetched from a peer for catch-up or gossip adoption.
    ChainFetched {
        blocks: Vec<Block>,
    },
    /// A peer answered an outbound call; refresh its liveness.
    PeerReachable {
        address: Address,
    },
}

// ── Peer registry ──

/// One known peer with liveness and effectiveness bookkeeping.
#[derive(Clone, Debug)]
pub struct PeerRecord {
    pub info: PeerInfo,
    pub last_seen: Instant,
    pub effectiveness: f64,
}

/// The per-node peer map. Not replicated; fed by announces and gossip,
/// drained by heartbeat eviction.
pub struct PeerRegistry {
    peers: HashMap<Address, PeerRecord>,
    heartbeat_timeout: Duration,
}

impl PeerRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        PeerRegistry {
            peers: HashMap::new(),
            heartbeat_timeout,
        }
    }

    /// Insert or refresh a peer from an announce or gossip entry.
    pub fn upsert(&mut self, info: PeerInfo) {
        let address = info.public_key_hash;
        match self.peers.get_mut(&address) {
            Some(record) => {
                record.info = info;
                record.last_seen = Instant::now();
            }
            None => {
                tracing::info!(peer = %address.short(), id = %info.id, "peer learned");
                self.peers.insert(
                    address,
                    PeerRecord {
                        info,
                        last_seen: Instant::now(),
                        effectiveness: 0.0,
                    },
                );
            }
        }
    }

    /// Refresh a peer's liveness after any successful exchange.
    pub fn touch(&mut self, address: &Address) {
        if let Some(record) = self.peers.get_mut(address) {
            record.last_seen = Instant::now();
        }
    }

    pub fn set_effectiveness(&mut self, address: &Address, effectiveness: f64) {
        if let Some(record) = self.peers.get_mut(address) {
            record.effectiveness = effectiveness;
        }
    }

    /// Drop peers silent for longer than the heartbeat timeout.
    pub fn evict_stale(&mut self) -> Vec<Address> {
        let timeout = self.heartbeat_timeout;
        let stale: Vec<Address> = self
            .peers
            .iter()
            .filter(|(_, record)| record.last_seen.elapsed() > timeout)
            .map(|(address, _)| *address)
            .collect();
        for address in &stale {
            tracing::info!(peer = %address.short(), "peer evicted");
            self.peers.remove(address);
        }
        stale
    }

    pub fn get(&self, address: &Address) -> Option<&PeerRecord> {
        self.peers.get(address)
    }

    /// Parse a peer's public key out of its announce record.
    pub fn resolve_key(&self, address: &Address) -> Option<PublicKey> {
        self.peers
            .get(address)
            .and_then(|record| PublicKey::from_pem(&record.info.public_key_pem))
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.peers.keys().copied().collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::SigningKeypair;

    fn info(keypair: &SigningKeypair, id: &str) -> PeerInfo {
        PeerInfo {
            id: id.to_string(),
            url: format!("http://127.0.0.1:9000/{id}"),
            public_key_pem: keypair.public().to_pem(),
            public_key_hash: keypair.address(),
        }
    }

    #[test]
    fn upsert_and_resolve_key() {
        let kp = SigningKeypair::generate();
        let mut registry = PeerRegistry::new(Duration::from_secs(60));
        registry.upsert(info(&kp, "n1"));
        assert_eq!(registry.len(), 1);
        let key = registry.resolve_key(&kp.address()).unwrap();
        assert_eq!(key.address(), kp.address());
    }

    #[test]
    fn upsert_same_address_updates_in_place() {
        let kp = SigningKeypair::generate();
        let mut registry = PeerRegistry::new(Duration::from_secs(60));
        registry.upsert(info(&kp, "n1"));
        let mut updated = info(&kp, "n1");
        updated.url = "http://10.0.0.1:9732".to_string();
        registry.upsert(updated);
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get(&kp.address()).unwrap().info.url,
            "http://10.0.0.1:9732"
        );
    }

    #[test]
    fn eviction_removes_silent_peers() {
        let kp = SigningKeypair::generate();
        let mut registry = PeerRegistry::new(Duration::from_millis(0));
        registry.upsert(info(&kp, "n1"));
        std::thread::sleep(Duration::from_millis(5));
        let evicted = registry.evict_stale();
        assert_eq!(evicted, vec![kp.address()]);
        assert!(registry.is_empty());
    }

    #[test]
    fn touch_keeps_peer_alive() {
        let kp = SigningKeypair::generate();
        let mut registry = PeerRegistry::new(Duration::from_millis(50));
        registry.upsert(info(&kp, "n1"));
        std::thread::sleep(Duration::from_millis(30));
        registry.touch(&kp.address());
        std::thread::sleep(Duration::from_millis(30));
        assert!(registry.evict_stale().is_empty());
    }

    #[test]
    fn propose_reply_shapes() {
        let refused = ProposeReply::refused("wrong leader".to_string(), None);
        let json = serde_json::to_value(&refused).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"], "wrong leader");
        assert!(json.get("vote").is_none());
    }
}
