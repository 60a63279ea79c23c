//! Blocks: the unit of commitment.
//!
//! A block records one epoch's outcome: verified participation receipts,
//! the filtered transaction batch, effectiveness updates and the reward
//! split, together with Merkle commitments, the leader's signature over
//! the canonical header hash, and the quorum vote map gathered at commit.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::canonical::hash_canonical_value;
use crate::crypto::keys::{Address, PublicKey, Signature, SigningKeypair};
use crate::crypto::Digest;
use crate::receipt::Receipt;
use crate::transaction::Transaction;

/// A committed or proposed block.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub epoch: u64,
    /// Hash of the predecessor, or all zeros for the first block.
    pub previous_hash: Digest,
    pub leader: Address,
    /// SPKI PEM of the leader key.
    pub leader_pub_key: String,
    pub timestamp: u64,
    pub receipts: Vec<Receipt>,
    /// Already filtered; listed order is application order.
    pub transactions: Vec<Transaction>,
    /// New effectiveness per address, each in [0, 1].
    pub effectiveness_updates: BTreeMap<Address, f64>,
    /// Reward credits applied before the transaction batch.
    pub rewards: BTreeMap<Address, u64>,
    pub tx_root: Digest,
    pub receipt_root: Digest,
    pub state_root: Digest,
    /// Canonical digest of the block minus {hash, leaderSignature, votes}.
    pub hash: Digest,
    pub leader_signature: Signature,
    /// Voter address → signature over `hash`. Empty until quorum commit.
    pub votes: BTreeMap<Address, Signature>,
}

impl Block {
    /// Recompute the canonical header digest: the block serialized to
    /// canonical JSON with `hash`, `leaderSignature` and `votes` removed.
    pub fn header_digest(&self) -> Digest {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.remove("hash");
            map.remove("leaderSignature");
            map.remove("votes");
        }
        hash_canonical_value(&value)
    }

    /// Seal the block: fix `hash` from the current contents and sign it
    /// with the leader key. Votes stay empty.
    pub fn seal(&mut self, leader: &SigningKeypair) {
        self.hash = self.header_digest();
        self.leader_signature = leader.sign_digest(&self.hash);
    }

    /// Check `hash` against the canonical header digest.
    pub fn hash_consistent(&self) -> bool {
        self.hash == self.header_digest()
    }

    /// Verify the leader signature under the embedded leader key, and that
    /// the key actually hashes to the claimed leader address.
    pub fn verify_leader_signature(&self) -> bool {
        let Some(key) = PublicKey::from_pem(&self.leader_pub_key) else {
            return false;
        };
        key.address() == self.leader && key.verify(self.hash.as_bytes(), &self.leader_signature)
    }

    /// Verify one vote from the map under the voter's public key.
    pub fn verify_vote(&self, voter: &Address, voter_key: &PublicKey) -> bool {
        match self.votes.get(voter) {
            Some(signature) => {
                voter_key.address() == *voter
                    && voter_key.verify(self.hash.as_bytes(), signature)
            }
            None => false,
        }
    }

    /// The compact header served by `/headers`.
    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            epoch: self.epoch,
            hash: self.hash,
            previous_hash: self.previous_hash,
            tx_root: self.tx_root,
            receipt_root: self.receipt_root,
            state_root: self.state_root,
            timestamp: self.timestamp,
            leader: self.leader,
            leader_signature: self.leader_signature,
        }
    }
}

/// Block header summary for light queries.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub epoch: u64,
    pub hash: Digest,
    pub previous_hash: Digest,
    pub tx_root: Digest,
    pub receipt_root: Digest,
    pub state_root: Digest,
    pub timestamp: u64,
    pub leader: Address,
    pub leader_signature: Signature,
}

/// Minimum vote count for quorum: `⌈N · q⌉` over the known validator set.
pub fn quorum_threshold(validator_count: usize, quorum_fraction: f64) -> usize {
    (validator_count as f64 * quorum_fraction).ceil() as usize
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Build a minimal sealed block for tests.
    pub fn sealed_block(
        leader: &SigningKeypair,
        epoch: u64,
        previous_hash: Digest,
        transactions: Vec<Transaction>,
    ) -> Block {
        let tx_leaves: Vec<Digest> = transactions.iter().map(|t| t.digest()).collect();
        let mut block = Block {
            epoch,
            previous_hash,
            leader: leader.address(),
            leader_pub_key: leader.public().to_pem(),
            timestamp: 1_700_000_000_000,
            receipts: Vec::new(),
            transactions,
            effectiveness_updates: BTreeMap::new(),
            rewards: BTreeMap::new(),
            tx_root: crate::merkle::merkle_root(&tx_leaves),
            receipt_root: Digest::ZERO,
            state_root: Digest::ZERO,
            hash: Digest::ZERO,
            leader_signature: Signature::zeroed(),
            votes: BTreeMap::new(),
        };
        block.seal(leader);
        block
    }
}

#[cfg(test)]
mod tests {
    use super::testing::sealed_block;
    use super::*;

    #[test]
    fn sealed_block_hash_is_consistent() {
        let leader = SigningKeypair::generate();
        let block = sealed_block(&leader, 1, Digest::ZERO, vec![]);
        assert!(block.hash_consistent());
        assert!(block.verify_leader_signature());
    }

    #[test]
    fn hash_excludes_votes_and_signature() {
        let leader = SigningKeypair::generate();
        let voter = SigningKeypair::generate();
        let mut block = sealed_block(&leader, 1, Digest::ZERO, vec![]);
        let before = block.hash;
        block
            .votes
            .insert(voter.address(), voter.sign_digest(&block.hash));
        assert_eq!(block.header_digest(), before);
        assert!(block.hash_consistent());
    }

    #[test]
    fn content_change_breaks_hash() {
        let leader = SigningKeypair::generate();
        let mut block = sealed_block(&leader, 1, Digest::ZERO, vec![]);
        block.timestamp += 1;
        assert!(!block.hash_consistent());
    }

    #[test]
    fn forged_leader_fails_signature_check() {
        let leader = SigningKeypair::generate();
        let imposter = SigningKeypair::generate();
        let mut block = sealed_block(&leader, 1, Digest::ZERO, vec![]);
        // Claim a different leader without re-signing
        block.leader = imposter.address();
        block.seal(&leader);
        assert!(!block.verify_leader_signature());
    }

    #[test]
    fn vote_verification() {
        let leader = SigningKeypair::generate();
        let voter = SigningKeypair::generate();
        let mut block = sealed_block(&leader, 2, Digest::ZERO, vec![]);
        block
            .votes
            .insert(voter.address(), voter.sign_digest(&block.hash));
        assert!(block.verify_vote(&voter.address(), &voter.public()));
        assert!(!block.verify_vote(&voter.address(), &leader.public()));
        assert!(!block.verify_vote(&leader.address(), &leader.public()));
    }

    #[test]
    fn quorum_threshold_ceils() {
        assert_eq!(quorum_threshold(3, 2.0 / 3.0), 2);
        assert_eq!(quorum_threshold(4, 2.0 / 3.0), 3);
        assert_eq!(quorum_threshold(6, 2.0 / 3.0), 4);
        assert_eq!(quorum_threshold(7, 2.0 / 3.0), 5);
        assert_eq!(quorum_threshold(1, 2.0 / 3.0), 1);
    }

    #[test]
    fn header_mirrors_block_fields() {
        let leader = SigningKeypair::generate();
        let block = sealed_block(&leader, 9, Digest::ZERO, vec![]);
        let header = block.header();
        assert_eq!(header.epoch, 9);
        assert_eq!(header.hash, block.hash);
        assert_eq!(header.leader, block.leader);
    }
}
