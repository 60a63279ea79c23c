//! The receipt engine: challenge issuance, receipt verification, and the
//! pending pool feeding the next block.
//!
//! At every epoch start the engine picks a few peers round-robin and
//! challenges them. Verified receipts accumulate in the pending pool until
//! a block carries them; whether an address produced a successful receipt
//! in an epoch is what drives its effectiveness update.

use std::collections::{BTreeMap, HashSet};

use crate::crypto::keys::{Address, PublicKey};
use crate::effectiveness::{EffectivenessParams, EffectivenessTracker};
use crate::receipt::{Challenge, Receipt};

/// Errors from receipt admission.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ReceiptError {
    #[error("receipt signature invalid")]
    SignatureInvalid,
    #[error("responder key does not parse")]
    MalformedKey,
    #[error("duplicate challenge id {0}")]
    Duplicate(String),
}

/// Owns the pending receipt pool and the local effectiveness estimate.
pub struct ReceiptEngine {
    pending: Vec<Receipt>,
    seen_challenges: HashSet<String>,
    effectiveness: EffectivenessTracker,
    challenges_per_epoch: usize,
    cursor: usize,
}

impl ReceiptEngine {
    pub fn new(params: EffectivenessParams, challenges_per_epoch: usize) -> Self {
        ReceiptEngine {
            pending: Vec::new(),
            seen_challenges: HashSet::new(),
            effectiveness: EffectivenessTracker::new(params),
            challenges_per_epoch,
            cursor: 0,
        }
    }

    /// Pick up to `challenges_per_epoch` targets round-robin over the
    /// sorted peer set (self excluded by the caller) and build challenges.
    pub fn issue_challenges(&mut self, from: Address, epoch: u64, peers: &[Address]) -> Vec<Challenge> {
        if peers.is_empty() {
            return Vec::new();
        }
        let mut sorted: Vec<Address> = peers.to_vec();
        sorted.sort();
        sorted.dedup();

        let count = self.challenges_per_epoch.min(sorted.len());
        let mut challenges = Vec::with_capacity(count);
        for _ in 0..count {
            let target = sorted[self.cursor % sorted.len()];
            self.cursor = (self.cursor + 1) % sorted.len();
            challenges.push(Challenge::new(from, target, epoch));
        }
        challenges
    }

    /// Verify a returned receipt under the responder's key and admit it to
    /// the pending pool. Duplicates by challenge id are rejected.
    pub fn admit(&mut self, receipt: Receipt, responder_pem: &str) -> Result<(), ReceiptError> {
        let key = PublicKey::from_pem(responder_pem).ok_or(ReceiptError::MalformedKey)?;
        if !receipt.verify(&key) {
            return Err(ReceiptError::SignatureInvalid);
        }
        if !self.seen_challenges.insert(receipt.challenge_id.clone()) {
            return Err(ReceiptError::Duplicate(receipt.challenge_id));
        }
        self.pending.push(receipt);
        Ok(())
    }

    pub fn pending(&self) -> &[Receipt] {
        &self.pending
    }

    /// Addresses that produced a successful receipt for `epoch` in the
    /// pending pool.
    pub fn active_responders(&self, epoch: u64) -> HashSet<Address> {
        self.pending
            .iter()
            .filter(|r| r.epoch == epoch && r.success)
            .map(|r| r.to)
            .collect()
    }

    /// Advance effectiveness one epoch and return the full update map for
    /// the block under construction.
    pub fn epoch_update(
        &mut self,
        epoch: u64,
        known: impl IntoIterator<Item = Address>,
        epoch_duration_secs: f64,
    ) -> BTreeMap<Address, f64> {
        let active = self.active_responders(epoch);
        self.effectiveness
            .advance_epoch(known, &active, epoch_duration_secs)
    }

    /// Adopt the effectiveness map carried by a committed block.
    pub fn apply_committed(&mut self, updates: &BTreeMap<Address, f64>) {
        self.effectiveness.apply_committed(updates);
    }

    /// Drop receipts that a committed block now carries.
    pub fn remove_committed(&mut self, committed: &[Receipt]) {
        let ids: HashSet<&str> = committed.iter().map(|r| r.challenge_id.as_str()).collect();
        self.pending.retain(|r| !ids.contains(r.challenge_id.as_str()));
    }

    pub fn effectiveness_of(&self, address: &Address) -> f64 {
        self.effectiveness.score(address)
    }

    pub fn effectiveness_snapshot(&self) -> BTreeMap<Address, f64> {
        self.effectiveness.snapshot()
    }
}
