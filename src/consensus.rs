//! Leader-based BFT block production.
//!
//! One epoch, one block: the deterministically elected leader assembles a
//! proposal, gathers votes until quorum, then commits and broadcasts.
//! Followers validate proposals, vote, and replace an unresponsive leader
//! through signed view changes. A leader caught signing two different
//! blocks for the same epoch is slashed by every observer that sees both.
//!
//! Safety hinges on three checks every follower runs locally: the leader
//! matches the election function, the header hash matches the canonical
//! encoding, and the transaction batch re-filters to exactly the listed
//! batch. Nothing is taken on faith from the proposer.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::block::{quorum_threshold, Block};
use crate::builder::filter_transactions;
use crate::crypto::canonical::hash_canonical_value;
use crate::crypto::keys::{Address, PublicKey, Signature, SigningKeypair};
use crate::crypto::{sha256, Digest};
use crate::ledger::Ledger;

/// Epochs of proposal history retained for equivocation detection.
pub const EQUIVOCATION_WINDOW: u64 = 10;

/// Phase of the per-epoch consensus state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Idle,
    AwaitingProposal,
    Proposing,
    Voting,
    Committed,
    ViewChange,
}

/// Why a proposal was refused. The display string travels in the
/// `/propose` error reply.
#[derive(Debug, thiserror::Error)]
pub enum ProposalRejection {
    #[error("previous hash does not extend the local chain")]
    PreviousHashMismatch,
    #[error("proposer {found} is not the elected leader {expected}")]
    WrongLeader { expected: Address, found: Address },
    #[error("header hash does not match canonical encoding")]
    HashMismatch,
    #[error("leader signature invalid")]
    BadLeaderSignature,
    #[error("transaction batch fails the deterministic filter")]
    InvalidTransactions,
    #[error("transaction {0} carries an invalid signature")]
    BadTransactionSignature(usize),
    #[error("receipt {0} is structurally incomplete")]
    MalformedReceipt(usize),
    #[error("equivocation: leader already proposed a different block this epoch")]
    Equivocation(Box<EquivocationEvidence>),
    #[error("wrong epoch: proposal for {found}, local head at {head}")]
    WrongEpoch { head: u64, found: u64 },
}

/// A signed request to replace the leader of `(epoch, old_view)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewChangeMsg {
    pub epoch: u64,
    pub old_view: u64,
    pub new_view: u64,
    pub from: Address,
    pub signature: Signature,
}

impl ViewChangeMsg {
    pub fn sign(keypair: &SigningKeypair, epoch: u64, old_view: u64) -> Self {
        let new_view = old_view + 1;
        ViewChangeMsg {
            epoch,
            old_view,
            new_view,
            from: keypair.address(),
            signature: keypair.sign_digest(&view_change_digest(epoch, new_view)),
        }
    }

    pub fn verify(&self, public_key: &PublicKey) -> bool {
        public_key.address() == self.from
            && self.new_view == self.old_view + 1
            && public_key.verify(
                view_change_digest(self.epoch, self.new_view).as_bytes(),
                &self.signature,
            )
    }
}

/// Canonical digest signed by a view-change vote: `(epoch, newView)`.
fn view_change_digest(epoch: u64, new_view: u64) -> Digest {
    hash_canonical_value(&json!({ "epoch": epoch, "newView": new_view }))
}

/// Two signed headers by the same leader for the same epoch with different
/// hashes. Broadcastable and independently checkable.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquivocationEvidence {
    pub first: Block,
    pub second: Block,
}

impl EquivocationEvidence {
    /// The evidence stands only if both blocks are for the same epoch and
    /// leader, hash differently, hash consistently, and carry valid leader
    /// signatures.
    pub fn verify(&self) -> bool {
        self.first.epoch == self.second.epoch
            && self.first.leader == self.second.leader
            && self.first.hash != self.second.hash
            && self.first.hash_consistent()
            && self.second.hash_consistent()
            && self.first.verify_leader_signature()
            && self.second.verify_leader_signature()
    }

    pub fn offender(&self) -> Address {
        self.first.leader
    }
}

/// Rolling per-epoch record of observed proposals, kept only for
/// equivocation detection.
#[derive(Debug, Default)]
pub struct EquivocationLedger {
    by_epoch: BTreeMap<u64, HashMap<Digest, Block>>,
}

impl EquivocationLedger {
    /// Record a proposal. Returns evidence if a distinct block by the same
    /// leader for the same epoch was already seen.
    pub fn observe(&mut self, block: &Block) -> Option<EquivocationEvidence> {
        let epoch_blocks = self.by_epoch.entry(block.epoch).or_default();
        let conflict = epoch_blocks
            .values()
            .find(|seen| seen.leader == block.leader && seen.hash != block.hash)
            .cloned();
        epoch_blocks.entry(block.hash).or_insert_with(|| block.clone());
        conflict.map(|first| EquivocationEvidence {
            first,
            second: block.clone(),
        })
    }

    /// Drop epochs older than the retention window.
    pub fn prune(&mut self, current_epoch: u64) {
        let cutoff = current_epoch.saturating_sub(EQUIVOCATION_WINDOW);
        self.by_epoch = self.by_epoch.split_off(&cutoff);
    }

    pub fn epochs_retained(&self) -> usize {
        self.by_epoch.len()
    }
}

/// Deterministic leader election: sort all validator addresses ascending,
/// index with the first four big-endian bytes of
/// `sha256("epoch-{E}-view-{V}")`.
pub fn elect_leader(epoch: u64, view: u64, validators: &[Address]) -> Option<Address> {
    if validators.is_empty() {
        return None;
    }
    let mut sorted: Vec<Address> = validators.to_vec();
    sorted.sort();
    sorted.dedup();
    let digest = sha256(format!("epoch-{epoch}-view-{view}").as_bytes());
    let index = u32::from_be_bytes([digest.0[0], digest.0[1], digest.0[2], digest.0[3]]);
    Some(sorted[index as usize % sorted.len()])
}

/// Per-epoch, per-view consensus state. Owned by the node event loop.
pub struct ConsensusState {
    pub epoch: u64,
    pub view: u64,
    pub phase: Phase,
    /// At most one active proposal (the one being voted on).
    pub active_proposal: Option<Block>,
    /// Votes collected for the active proposal (leader side).
    pub votes: BTreeMap<Address, Signature>,
    /// View-change signatures tallied per `(epoch, newView)`.
    view_change_tally: HashMap<(u64, u64), BTreeMap<Address, Signature>>,
    pub equivocation: EquivocationLedger,
    /// When the follower started waiting for a proposal.
    pub awaiting_since: Option<Instant>,
}

impl ConsensusState {
    pub fn new() -> Self {
        ConsensusState {
            epoch: 0,
            view: 0,
            phase: Phase::Idle,
            active_proposal: None,
            votes: BTreeMap::new(),
            view_change_tally: HashMap::new(),
            equivocation: EquivocationLedger::default(),
            awaiting_since: None,
        }
    }

    /// Enter a new epoch at view 0. The elected leader starts in
    /// `Proposing`, everyone else in `AwaitingProposal`.
    pub fn begin_epoch(&mut self, epoch: u64, is_leader: bool) {
        self.epoch = epoch;
        self.view = 0;
        self.phase = if is_leader {
            Phase::Proposing
        } else {
            Phase::AwaitingProposal
        };
        self.active_proposal = None;
        self.votes.clear();
        self.view_change_tally.retain(|(e, _), _| *e >= epoch);
        self.awaiting_since = if is_leader { None } else { Some(Instant::now()) };
        self.equivocation.prune(epoch);
    }

    /// Set the active proposal and move to `Voting`.
    pub fn adopt_proposal(&mut self, block: Block) {
        self.active_proposal = Some(block);
        self.votes.clear();
        self.phase = Phase::Voting;
        self.awaiting_since = None;
    }

    /// Record a vote for the active proposal. Votes for anything else, or
    /// with bad signatures, are dropped. Returns the tally size.
    pub fn record_vote(
        &mut self,
        voter: Address,
        voter_key: &PublicKey,
        block_hash: Digest,
        signature: Signature,
    ) -> usize {
        if self.phase != Phase::Voting {
            return self.votes.len();
        }
        let Some(proposal) = &self.active_proposal else {
            return self.votes.len();
        };
        if proposal.hash != block_hash
            || voter_key.address() != voter
            || !voter_key.verify(block_hash.as_bytes(), &signature)
        {
            return self.votes.len();
        }
        self.votes.insert(voter, signature);
        self.votes.len()
    }

    /// True when the current tally meets `⌈N·q⌉`.
    pub fn quorum_reached(&self, validator_count: usize, quorum_fraction: f64) -> bool {
        self.votes.len() >= quorum_threshold(validator_count, quorum_fraction)
    }

    /// Mark the epoch committed and clear the active proposal.
    pub fn mark_committed(&mut self) {
        self.phase = Phase::Committed;
        self.active_proposal = None;
        self.awaiting_since = None;
    }

    /// Tally a verified view-change message. Returns the vote count for its
    /// `(epoch, newView)` bucket.
    pub fn register_view_change(&mut self, msg: &ViewChangeMsg) -> usize {
        let bucket = self
            .view_change_tally
            .entry((msg.epoch, msg.new_view))
            .or_default();
        bucket.insert(msg.from, msg.signature);
        bucket.len()
    }

    /// Move to `(epoch, new_view)` after a view-change quorum: back to
    /// waiting for the newly elected leader.
    pub fn enter_view(&mut self, new_view: u64, is_leader: bool) {
        self.view = new_view;
        self.phase = if is_leader {
            Phase::Proposing
        } else {
            Phase::AwaitingProposal
        };
        self.active_proposal = None;
        self.votes.clear();
        self.awaiting_since = if is_leader { None } else { Some(Instant::now()) };
    }

    /// Drop an in-flight proposal whose previous hash no longer extends the
    /// local chain (after a gossip chain replacement).
    pub fn discard_stale_proposal(&mut self, head_hash: &Digest) {
        if let Some(proposal) = &self.active_proposal {
            if proposal.previous_hash != *head_hash {
                tracing::debug!(epoch = proposal.epoch, "discarding stale in-flight proposal");
                self.active_proposal = None;
                self.votes.clear();
                if self.phase == Phase::Voting {
                    self.phase = Phase::AwaitingProposal;
                    self.awaiting_since = Some(Instant::now());
                }
            }
        }
    }
}

impl Default for ConsensusState {
    fn default() -> Self {
        Self::new()
    }
}

/// Follower-side proposal validation, in the order the protocol fixes:
/// chain extension (with the provisional catch-up carve-out), leader
/// election, canonical hash, leader signature, transaction batch, receipt
/// structure.
pub fn validate_proposal(
    block: &Block,
    ledger: &Ledger,
    validators: &[Address],
    view: u64,
) -> Result<(), ProposalRejection> {
    let (head_epoch, head_hash) = ledger.head();

    // (a) must extend the local head. The one carve-out is the provisional
    // catch-up case: an immediate-successor epoch referencing an ancestor
    // we do not hold.
    if block.previous_hash != head_hash {
        if block.epoch != head_epoch + 1 {
            return Err(ProposalRejection::PreviousHashMismatch);
        }
        tracing::warn!(
            epoch = block.epoch,
            "provisionally accepting proposal over an unknown ancestor"
        );
    }
    if block.epoch != head_epoch + 1 {
        return Err(ProposalRejection::WrongEpoch {
            head: head_epoch,
            found: block.epoch,
        });
    }

    // (b) the proposer must be the elected leader for (epoch, view)
    let expected = elect_leader(block.epoch, view, validators);
    if expected != Some(block.leader) {
        return Err(ProposalRejection::WrongLeader {
            expected: expected.unwrap_or(block.leader),
            found: block.leader,
        });
    }

    // (c) canonical hash, (d) leader signature
    if !block.hash_consistent() {
        return Err(ProposalRejection::HashMismatch);
    }
    if !block.verify_leader_signature() {
        return Err(ProposalRejection::BadLeaderSignature);
    }

    // (e) the listed batch must survive the deterministic filter unchanged,
    // and every transfer must carry a valid signature
    for (index, tx) in block.transactions.iter().enumerate() {
        if !tx.verify() {
            return Err(ProposalRejection::BadTransactionSignature(index));
        }
    }
    let refiltered = filter_transactions(ledger, &block.transactions);
    if refiltered != block.transactions {
        return Err(ProposalRejection::InvalidTransactions);
    }

    // (f) receipts must be attributable
    for (index, receipt) in block.receipts.iter().enumerate() {
        if !receipt.is_well_formed() {
            return Err(ProposalRejection::MalformedReceipt(index));
        }
    }

    Ok(())
}

/// Committed-block acceptance: leader signature plus a quorum of valid
/// votes over the block hash. Voter keys are resolved by the caller from
/// its peer registry; unknown voters do not count.
pub fn validate_commit(
    block: &Block,
    resolve_key: impl Fn(&Address) -> Option<PublicKey>,
    validator_count: usize,
    quorum_fraction: f64,
) -> bool {
    if !block.hash_consistent() || !block.verify_leader_signature() {
        return false;
    }
    let valid_votes = block
        .votes
        .keys()
        .filter(|voter| match resolve_key(voter) {
            Some(key) => block.verify_vote(voter, &key),
            None => false,
        })
        .count();
    valid_votes >= quorum_threshold(validator_count, quorum_fraction)
}
