//! Deterministic block assembly.
//!
//! Given the same pre-state and the same input ordering, every node builds
//! byte-identical blocks: the transaction filter is a single pass over the
//! input order with a balance/nonce overlay, the reward split is floor
//! division over the new effectiveness map, and the three Merkle roots are
//! computed over canonical digests.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::block::Block;
use crate::crypto::canonical::hash_canonical;
use crate::crypto::keys::{Address, Signature, SigningKeypair};
use crate::crypto::Digest;
use crate::ledger::{Account, Ledger};
use crate::merkle::merkle_root;
use crate::receipt::Receipt;
use crate::transaction::Transaction;

/// Balance/nonce overlay on top of the committed account map, tracking
/// which accounts the block touches.
struct Overlay<'a> {
    ledger: &'a Ledger,
    accounts: HashMap<Address, Account>,
    touched: BTreeSet<Address>,
}

impl<'a> Overlay<'a> {
    fn new(ledger: &'a Ledger) -> Self {
        Overlay {
            ledger,
            accounts: HashMap::new(),
            touched: BTreeSet::new(),
        }
    }

    fn get(&mut self, address: &Address) -> Account {
        match self.accounts.get(address) {
            Some(account) => *account,
            None => self.ledger.account(address),
        }
    }

    fn set(&mut self, address: Address, account: Account) {
        self.accounts.insert(address, account);
        self.touched.insert(address);
    }

    fn credit(&mut self, address: Address, amount: u64) {
        let mut account = self.get(&address);
        account.balance += amount;
        self.set(address, account);
    }
}

/// Single-pass deterministic transaction filter (input order preserved).
///
/// Coinbase is accepted unconditionally and credited. Anything else must
/// clear the overlay balance and land exactly on `overlay nonce + 1`; a
/// duplicate `(from, nonce)` therefore rejects the later transaction.
pub fn filter_transactions(ledger: &Ledger, pending: &[Transaction]) -> Vec<Transaction> {
    let mut overlay = Overlay::new(ledger);
    let mut accepted = Vec::new();
    for tx in pending {
        if admit(&mut overlay, tx) {
            accepted.push(tx.clone());
        }
    }
    accepted
}

fn admit(overlay: &mut Overlay<'_>, tx: &Transaction) -> bool {
    match tx.from.address() {
        None => {
            overlay.credit(tx.to, tx.amount);
            true
        }
        Some(from) => {
            let sender = overlay.get(&from);
            if sender.balance < tx.amount || tx.nonce != sender.nonce + 1 {
                return false;
            }
            overlay.set(
                from,
                Account {
                    balance: sender.balance - tx.amount,
                    nonce: tx.nonce,
                },
            );
            overlay.credit(tx.to, tx.amount);
            true
        }
    }
}

/// Split the epoch reward pool proportionally to the new effectiveness map
/// (floor division). A zero total emits no rewards at all.
pub fn compute_rewards(updates: &BTreeMap<Address, f64>, pool: u64) -> BTreeMap<Address, u64> {
    let total: f64 = updates.values().sum();
    if total <= 0.0 {
        return BTreeMap::new();
    }
    let mut rewards = BTreeMap::new();
    for (address, effectiveness) in updates {
        let share = (pool as f64 * effectiveness / total).floor() as u64;
        if share > 0 {
            rewards.insert(*address, share);
        }
    }
    rewards
}

/// Assemble and seal a candidate block for `epoch`.
pub fn build_block(
    ledger: &Ledger,
    leader: &SigningKeypair,
    epoch: u64,
    timestamp: u64,
    pending_receipts: &[Receipt],
    pending_transactions: &[Transaction],
    effectiveness_updates: BTreeMap<Address, f64>,
    reward_pool: u64,
) -> Block {
    let (_, previous_hash) = ledger.head();
    let transactions = filter_transactions(ledger, pending_transactions);
    let rewards = compute_rewards(&effectiveness_updates, reward_pool);
    let receipts = pending_receipts.to_vec();

    let tx_root = merkle_root(&transactions.iter().map(Transaction::digest).collect::<Vec<_>>());
    let receipt_root = merkle_root(&receipts.iter().map(Receipt::digest).collect::<Vec<_>>());
    let state_root = state_root_after(ledger, &transactions, &rewards);

    let mut block = Block {
        epoch,
        previous_hash,
        leader: leader.address(),
        leader_pub_key: leader.public().to_pem(),
        timestamp,
        receipts,
        transactions,
        effectiveness_updates,
        rewards,
        tx_root,
        receipt_root,
        state_root,
        hash: Digest::ZERO,
        leader_signature: Signature::zeroed(),
        votes: BTreeMap::new(),
    };
    block.seal(leader);
    block
}

/// Merkle root over the canonicalised accounts this block touches, after
/// applying its rewards and transactions, sorted by address.
pub fn state_root_after(
    ledger: &Ledger,
    transactions: &[Transaction],
    rewards: &BTreeMap<Address, u64>,
) -> Digest {
    let mut overlay = Overlay::new(ledger);
    for tx in transactions {
        admit(&mut overlay, tx);
    }
    for (address, amount) in rewards {
        overlay.credit(*address, *amount);
    }

    let leaves: Vec<Digest> = overlay
        .touched
        .iter()
        .map(|address| {
            let account = overlay
                .accounts
                .get(address)
                .copied()
                .unwrap_or_else(|| ledger.account(address));
            hash_canonical(&format!(
                "{}:{}:{}",
                address, account.balance, account.nonce
            ))
        })
        .collect();
    merkle_root(&leaves)
}
