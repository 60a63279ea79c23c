//! The committed chain and the derived account map.
//!
//! The chain is the canonical source of truth; the account map is a cache
//! that `replay()` can always rebuild from genesis. Appends are atomic:
//! rewards are credited, transactions applied in listed order, and both
//! files persisted before the commit is advertised. Persistence failures
//! during a write are fatal for the node.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::block::{Block, BlockHeader};
use crate::crypto::keys::Address;
use crate::crypto::Digest;
use crate::merkle::{merkle_proof, ProofStep};
use crate::storage::{ChainStore, StorageError};
use crate::transaction::Transaction;

/// Balance and nonce of one account. Missing addresses read as `(0, 0)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub balance: u64,
    pub nonce: u64,
}

/// Errors from chain and account operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("persistence failure: {0}")]
    Persistence(#[from] StorageError),
    #[error("epoch out of order: expected {expected}, block has {found}")]
    EpochOrder { expected: u64, found: u64 },
    #[error("chain rejected: {0}")]
    ChainRejected(String),
}

/// Inclusion proof for a committed transaction.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxProof {
    pub block_epoch: u64,
    pub block_hash: Digest,
    pub tx_root: Digest,
    pub proof: Vec<ProofStep>,
}

/// Append-only block log plus the derived account map.
pub struct Ledger {
    chain: Vec<Block>,
    accounts: HashMap<Address, Account>,
    /// Addresses already slashed on this chain (slashed-once semantics).
    slashed: HashSet<Address>,
    /// Local slash debits, re-applied after `replay()`. Not replicated.
    slash_log: Vec<(Address, u64)>,
    total_minted: u64,
    total_slashed: u64,
    store: Option<ChainStore>,
}

impl Ledger {
    /// An in-memory ledger with no backing store.
    pub fn in_memory() -> Self {
        Ledger {
            chain: Vec::new(),
            accounts: HashMap::new(),
            slashed: HashSet::new(),
            slash_log: Vec::new(),
            total_minted: 0,
            total_slashed: 0,
            store: None,
        }
    }

    /// Open a persistent ledger: load `chain.json`, refuse to start on
    /// broken hash linkage, and rebuild the account map when the cache is
    /// missing or disagrees with the chain.
    pub fn open(store: ChainStore) -> Result<Self, LedgerError> {
        let chain = store.load_chain()?;
        validate_linkage(&chain)?;

        let mut ledger = Ledger {
            chain,
            accounts: HashMap::new(),
            slashed: HashSet::new(),
            slash_log: Vec::new(),
            total_minted: 0,
            total_slashed: 0,
            store: Some(store),
        };
        ledger.rebuild_accounts();

        // The cache is only a cache: if what is on disk disagrees with the
        // replayed state, the replayed state wins and the cache is rewritten.
        if let Some(store) = &ledger.store {
            match store.load_accounts()? {
                Some(cached) if cached == ledger.accounts => {}
                Some(_) => {
                    tracing::warn!("account cache stale, rebuilt from chain");
                    store.save_accounts(&ledger.accounts)?;
                }
                None => store.save_accounts(&ledger.accounts)?,
            }
        }
        tracing::info!(
            blocks = ledger.chain.len(),
            accounts = ledger.accounts.len(),
            "ledger opened"
        );
        Ok(ledger)
    }

    /// `(epoch, hash)` of the latest committed block, or `(0, zero)` for an
    /// empty chain.
    pub fn head(&self) -> (u64, Digest) {
        match self.chain.last() {
            Some(block) => (block.epoch, block.hash),
            None => (0, Digest::ZERO),
        }
    }

    pub fn chain_length(&self) -> usize {
        self.chain.len()
    }

    pub fn chain(&self) -> &[Block] {
        &self.chain
    }

    /// Append a block already validated by consensus. Applies rewards and
    /// transactions, then persists chain and cache. Fatal on write failure.
    pub fn append(&mut self, block: Block) -> Result<(), LedgerError> {
        let (head_epoch, head_hash) = self.head();
        if block.epoch != head_epoch + 1 {
            return Err(LedgerError::EpochOrder {
                expected: head_epoch + 1,
                found: block.epoch,
            });
        }
        if block.previous_hash != head_hash {
            // Provisional catch-up acceptance: immediate-successor epoch with
            // an unknown ancestor. Known flagged risk on adversarial meshes.
            tracing::warn!(
                epoch = block.epoch,
                expected = %head_hash,
                found = %block.previous_hash,
                "appending block with non-local previous hash"
            );
        }

        apply_block(&mut self.accounts, &mut self.total_minted, &block);
        self.chain.push(block);
        self.persist()?;
        Ok(())
    }

    /// Rebuild the account map from genesis and re-apply local slash debits.
    pub fn replay(&mut self) {
        self.rebuild_accounts();
        let log = std::mem::take(&mut self.slash_log);
        self.total_slashed = 0;
        self.slashed.clear();
        for (address, amount) in log {
            self.slash(address, amount);
        }
    }

    /// Swap in a longer chain fetched from a peer, then replay. The new
    /// chain must be internally hash-linked, epoch-ordered, and strictly
    /// longer than the local one.
    pub fn replace_chain(&mut self, blocks: Vec<Block>) -> Result<(), LedgerError> {
        if blocks.len() <= self.chain.len() {
            return Err(LedgerError::ChainRejected(format!(
                "replacement not longer ({} <= {})",
                blocks.len(),
                self.chain.len()
            )));
        }
        validate_linkage(&blocks)?;
        for block in &blocks {
            if !block.hash_consistent() || !block.verify_leader_signature() {
                return Err(LedgerError::ChainRejected(format!(
                    "block {} fails hash or signature check",
                    block.epoch
                )));
            }
        }
        self.chain = blocks;
        self.replay();
        self.persist()?;
        tracing::info!(blocks = self.chain.len(), "adopted longer chain from peer");
        Ok(())
    }

    pub fn account(&self, address: &Address) -> Account {
        self.accounts.get(address).copied().unwrap_or_default()
    }

    pub fn accounts(&self) -> &HashMap<Address, Account> {
        &self.accounts
    }

    pub fn block_at(&self, epoch: u64) -> Option<&Block> {
        self.chain.iter().find(|b| b.epoch == epoch)
    }

    pub fn block_by_hash(&self, hash: &Digest) -> Option<&Block> {
        self.chain.iter().find(|b| b.hash == *hash)
    }

    /// The most recent `limit` headers, oldest first.
    pub fn headers(&self, limit: usize) -> Vec<BlockHeader> {
        let start = self.chain.len().saturating_sub(limit);
        self.chain[start..].iter().map(Block::header).collect()
    }

    /// The most recent `limit` full blocks, oldest first.
    pub fn recent_blocks(&self, limit: usize) -> &[Block] {
        let start = self.chain.len().saturating_sub(limit);
        &self.chain[start..]
    }

    /// Locate a committed transaction by canonical digest and build its
    /// Merkle inclusion proof against the containing block's txRoot.
    pub fn proof_for(&self, tx_hash: &Digest) -> Option<TxProof> {
        for block in &self.chain {
            let leaves: Vec<Digest> = block.transactions.iter().map(Transaction::digest).collect();
            if let Some(index) = leaves.iter().position(|d| d == tx_hash) {
                let proof = merkle_proof(&leaves, index)?;
                return Some(TxProof {
                    block_epoch: block.epoch,
                    block_hash: block.hash,
                    tx_root: block.tx_root,
                    proof,
                });
            }
        }
        None
    }

    /// Apply a slash debit: `min(balance, amount)`, at most once per address
    /// per chain. Returns the amount actually debited, or `None` when the
    /// address was already slashed.
    pub fn slash(&mut self, address: Address, amount: u64) -> Option<u64> {
        if !self.slashed.insert(address) {
            return None;
        }
        let account = self.accounts.entry(address).or_default();
        let debited = account.balance.min(amount);
        account.balance -= debited;
        self.total_slashed += debited;
        self.slash_log.push((address, amount));
        if let Some(store) = &self.store {
            if let Err(e) = store.save_accounts(&self.accounts) {
                tracing::error!(error = %e, "failed to persist account cache after slash");
            }
        }
        Some(debited)
    }

    pub fn is_slashed(&self, address: &Address) -> bool {
        self.slashed.contains(address)
    }

    pub fn slashed_count(&self) -> usize {
        self.slashed.len()
    }

    /// Total units ever minted (rewards + coinbase) on this chain.
    pub fn total_minted(&self) -> u64 {
        self.total_minted
    }

    /// Total units actually debited by slashes at this observer.
    pub fn total_slashed(&self) -> u64 {
        self.total_slashed
    }

    /// Sum of all account balances (conservation checks).
    pub fn balance_sum(&self) -> u64 {
        self.accounts.values().map(|a| a.balance).sum()
    }

    fn rebuild_accounts(&mut self) {
        self.accounts.clear();
        self.total_minted = 0;
        for block in &self.chain {
            apply_block(&mut self.accounts, &mut self.total_minted, block);
        }
    }

    fn persist(&self) -> Result<(), LedgerError> {
        if let Some(store) = &self.store {
            store.save_chain(&self.chain)?;
            store.save_accounts(&self.accounts)?;
        }
        Ok(())
    }
}

/// Apply one block to an account map: rewards first, then transactions in
/// listed order. Coinbase credits only; transfers debit the sender, advance
/// its nonce to the transaction's, and credit the receiver.
fn apply_block(accounts: &mut HashMap<Address, Account>, total_minted: &mut u64, block: &Block) {
    for (address, amount) in &block.rewards {
        accounts.entry(*address).or_default().balance += amount;
        *total_minted += amount;
    }
    for tx in &block.transactions {
        match tx.from.address() {
            None => {
                accounts.entry(tx.to).or_default().balance += tx.amount;
                *total_minted += tx.amount;
            }
            Some(from) => {
                let sender = accounts.entry(from).or_default();
                sender.balance = sender.balance.saturating_sub(tx.amount);
                sender.nonce = tx.nonce;
                accounts.entry(tx.to).or_default().balance += tx.amount;
            }
        }
    }
}

/// Check hash linkage and strict epoch ordering of a chain. The first block
/// must point at the all-zero digest.
pub fn validate_linkage(chain: &[Block]) -> Result<(), LedgerError> {
    let mut expected_prev = Digest::ZERO;
    let mut expected_epoch = 1u64;
    for block in chain {
        if block.epoch != expected_epoch {
            return Err(LedgerError::ChainRejected(format!(
                "epoch {} where {} expected",
                block.epoch, expected_epoch
            )));
        }
        if block.previous_hash != expected_prev {
            return Err(LedgerError::ChainRejected(format!(
                "hash linkage broken at epoch {}",
                block.epoch
            )));
        }
        expected_prev = block.hash;
        expected_epoch += 1;
    }
    Ok(())
}
