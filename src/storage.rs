//! On-disk persistence for the node.
//!
//! Per-node data directory layout:
//! - `keypair.priv` / `keypair.pub` — PEM-encoded identity keys
//! - `chain.json` — the committed chain in commit order (canonical source)
//! - `accounts.json` — account cache, always regenerable from the chain
//!
//! Chain writes go through a temp file + rename so a crash never leaves a
//! half-written chain behind.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::block::Block;
use crate::crypto::keys::{Address, SigningKeypair};
use crate::ledger::Account;

const CHAIN_FILE: &str = "chain.json";
const ACCOUNTS_FILE: &str = "accounts.json";
const SECRET_KEY_FILE: &str = "keypair.priv";
const PUBLIC_KEY_FILE: &str = "keypair.pub";

/// Errors from persistence operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

/// File-backed store for one node's chain, account cache and identity.
#[derive(Clone, Debug)]
pub struct ChainStore {
    dir: PathBuf,
}

impl ChainStore {
    /// Open (creating if needed) the data directory.
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(dir).map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(ChainStore {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load the committed chain. A missing file is an empty chain.
    pub fn load_chain(&self) -> Result<Vec<Block>, StorageError> {
        let path = self.dir.join(CHAIN_FILE);
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::Io(e.to_string())),
        };
        serde_json::from_str(&contents).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    /// Persist the chain atomically (temp file + rename).
    pub fn save_chain(&self, chain: &[Block]) -> Result<(), StorageError> {
        let bytes =
            serde_json::to_vec(chain).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.atomic_write(CHAIN_FILE, &bytes)
    }

    /// Load the account cache, if present and well-formed. A corrupt cache
    /// is reported as `Ok(None)` so the caller rebuilds it by replay.
    pub fn load_accounts(&self) -> Result<Option<HashMap<Address, Account>>, StorageError> {
        let path = self.dir.join(ACCOUNTS_FILE);
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::Io(e.to_string())),
        };
        match serde_json::from_str::<Vec<(Address, Account)>>(&contents) {
            Ok(entries) => Ok(Some(entries.into_iter().collect())),
            Err(e) => {
                tracing::warn!(error = %e, "account cache unreadable, will rebuild from chain");
                Ok(None)
            }
        }
    }

    /// Persist the account cache as a sorted array of `[address, account]`
    /// entries.
    pub fn save_accounts(&self, accounts: &HashMap<Address, Account>) -> Result<(), StorageError> {
        let mut entries: Vec<(&Address, &Account)> = accounts.iter().collect();
        entries.sort_by_key(|(addr, _)| **addr);
        let bytes = serde_json::to_vec(&entries)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.atomic_write(ACCOUNTS_FILE, &bytes)
    }

    /// Load the node identity, generating and persisting a fresh keypair on
    /// first start.
    pub fn load_or_generate_keypair(&self) -> Result<SigningKeypair, StorageError> {
        let secret_path = self.dir.join(SECRET_KEY_FILE);
        if secret_path.exists() {
            let pem = zeroize::Zeroizing::new(
                std::fs::read_to_string(&secret_path).map_err(|e| StorageError::Io(e.to_string()))?,
            );
            let keypair = SigningKeypair::from_secret_pem(&pem)
                .ok_or_else(|| StorageError::InvalidKey(secret_path.display().to_string()))?;
            tracing::info!(address = %keypair.address().short(), "loaded node keypair");
            return Ok(keypair);
        }

        let keypair = SigningKeypair::generate();
        std::fs::write(&secret_path, keypair.secret_pem().as_bytes())
            .map_err(|e| StorageError::Io(e.to_string()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&secret_path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }
        std::fs::write(self.dir.join(PUBLIC_KEY_FILE), keypair.public().to_pem())
            .map_err(|e| StorageError::Io(e.to_string()))?;
        tracing::info!(address = %keypair.address().short(), "generated node keypair");
        Ok(keypair)
    }

    fn atomic_write(&self, name: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let tmp = self.dir.join(format!("{name}.tmp"));
        let path = self.dir.join(name);
        std::fs::write(&tmp, bytes).map_err(|e| StorageError::Io(e.to_string()))?;
        std::fs::rename(&tmp, &path).map_err(|e| StorageError::Io(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::testing::sealed_block;
    use crate::crypto::Digest;

    #[test]
    fn missing_chain_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChainStore::open(dir.path()).unwrap();
        assert!(store.load_chain().unwrap().is_empty());
    }

    #[test]
    fn chain_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChainStore::open(dir.path()).unwrap();
        let leader = SigningKeypair::generate();
        let chain = vec![sealed_block(&leader, 1, Digest::ZERO, vec![])];
        store.save_chain(&chain).unwrap();
        let loaded = store.load_chain().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].hash, chain[0].hash);
        assert!(loaded[0].verify_leader_signature());
    }

    #[test]
    fn accounts_roundtrip_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChainStore::open(dir.path()).unwrap();
        let mut accounts = HashMap::new();
        let a = SigningKeypair::generate().address();
        let b = SigningKeypair::generate().address();
        accounts.insert(a, Account { balance: 10, nonce: 1 });
        accounts.insert(b, Account { balance: 20, nonce: 0 });
        store.save_accounts(&accounts).unwrap();
        let loaded = store.load_accounts().unwrap().unwrap();
        assert_eq!(loaded, accounts);
    }

    #[test]
    fn corrupt_accounts_cache_reports_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChainStore::open(dir.path()).unwrap();
        std::fs::write(dir.path().join("accounts.json"), b"{not json").unwrap();
        assert!(store.load_accounts().unwrap().is_none());
    }

    #[test]
    fn keypair_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChainStore::open(dir.path()).unwrap();
        let first = store.load_or_generate_keypair().unwrap();
        let second = store.load_or_generate_keypair().unwrap();
        assert_eq!(first.address(), second.address());
        assert!(dir.path().join("keypair.pub").exists());
        assert!(dir.path().join("keypair.priv").exists());
    }
}
