//! Value-transfer transactions.
//!
//! A transaction moves `amount` token units from `from` to `to` at sender
//! nonce `nonce`. The sentinel sender `"coinbase"` mints instead of
//! debiting: it carries its creation timestamp as a per-mint-unique nonce
//! and the literal `"coinbase"` marker in place of a verifiable signature.
//! Non-coinbase signatures are Ed25519 over the canonical digest of the
//! five value fields, and the embedded public key must hash to `from`.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::crypto::canonical::hash_canonical_value;
use crate::crypto::keys::{Address, PublicKey, Signature, SigningKeypair, COINBASE};
use crate::crypto::Digest;

/// A transaction sender: a real account or the coinbase mint sentinel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Sender {
    Coinbase,
    Account(Address),
}

impl Sender {
    pub fn is_coinbase(&self) -> bool {
        matches!(self, Sender::Coinbase)
    }

    /// The account address, if this is not a mint.
    pub fn address(&self) -> Option<Address> {
        match self {
            Sender::Coinbase => None,
            Sender::Account(addr) => Some(*addr),
        }
    }
}

impl std::fmt::Display for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sender::Coinbase => f.write_str(COINBASE),
            Sender::Account(addr) => addr.fmt(f),
        }
    }
}

impl Serialize for Sender {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            Sender::Coinbase => s.serialize_str(COINBASE),
            Sender::Account(addr) => addr.serialize(s),
        }
    }
}

impl<'de> Deserialize<'de> for Sender {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s: String = Deserialize::deserialize(d)?;
        if s == COINBASE {
            return Ok(Sender::Coinbase);
        }
        Address::from_hex(&s)
            .map(Sender::Account)
            .ok_or_else(|| serde::de::Error::custom("expected address hex or \"coinbase\""))
    }
}

/// A signed value transfer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub from: Sender,
    pub to: Address,
    pub amount: u64,
    pub nonce: u64,
    /// Milliseconds since the Unix epoch at creation.
    pub timestamp: u64,
    /// Base64 Ed25519 signature, or the literal `"coinbase"` marker.
    pub signature: String,
    /// SPKI PEM of the sender key, or the literal `"coinbase"` marker.
    pub public_key: String,
}

impl Transaction {
    /// Build and sign a transfer from `keypair`'s account.
    pub fn transfer(
        keypair: &SigningKeypair,
        to: Address,
        amount: u64,
        nonce: u64,
        timestamp: u64,
    ) -> Self {
        let from = Sender::Account(keypair.address());
        let digest = signing_digest(&from, &to, amount, nonce, timestamp);
        Transaction {
            from,
            to,
            amount,
            nonce,
            timestamp,
            signature: keypair.sign_digest(&digest).to_base64(),
            public_key: keypair.public().to_pem(),
        }
    }

    /// Build a coinbase mint of `amount` to `to`. The timestamp doubles as
    /// the per-mint-unique nonce.
    pub fn coinbase(to: Address, amount: u64, timestamp: u64) -> Self {
        Transaction {
            from: Sender::Coinbase,
            to,
            amount,
            nonce: timestamp,
            timestamp,
            signature: COINBASE.to_string(),
            public_key: COINBASE.to_string(),
        }
    }

    /// The canonical digest identifying this transaction (key of `/proof`).
    pub fn digest(&self) -> Digest {
        crate::crypto::canonical::hash_canonical(self)
    }

    /// Verify the signature and key-to-address binding.
    ///
    /// Coinbase transactions pass by construction of the marker; everything
    /// else must carry a valid signature from a key hashing to `from`.
    pub fn verify(&self) -> bool {
        match self.from {
            Sender::Coinbase => self.signature == COINBASE,
            Sender::Account(from) => {
                let Some(public_key) = PublicKey::from_pem(&self.public_key) else {
                    return false;
                };
                if public_key.address() != from {
                    return false;
                }
                let Some(signature) = Signature::from_base64(&self.signature) else {
                    return false;
                };
                let digest =
                    signing_digest(&self.from, &self.to, self.amount, self.nonce, self.timestamp);
                public_key.verify(digest.as_bytes(), &signature)
            }
        }
    }
}

/// Canonical digest of the five value fields (what the sender signs).
fn signing_digest(from: &Sender, to: &Address, amount: u64, nonce: u64, timestamp: u64) -> Digest {
    hash_canonical_value(&json!({
        "from": from.to_string(),
        "to": to.to_hex(),
        "amount": amount,
        "nonce": nonce,
        "timestamp": timestamp,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> SigningKeypair {
        SigningKeypair::generate()
    }

    #[test]
    fn signed_transfer_verifies() {
        let kp = keypair();
        let to = keypair().address();
        let tx = Transaction::transfer(&kp, to, 100, 1, 1_700_000_000_000);
        assert!(tx.verify());
    }

    #[test]
    fn tampered_amount_fails_verification() {
        let kp = keypair();
        let mut tx = Transaction::transfer(&kp, keypair().address(), 100, 1, 1);
        tx.amount = 101;
        assert!(!tx.verify());
    }

    #[test]
    fn foreign_key_fails_verification() {
        let kp = keypair();
        let other = keypair();
        let mut tx = Transaction::transfer(&kp, other.address(), 100, 1, 1);
        tx.public_key = other.public().to_pem();
        assert!(!tx.verify());
    }

    #[test]
    fn coinbase_verifies_and_nonce_is_timestamp() {
        let tx = Transaction::coinbase(keypair().address(), 1000, 42);
        assert!(tx.verify());
        assert!(tx.from.is_coinbase());
        assert_eq!(tx.nonce, 42);
        assert_eq!(tx.signature, COINBASE);
    }

    #[test]
    fn coinbase_with_forged_signature_fails() {
        let mut tx = Transaction::coinbase(keypair().address(), 1000, 42);
        tx.signature = "AAAA".to_string();
        assert!(!tx.verify());
    }

    #[test]
    fn sender_wire_form() {
        let kp = keypair();
        let account = serde_json::to_string(&Sender::Account(kp.address())).unwrap();
        assert_eq!(account, format!("\"{}\"", kp.address()));
        let coinbase = serde_json::to_string(&Sender::Coinbase).unwrap();
        assert_eq!(coinbase, "\"coinbase\"");
        let parsed: Sender = serde_json::from_str("\"coinbase\"").unwrap();
        assert!(parsed.is_coinbase());
    }

    #[test]
    fn digest_changes_with_nonce() {
        let kp = keypair();
        let to = keypair().address();
        let a = Transaction::transfer(&kp, to, 10, 1, 5);
        let b = Transaction::transfer(&kp, to, 10, 2, 5);
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn wire_roundtrip_preserves_verification() {
        let kp = keypair();
        let tx = Transaction::transfer(&kp, keypair().address(), 7, 3, 9);
        let json = serde_json::to_string(&tx).unwrap();
        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert!(back.verify());
        assert_eq!(back.digest(), tx.digest());
    }
}
