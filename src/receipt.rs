//! Participation challenges and signed receipts.
//!
//! Each epoch a node challenges a handful of peers; the responder runs a
//! fixed bounded work function and returns a signed `Receipt` attesting the
//! exchange. The work function is part of the wire contract: every
//! implementation must produce the same `workResult`.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::crypto::canonical::hash_canonical_value;
use crate::crypto::keys::{Address, PublicKey, Signature, SigningKeypair};
use crate::crypto::Digest;

/// Iterations of the challenge work loop.
const WORK_ROUNDS: u64 = 10_000;
/// Modulus of the challenge work loop.
const WORK_MODULUS: u64 = 1_000_000_007;

/// A challenge sent to one peer at epoch start.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    pub challenge_id: String,
    pub from: Address,
    pub to: Address,
    pub epoch: u64,
}

impl Challenge {
    /// Build a challenge with a fresh random 16-byte id.
    pub fn new(from: Address, to: Address, epoch: u64) -> Self {
        use rand::RngCore as _;
        let mut token = [0u8; 16];
        rand::rng().fill_bytes(&mut token);
        Challenge {
            challenge_id: hex::encode(token),
            from,
            to,
            epoch,
        }
    }
}

/// A signed attestation that a challenge was served.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub challenge_id: String,
    /// The challenger.
    pub from: Address,
    /// The responder, whose key signs the receipt.
    pub to: Address,
    pub epoch: u64,
    pub success: bool,
    pub latency_ms: u64,
    pub timestamp: u64,
    pub work_result: u64,
    /// Base64 Ed25519 signature by the responder over all other fields.
    pub signature: String,
}

impl Receipt {
    /// Respond to a challenge: run the work function (timing it for the
    /// latency field), fill the receipt, sign it with the responder key.
    pub fn respond(challenge: &Challenge, responder: &SigningKeypair, timestamp: u64) -> Self {
        let started = std::time::Instant::now();
        let work_result = challenge_work();
        let latency_ms = started.elapsed().as_millis() as u64;
        let mut receipt = Receipt {
            challenge_id: challenge.challenge_id.clone(),
            from: challenge.from,
            to: challenge.to,
            epoch: challenge.epoch,
            success: true,
            latency_ms,
            timestamp,
            work_result,
            signature: String::new(),
        };
        receipt.signature = responder.sign_digest(&receipt.signing_digest()).to_base64();
        receipt
    }

    /// Canonical digest of every field except the signature.
    pub fn signing_digest(&self) -> Digest {
        hash_canonical_value(&json!({
            "challengeId": self.challenge_id,
            "from": self.from.to_hex(),
            "to": self.to.to_hex(),
            "epoch": self.epoch,
            "success": self.success,
            "latencyMs": self.latency_ms,
            "timestamp": self.timestamp,
            "workResult": self.work_result,
        }))
    }

    /// Canonical digest of the whole receipt (Merkle leaf for receiptRoot).
    pub fn digest(&self) -> Digest {
        crate::crypto::canonical::hash_canonical(self)
    }

    /// Verify the responder's signature and key-to-address binding.
    pub fn verify(&self, responder_key: &PublicKey) -> bool {
        if responder_key.address() != self.to {
            return false;
        }
        let Some(signature) = Signature::from_base64(&self.signature) else {
            return false;
        };
        responder_key.verify(self.signing_digest().as_bytes(), &signature)
    }

    /// Structural completeness required by proposal validation: the fields
    /// that make a receipt attributable must be present.
    pub fn is_well_formed(&self) -> bool {
        !self.challenge_id.is_empty() && !self.signature.is_empty()
    }
}

/// The bounded pseudo-random challenge work function (wire contract):
/// `r ← 0; for i in 0..10000 { r ← (r·31 + i) mod 1_000_000_007 }`.
pub fn challenge_work() -> u64 {
    let mut r: u64 = 0;
    for i in 0..WORK_ROUNDS {
        r = (r.wrapping_mul(31).wrapping_add(i)) % WORK_MODULUS;
    }
    r
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_function_is_stable() {
        // The exact value is load-bearing for cross-implementation receipts.
        assert_eq!(challenge_work(), challenge_work());
        let mut expected: u64 = 0;
        for i in 0..10_000u64 {
            expected = (expected * 31 + i) % 1_000_000_007;
        }
        assert_eq!(challenge_work(), expected);
    }

    #[test]
    fn respond_produces_verifiable_receipt() {
        let challenger = SigningKeypair::generate();
        let responder = SigningKeypair::generate();
        let challenge = Challenge::new(challenger.address(), responder.address(), 3);
        let receipt = Receipt::respond(&challenge, &responder, 1_000);
        assert!(receipt.verify(&responder.public()));
        assert!(receipt.is_well_formed());
        assert_eq!(receipt.epoch, 3);
        assert_eq!(receipt.work_result, challenge_work());
    }

    #[test]
    fn receipt_rejects_wrong_key() {
        let challenger = SigningKeypair::generate();
        let responder = SigningKeypair::generate();
        let challenge = Challenge::new(challenger.address(), responder.address(), 1);
        let receipt = Receipt::respond(&challenge, &responder, 1);
        assert!(!receipt.verify(&challenger.public()));
    }

    #[test]
    fn tampered_receipt_fails_verification() {
        let challenger = SigningKeypair::generate();
        let responder = SigningKeypair::generate();
        let challenge = Challenge::new(challenger.address(), responder.address(), 1);
        let mut receipt = Receipt::respond(&challenge, &responder, 1);
        receipt.work_result += 1;
        assert!(!receipt.verify(&responder.public()));
    }

    #[test]
    fn challenge_ids_are_unique() {
        let a = SigningKeypair::generate().address();
        let b = SigningKeypair::generate().address();
        let c1 = Challenge::new(a, b, 1);
        let c2 = Challenge::new(a, b, 1);
        assert_ne!(c1.challenge_id, c2.challenge_id);
        assert_eq!(c1.challenge_id.len(), 32);
    }
}
