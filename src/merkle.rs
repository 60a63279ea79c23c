//! Merkle commitments over ordered leaf sequences.
//!
//! Adjacent nodes are paired and hashed (`sha256(left || right)`); an odd
//! level duplicates its last node. The empty sequence commits to the
//! all-zero root and a single leaf commits to itself, so SPV proofs for a
//! one-transaction block degenerate to an empty sibling path.

use serde::{Deserialize, Serialize};

use crate::crypto::{sha256_pair, Digest};

/// One level of a Merkle inclusion proof: the sibling digest and the side
/// it concatenates on when rebuilding the running hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofStep {
    pub sibling_digest: Digest,
    pub sibling_is_left: bool,
}

/// Compute the Merkle root of an ordered leaf sequence.
pub fn merkle_root(leaves: &[Digest]) -> Digest {
    if leaves.is_empty() {
        return Digest::ZERO;
    }
    let mut level: Vec<Digest> = leaves.to_vec();
    while level.len() > 1 {
        level = next_level(&level);
    }
    level[0]
}

/// Build the inclusion proof for the leaf at `index`.
///
/// Returns `None` when the index is out of range. The proof for a
/// single-leaf tree is empty.
pub fn merkle_proof(leaves: &[Digest], index: usize) -> Option<Vec<ProofStep>> {
    if index >= leaves.len() {
        return None;
    }
    let mut proof = Vec::new();
    let mut level: Vec<Digest> = leaves.to_vec();
    let mut pos = index;
    while level.len() > 1 {
        let sibling_pos = if pos % 2 == 0 { pos + 1 } else { pos - 1 };
        // An odd level duplicates its last node as its own sibling.
        let sibling = if sibling_pos < level.len() {
            level[sibling_pos]
        } else {
            level[pos]
        };
        proof.push(ProofStep {
            sibling_digest: sibling,
            sibling_is_left: pos % 2 == 1,
        });
        level = next_level(&level);
        pos /= 2;
    }
    Some(proof)
}

/// Verify an inclusion proof against a root.
pub fn merkle_verify(leaf: &Digest, proof: &[ProofStep], root: &Digest) -> bool {
    let mut running = *leaf;
    for step in proof {
        running = if step.sibling_is_left {
            sha256_pair(&step.sibling_digest, &running)
        } else {
            sha256_pair(&running, &step.sibling_digest)
        };
    }
    running == *root
}

fn next_level(level: &[Digest]) -> Vec<Digest> {
    let mut parents = Vec::with_capacity(level.len().div_ceil(2));
    for pair in level.chunks(2) {
        let left = &pair[0];
        let right = pair.get(1).unwrap_or(left);
        parents.push(sha256_pair(left, right));
    }
    parents
}
