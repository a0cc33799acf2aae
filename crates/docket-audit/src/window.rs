//! Hourly Merkle windows and inclusion proofs.
//!
//! A window is a binary tree over an ordered leaf vector; the last leaf of an
//! odd level pairs with itself. Roots are recomputed from the leaf vector on
//! every append. Proofs are the sibling hashes along the leaf-to-root path
//! plus a direction marker per level saying which child the target was.

use serde::{Deserialize, Serialize};

use crate::error::AuditError;
use crate::hash::{pair_hash, GENESIS_HASH};

/// Default window size: one hour.
pub const DEFAULT_WINDOW_MS: i64 = 3_600_000;

/// Floors an epoch-millis timestamp to its window start. A timestamp landing
/// exactly on a boundary starts the new window.
pub fn window_floor(ts_ms: i64, window_ms: i64) -> i64 {
    ts_ms - ts_ms.rem_euclid(window_ms)
}

/// Which child the running hash was at one proof level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "L")]
    Left,
    #[serde(rename = "R")]
    Right,
}

/// A verifiable path from one leaf to a window root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InclusionProof {
    pub window_start: i64,
    pub leaf_index: usize,
    pub leaf_hash: String,
    /// Sibling hashes, leaf level first.
    pub siblings: Vec<String>,
    /// Per-level position of the running hash.
    pub directions: Vec<Direction>,
    pub merkle_root: String,
}

/// One Merkle window's in-memory state.
#[derive(Debug, Clone)]
pub struct MerkleWindow {
    pub window_start_ms: i64,
    pub window_end_ms: i64,
    pub leaves: Vec<String>,
    pub root: String,
    pub finalized: bool,
}

impl MerkleWindow {
    /// Opens an empty window covering `[start, start + window_ms)`.
    pub fn new(window_start_ms: i64, window_ms: i64) -> Self {
        Self {
            window_start_ms,
            window_end_ms: window_start_ms + window_ms,
            leaves: Vec::new(),
            root: GENESIS_HASH.to_string(),
            finalized: false,
        }
    }

    /// Rebuilds a window from persisted leaves.
    pub fn from_leaves(window_start_ms: i64, window_ms: i64, leaves: Vec<String>) -> Self {
        let root = compute_root(&leaves);
        Self {
            window_start_ms,
            window_end_ms: window_start_ms + window_ms,
            leaves,
            root,
            finalized: false,
        }
    }

    /// Appends a leaf and recomputes the root. Returns the leaf index.
    pub fn append(&mut self, leaf_hash: String) -> usize {
        let index = self.leaves.len();
        self.leaves.push(leaf_hash);
        self.root = compute_root(&self.leaves);
        index
    }

    /// Builds the inclusion proof for a leaf hash.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::UnknownLeaf`] if the hash is not in the window.
    pub fn prove(&self, leaf_hash: &str) -> Result<InclusionProof, AuditError> {
        let leaf_index = self
            .leaves
            .iter()
            .position(|leaf| leaf == leaf_hash)
            .ok_or_else(|| AuditError::UnknownLeaf {
                window_start_ms: self.window_start_ms,
                leaf_hash: leaf_hash.to_string(),
            })?;

        let mut siblings = Vec::new();
        let mut directions = Vec::new();

        let mut level: Vec<String> = self.leaves.clone();
        let mut index = leaf_index;

        while level.len() > 1 {
            if level.len() % 2 == 1 {
                level.push(level[level.len() - 1].clone());
            }

            let sibling_index = index ^ 1;
            siblings.push(level[sibling_index].clone());
            directions.push(if index % 2 == 0 {
                Direction::Left
            } else {
                Direction::Right
            });

            level = level
                .chunks(2)
                .map(|pair| pair_hash(&pair[0], &pair[1]))
                .collect();
            index /= 2;
        }

        Ok(InclusionProof {
            window_start: self.window_start_ms,
            leaf_index,
            leaf_hash: leaf_hash.to_string(),
            siblings,
            directions,
            merkle_root: self.root.clone(),
        })
    }
}

/// Computes a root from an ordered leaf vector.
///
/// A single leaf is its own root; the empty vector hashes to the genesis
/// constant (windows are only created on first append, so this is a
/// placeholder, not a reachable state).
pub fn compute_root(leaves: &[String]) -> String {
    if leaves.is_empty() {
        return GENESIS_HASH.to_string();
    }

    let mut level: Vec<String> = leaves.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(level[level.len() - 1].clone());
        }
        level = level
            .chunks(2)
            .map(|pair| pair_hash(&pair[0], &pair[1]))
            .collect();
    }
    level.remove(0)
}

/// Recomputes the root from a proof and compares it to the stated root.
pub fn verify_proof(proof: &InclusionProof) -> bool {
    let mut running = proof.leaf_hash.clone();
    for (sibling, direction) in proof.siblings.iter().zip(proof.directions.iter()) {
        running = match direction {
            Direction::Left => pair_hash(&running, sibling),
            Direction::Right => pair_hash(sibling, &running),
        };
    }
    running == proof.merkle_root
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::digest_hex;

    fn leaf(n: u32) -> String {
        digest_hex(&n.to_be_bytes())
    }

    #[test]
    fn floor_puts_exact_boundary_in_the_later_window() {
        let hour = DEFAULT_WINDOW_MS;
        assert_eq!(window_floor(hour, hour), hour);
        assert_eq!(window_floor(hour - 1, hour), 0);
        assert_eq!(window_floor(hour + 1, hour), hour);
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let mut window = MerkleWindow::new(0, DEFAULT_WINDOW_MS);
        window.append(leaf(1));
        assert_eq!(window.root, leaf(1));
    }

    #[test]
    fn odd_leaf_counts_duplicate_the_tail() {
        let leaves = vec![leaf(1), leaf(2), leaf(3)];
        let expected = pair_hash(
            &pair_hash(&leaf(1), &leaf(2)),
            &pair_hash(&leaf(3), &leaf(3)),
        );
        assert_eq!(compute_root(&leaves), expected);
    }

    #[test]
    fn proofs_verify_for_every_position() {
        let mut window = MerkleWindow::new(0, DEFAULT_WINDOW_MS);
        for n in 1..=5 {
            window.append(leaf(n));
        }

        for n in 1..=5 {
            let proof = window.prove(&leaf(n)).unwrap();
            assert!(verify_proof(&proof), "proof for leaf {n} failed");
            assert_eq!(proof.merkle_root, window.root);
        }
    }

    #[test]
    fn tampered_proof_fails() {
        let mut window = MerkleWindow::new(0, DEFAULT_WINDOW_MS);
        for n in 1..=5 {
            window.append(leaf(n));
        }

        let mut proof = window.prove(&leaf(3)).unwrap();
        assert!(verify_proof(&proof));

        proof.leaf_hash = leaf(99);
        assert!(!verify_proof(&proof), "tampered leaf must not verify");

        let mut proof = window.prove(&leaf(3)).unwrap();
        proof.siblings[0] = leaf(98);
        assert!(!verify_proof(&proof), "tampered sibling must not verify");
    }

    #[test]
    fn appends_change_the_root() {
        let mut window = MerkleWindow::new(0, DEFAULT_WINDOW_MS);
        window.append(leaf(1));
        let first = window.root.clone();
        window.append(leaf(2));
        assert_ne!(window.root, first);
    }

    #[test]
    fn unknown_leaf_is_rejected() {
        let mut window = MerkleWindow::new(0, DEFAULT_WINDOW_MS);
        window.append(leaf(1));
        assert!(matches!(
            window.prove(&leaf(2)),
            Err(AuditError::UnknownLeaf { .. })
        ));
    }
}
