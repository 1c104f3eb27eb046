//! Per-card Merkle trees
//!
//! # Design
//!
//! - Binary Merkle tree over hex SHA-256 digests
//! - Leaves are a card's event hashes in chronological order
//! - Odd level: the trailing node is carried up unchanged (never duplicated)
//! - Inclusion proofs (O(log n) siblings)
//!
//! The root is derived data. [`MerkleCache`] keeps the latest root and event
//! history per card, but the persisted chain stays the source of truth and
//! any entry can be dropped and recomputed.

use crate::crypto::{digests_match, hash_pair};
use crate::types::LedgerEvent;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

/// Compute the Merkle root of an ordered list of hashes
///
/// One leaf is its own root. An empty list is a caller error.
pub fn merkle_root(leaves: &[String]) -> Result<String> {
    if leaves.is_empty() {
        return Err(Error::EmptyChain("no leaves to build a Merkle root".to_string()));
    }

    let mut current_level = leaves.to_vec();

    while current_level.len() > 1 {
        current_level = next_level(&current_level);
    }

    Ok(current_level.swap_remove(0))
}

/// Merkle root over the stored hashes of events already in chronological order
pub fn card_merkle_root(events: &[LedgerEvent]) -> Result<String> {
    let leaves: Vec<String> = events.iter().map(|e| e.hash.clone()).collect();
    merkle_root(&leaves).map_err(|_| match events.first() {
        Some(event) => Error::EmptyChain(format!("card {}", event.card_id)),
        None => Error::EmptyChain("no events".to_string()),
    })
}

/// Pair adjacent nodes left-to-right; carry an unpaired trailing node
fn next_level(level: &[String]) -> Vec<String> {
    level
        .chunks(2)
        .map(|pair| match pair {
            [left, right] => hash_pair(left, right),
            _ => pair[0].clone(),
        })
        .collect()
}

/// Merkle proof (path from leaf to root)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    /// Leaf hash being proven
    pub leaf_hash: String,
    /// Sibling hashes along the path to root (carried levels contribute none)
    pub siblings: Vec<(Direction, String)>,
    /// Root hash
    pub root_hash: String,
}

/// Direction of sibling in Merkle tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Sibling is on the left
    Left,
    /// Sibling is on the right
    Right,
}

impl MerkleProof {
    /// Verify proof against its root hash
    pub fn verify(&self) -> bool {
        let mut current_hash = self.leaf_hash.clone();

        for (direction, sibling_hash) in &self.siblings {
            current_hash = match direction {
                Direction::Left => hash_pair(sibling_hash, &current_hash),
                Direction::Right => hash_pair(&current_hash, sibling_hash),
            };
        }

        digests_match(&current_hash, &self.root_hash)
    }
}

/// Merkle tree over one card's chain
#[derive(Debug, Clone, Default)]
pub struct CardMerkleTree {
    /// Leaf hashes (chronological)
    leaves: Vec<String>,
    /// Cached root hash
    cached_root: Option<String>,
}

impl CardMerkleTree {
    /// Create empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Create tree from existing leaves
    pub fn from_leaves(leaves: Vec<String>) -> Self {
        Self {
            leaves,
            cached_root: None,
        }
    }

    /// Append a new leaf
    pub fn append(&mut self, leaf_hash: String) {
        self.leaves.push(leaf_hash);
        self.cached_root = None;
    }

    /// Get number of leaves
    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    /// Check if tree is empty
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Compute Merkle root
    pub fn root(&mut self) -> Result<String> {
        if let Some(root) = &self.cached_root {
            return Ok(root.clone());
        }

        let root = merkle_root(&self.leaves)?;
        self.cached_root = Some(root.clone());
        Ok(root)
    }

    /// Generate Merkle proof for a leaf at given index
    pub fn generate_proof(&mut self, leaf_index: usize) -> Option<MerkleProof> {
        if leaf_index >= self.leaves.len() {
            return None;
        }

        let leaf_hash = self.leaves[leaf_index].clone();
        let root_hash = self.root().ok()?;
        let mut siblings = Vec::new();

        let mut current_level = self.leaves.clone();
        let mut current_index = leaf_index;

        while current_level.len() > 1 {
            if current_index % 2 == 1 {
                siblings.push((Direction::Left, current_level[current_index - 1].clone()));
            } else if current_index + 1 < current_level.len() {
                siblings.push((Direction::Right, current_level[current_index + 1].clone()));
            }
            // else: carried to the next level unchanged

            current_level = next_level(&current_level);
            current_index /= 2;
        }

        Some(MerkleProof {
            leaf_hash,
            siblings,
            root_hash,
        })
    }

    /// Verify that a leaf exists in the tree at `leaf_index`
    pub fn verify_leaf(&mut self, leaf_index: usize, leaf_hash: &str) -> bool {
        match self.leaves.get(leaf_index) {
            Some(leaf) if digests_match(leaf, leaf_hash) => {}
            _ => return false,
        }

        match self.generate_proof(leaf_index) {
            Some(proof) => proof.verify(),
            None => false,
        }
    }
}

/// Cached branch of one card
#[derive(Debug, Clone)]
pub struct CardBranch {
    /// Merkle root over the chronological event hashes
    pub root: String,
    /// Events in chronological order
    pub events: Vec<LedgerEvent>,
}

/// Process-wide, recomputable cache of per-card roots and histories
///
/// Every [`store`](Self::store) and [`invalidate`](Self::invalidate) stamps
/// the card with a new generation. A full scan merged through
/// [`merge_scan`](Self::merge_scan) never overwrites a card stamped after the
/// scan started loading.
#[derive(Debug, Default)]
pub struct MerkleCache {
    state: RwLock<CacheState>,
}

#[derive(Debug, Default)]
struct CacheState {
    branches: HashMap<Uuid, CardBranch>,
    /// Generation of the last targeted write per card
    touched: HashMap<Uuid, u64>,
    generation: u64,
}

impl CacheState {
    fn stamp(&mut self, card_id: Uuid) {
        self.generation += 1;
        self.touched.insert(card_id, self.generation);
    }
}

impl MerkleCache {
    /// Create empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Current generation; capture it before loading a full scan
    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    /// Merge the result of a full scan
    ///
    /// `started` is the generation captured before the scanned data was
    /// loaded. Cards written or invalidated after it keep their entry.
    /// `None` means the load time is unknown: every targeted write is kept.
    /// All other entries are replaced by `scanned`, and cards absent from
    /// the scan are dropped.
    pub fn merge_scan(&self, started: Option<u64>, scanned: HashMap<Uuid, CardBranch>) {
        let mut state = self.state.write();
        let is_newer = |generation: u64| started.map_or(true, |s| generation > s);

        let mut previous = std::mem::take(&mut state.branches);
        let touched = &state.touched;
        let mut merged: HashMap<Uuid, CardBranch> = previous
            .drain()
            .filter(|(id, _)| touched.get(id).is_some_and(|&g| is_newer(g)))
            .collect();

        for (card_id, branch) in scanned {
            let newer = touched.get(&card_id).is_some_and(|&g| is_newer(g));
            if !newer {
                merged.insert(card_id, branch);
            }
        }

        state.branches = merged;
        if started.is_some() {
            state.touched.retain(|_, g| is_newer(*g));
        }
    }

    /// Store the branch of one card
    pub fn store(&self, card_id: Uuid, branch: CardBranch) {
        let mut state = self.state.write();
        state.stamp(card_id);
        state.branches.insert(card_id, branch);
    }

    /// Cached root of a card
    pub fn root(&self, card_id: Uuid) -> Option<String> {
        self.state.read().branches.get(&card_id).map(|b| b.root.clone())
    }

    /// Cached chronological history of a card
    pub fn history(&self, card_id: Uuid) -> Option<Vec<LedgerEvent>> {
        self.state.read().branches.get(&card_id).map(|b| b.events.clone())
    }

    /// Drop the entry of one card
    pub fn invalidate(&self, card_id: Uuid) {
        let mut state = self.state.write();
        state.stamp(card_id);
        state.branches.remove(&card_id);
    }

    /// Number of cached cards
    pub fn len(&self) -> usize {
        self.state.read().branches.len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.state.read().branches.is_empty()
    }
}
