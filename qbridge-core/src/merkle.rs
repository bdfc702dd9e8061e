//! Balanced binary merkle tree over receipt leaves
//!
//! Adjacent nodes are paired left to right. An odd level pairs its last node
//! with [`ZERO_HASH`] rather than with a copy of itself, so `[a, b, c]` and
//! `[a, b, c, c]` never share a root.

use serde::{Deserialize, Serialize};
use sha3::{Digest as _, Keccak256};

use crate::encoding::{hex_digests, Bitmask};
use crate::{CoreError, Digest};

/// Padding sibling for the last node of an odd level.
pub const ZERO_HASH: Digest = [0u8; 32];

/// Interior node: `keccak256(left ‖ right)`.
pub fn hash_pair(left: &Digest, right: &Digest) -> Digest {
    let mut hasher = Keccak256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Sibling path from a leaf up to the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    #[serde(with = "hex_digests")]
    pub siblings: Vec<Digest>,
    pub bitmask: Bitmask,
}

impl MerkleProof {
    /// Fold `leaf` through this path.
    pub fn fold(&self, leaf: &Digest) -> Result<Digest, CoreError> {
        fold_proof(leaf, &self.siblings, &self.bitmask)
    }
}

/// All levels of a built tree, leaves first.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    levels: Vec<Vec<Digest>>,
}

impl MerkleTree {
    /// Build the tree. Fails on an empty leaf set, or if a level ever fails to
    /// shrink.
    pub fn build(leaves: &[Digest]) -> Result<Self, CoreError> {
        if leaves.is_empty() {
            return Err(CoreError::EmptyTree);
        }

        let mut levels = vec![leaves.to_vec()];
        loop {
            let current = &levels[levels.len() - 1];
            if current.len() == 1 {
                break;
            }

            let next: Vec<Digest> = current
                .chunks(2)
                .map(|pair| hash_pair(&pair[0], pair.get(1).unwrap_or(&ZERO_HASH)))
                .collect();

            if next.len() >= current.len() {
                return Err(CoreError::NonShrinkingLevel {
                    level: levels.len() - 1,
                    size: current.len(),
                });
            }
            levels.push(next);
        }

        Ok(Self { levels })
    }

    pub fn root(&self) -> Digest {
        // build() guarantees a final level holding exactly one node
        self.levels
            .last()
            .and_then(|level| level.first())
            .copied()
            .unwrap_or(ZERO_HASH)
    }

    pub fn leaf_count(&self) -> usize {
        self.levels.first().map_or(0, Vec::len)
    }

    pub fn depth(&self) -> usize {
        self.levels.len() - 1
    }

    /// Proof for leaf `index`. A single-leaf tree yields an empty proof.
    pub fn proof(&self, index: usize) -> Result<MerkleProof, CoreError> {
        let leaves = self.leaf_count();
        if index >= leaves {
            return Err(CoreError::LeafIndexOutOfRange { index, leaves });
        }

        let mut siblings = Vec::with_capacity(self.depth());
        let mut directions = Vec::with_capacity(self.depth());
        let mut position = index;

        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_is_left = position % 2 == 1;
            let sibling = level.get(position ^ 1).copied().unwrap_or(ZERO_HASH);
            siblings.push(sibling);
            directions.push(sibling_is_left);
            position /= 2;
        }

        Ok(MerkleProof {
            siblings,
            bitmask: Bitmask::from_directions(&directions),
        })
    }
}

/// Fold `leaf` through `siblings`, reading direction bit `i` for sibling `i`.
/// A bitmask too short to cover every sibling is rejected before any hashing.
pub fn fold_proof(leaf: &Digest, siblings: &[Digest], bitmask: &Bitmask) -> Result<Digest, CoreError> {
    if !bitmask.covers(siblings.len()) {
        return Err(CoreError::InvalidProof(format!(
            "bitmask of {} bytes cannot cover {} siblings",
            bitmask.as_bytes().len(),
            siblings.len()
        )));
    }

    let mut computed = *leaf;
    for (i, sibling) in siblings.iter().enumerate() {
        computed = if bitmask.bit(i) == Some(true) {
            hash_pair(sibling, &computed)
        } else {
            hash_pair(&computed, sibling)
        };
    }
    Ok(computed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::keccak256;
    use proptest::prelude::*;

    fn leaves(n: usize, salt: u8) -> Vec<Digest> {
        (0..n)
            .map(|i| keccak256([salt, (i >> 8) as u8, i as u8]))
            .collect()
    }

    fn assert_all_proofs_fold(leaves: &[Digest]) {
        let tree = MerkleTree::build(leaves).unwrap();
        for (i, leaf) in leaves.iter().enumerate() {
            let proof = tree.proof(i).unwrap();
            assert_eq!(proof.fold(leaf).unwrap(), tree.root(), "leaf {i} of {}", leaves.len());
        }
    }

    #[test]
    fn test_small_trees_reconstruct_root() {
        for n in 1..=5 {
            assert_all_proofs_fold(&leaves(n, 0));
        }
    }

    #[test]
    fn test_large_tree_reconstructs_root() {
        let set = leaves(1024, 1);
        assert_all_proofs_fold(&set);
        assert_eq!(MerkleTree::build(&set).unwrap().depth(), 10);
    }

    #[test]
    fn test_single_leaf_is_its_own_root() {
        let leaf = keccak256(b"only");
        let tree = MerkleTree::build(&[leaf]).unwrap();
        assert_eq!(tree.root(), leaf);

        let proof = tree.proof(0).unwrap();
        assert!(proof.siblings.is_empty());
        assert!(proof.bitmask.as_bytes().is_empty());
        assert_eq!(proof.fold(&leaf).unwrap(), leaf);
    }

    #[test]
    fn test_odd_level_pads_with_zero_not_duplicate() {
        let set = leaves(3, 2);
        let padded = {
            let mut s = set.clone();
            s.push(set[2]);
            s
        };
        let a = MerkleTree::build(&set).unwrap().root();
        let b = MerkleTree::build(&padded).unwrap().root();
        assert_ne!(a, b);

        let expected = hash_pair(
            &hash_pair(&set[0], &set[1]),
            &hash_pair(&set[2], &ZERO_HASH),
        );
        assert_eq!(a, expected);
    }

    #[test]
    fn test_proof_fails_against_other_tree() {
        let l1 = leaves(4, 3);
        let l2 = leaves(4, 4);
        let t1 = MerkleTree::build(&l1).unwrap();
        let t2 = MerkleTree::build(&l2).unwrap();

        for (i, leaf) in l1.iter().enumerate() {
            let folded = t1.proof(i).unwrap().fold(leaf).unwrap();
            assert_ne!(folded, t2.root());
        }
    }

    #[test]
    fn test_empty_proof_rejected_for_multi_leaf_tree() {
        let set = leaves(4, 5);
        let tree = MerkleTree::build(&set).unwrap();
        let folded = fold_proof(&set[0], &[], &Bitmask::default()).unwrap();
        assert_ne!(folded, tree.root());
    }

    #[test]
    fn test_short_bitmask_rejected_before_folding() {
        let set = leaves(16, 6);
        let tree = MerkleTree::build(&set).unwrap();
        let proof = tree.proof(3).unwrap();
        assert_eq!(proof.siblings.len(), 4);

        let err = fold_proof(&set[3], &proof.siblings, &Bitmask(vec![])).unwrap_err();
        assert!(matches!(err, CoreError::InvalidProof(_)));
    }

    #[test]
    fn test_flipped_direction_breaks_proof() {
        let set = leaves(5, 7);
        let tree = MerkleTree::build(&set).unwrap();
        let mut proof = tree.proof(1).unwrap();
        proof.bitmask.0[0] ^= 1;
        assert_ne!(proof.fold(&set[1]).unwrap(), tree.root());
    }

    #[test]
    fn test_empty_and_out_of_range() {
        assert_eq!(MerkleTree::build(&[]).unwrap_err(), CoreError::EmptyTree);

        let tree = MerkleTree::build(&leaves(2, 8)).unwrap();
        assert_eq!(
            tree.proof(2).unwrap_err(),
            CoreError::LeafIndexOutOfRange { index: 2, leaves: 2 }
        );
    }

    proptest! {
        #[test]
        fn prop_every_proof_folds_to_root(n in 1usize..200, pick in any::<prop::sample::Index>(), salt in any::<u8>()) {
            let set = leaves(n, salt);
            let tree = MerkleTree::build(&set).unwrap();
            let i = pick.index(n);
            let proof = tree.proof(i).unwrap();
            prop_assert_eq!(proof.fold(&set[i]).unwrap(), tree.root());
            prop_assert!(proof.bitmask.covers(proof.siblings.len()));
        }

        #[test]
        fn prop_proof_does_not_verify_a_different_leaf(n in 2usize..64, salt in any::<u8>()) {
            let set = leaves(n, salt);
            let tree = MerkleTree::build(&set).unwrap();
            let proof = tree.proof(0).unwrap();
            prop_assert_ne!(proof.fold(&set[1]).unwrap(), tree.root());
        }
    }
}
