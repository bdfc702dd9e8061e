//! Merkle inclusion verification
//!
//! Decodes an encoded proof, validates the receipt envelope, hashes it into a
//! leaf and folds the leaf through its sibling path. Structural failures are
//! raised before any hashing happens.

use qbridge_core::{digest_hex, fold_proof, receipt_leaf, Digest, EncodedProof};
use tracing::debug;

use crate::error::Rejection;

/// Verify a decoded proof against `root`, returning the receipt leaf.
pub fn verify_inclusion(root: &Digest, proof: &EncodedProof) -> Result<Digest, Rejection> {
    if !proof.bitmask.covers(proof.siblings.len()) {
        return Err(Rejection::InvalidProof(format!(
            "bitmask of {} bytes cannot cover {} siblings",
            proof.bitmask.as_bytes().len(),
            proof.siblings.len()
        )));
    }

    let leaf = receipt_leaf(&proof.receipt)?;
    let computed = fold_proof(&leaf, &proof.siblings, &proof.bitmask)?;
    if &computed != root {
        debug!(
            computed = %digest_hex(&computed),
            expected = %digest_hex(root),
            "inclusion root mismatch"
        );
        return Err(Rejection::InvalidProof("root mismatch".into()));
    }
    Ok(leaf)
}

/// Decode `encoded` and verify it against `root`.
pub fn verify_encoded(root: &Digest, encoded: &[u8]) -> Result<Digest, Rejection> {
    let proof = EncodedProof::decode(encoded)?;
    verify_inclusion(root, &proof)
}

#[cfg(test)]
mod tests {
    use super::*;
    use qbridge_core::receipt::BLOOM_LEN;
    use qbridge_core::{encode_receipt, Bitmask, MerkleTree};

    fn receipts(n: u8) -> Vec<Vec<u8>> {
        (0..n)
            .map(|i| encode_receipt(&[1], 21_000 + i as u64, &[i; BLOOM_LEN], &[]))
            .collect()
    }

    fn tree(receipts: &[Vec<u8>]) -> MerkleTree {
        let leaves: Vec<Digest> = receipts.iter().map(|r| receipt_leaf(r).unwrap()).collect();
        MerkleTree::build(&leaves).unwrap()
    }

    #[test]
    fn test_each_proof_verifies() {
        let receipts = receipts(5);
        let tree = tree(&receipts);
        for (i, receipt) in receipts.iter().enumerate() {
            let proof = EncodedProof::new(receipt.clone(), &tree.proof(i).unwrap());
            let leaf = verify_encoded(&tree.root(), &proof.encode()).unwrap();
            assert_eq!(leaf, receipt_leaf(receipt).unwrap());
        }
    }

    #[test]
    fn test_wrong_root_rejected() {
        let receipts = receipts(3);
        let tree = tree(&receipts);
        let proof = EncodedProof::new(receipts[0].clone(), &tree.proof(0).unwrap());
        assert_eq!(
            verify_inclusion(&[9u8; 32], &proof).unwrap_err(),
            Rejection::InvalidProof("root mismatch".into())
        );
    }

    #[test]
    fn test_empty_siblings_rejected_on_multi_leaf_tree() {
        let receipts = receipts(3);
        let tree = tree(&receipts);
        let proof = EncodedProof {
            receipt: receipts[0].clone(),
            siblings: vec![],
            bitmask: Bitmask::default(),
        };
        assert!(verify_inclusion(&tree.root(), &proof).is_err());
    }

    #[test]
    fn test_short_bitmask_rejected() {
        let receipts = receipts(4);
        let tree = tree(&receipts);
        let mut proof = EncodedProof::new(receipts[1].clone(), &tree.proof(1).unwrap());
        proof.bitmask = Bitmask(vec![]);
        let err = verify_inclusion(&tree.root(), &proof).unwrap_err();
        assert!(err.to_string().contains("cannot cover"));
    }

    #[test]
    fn test_malformed_receipt_rejected_before_fold() {
        let mut bad = receipts(1).remove(0);
        bad[0] = 0x01;
        let leaf = qbridge_core::digest::keccak256(&bad);
        let tree = MerkleTree::build(&[leaf, [3u8; 32]]).unwrap();
        let proof = EncodedProof::new(bad, &tree.proof(0).unwrap());
        let err = verify_inclusion(&tree.root(), &proof).unwrap_err();
        assert!(matches!(err, Rejection::InvalidProof(ref r) if r.contains("not a list")));
    }

    #[test]
    fn test_garbage_encoding_rejected() {
        assert!(verify_encoded(&[0u8; 32], &[0xff; 40]).is_err());
    }
}
