//! Quorum signature verification.

use qbridge_core::{recover_signer, Address, Digest, RelayerSignature};
use tracing::debug;

use crate::error::Rejection;
use crate::registry::Membership;

/// Checks a signature set against a live membership.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuorumVerifier;

impl QuorumVerifier {
    /// Verify that `signatures` over `digest` form a quorum of `members`.
    ///
    /// Checks run in a fixed order: count against the current threshold, then
    /// that every signature recovers to an active member, then that no member
    /// signed twice. Returns the recovered signers in submission order.
    pub fn verify<M: Membership + ?Sized>(
        members: &M,
        digest: &Digest,
        signatures: &[RelayerSignature],
    ) -> Result<Vec<Address>, Rejection> {
        let required = members.threshold();
        if signatures.len() < required {
            debug!(got = signatures.len(), required, "quorum short");
            return Err(Rejection::NotEnoughSignatures {
                got: signatures.len(),
                required,
            });
        }

        let mut signers = Vec::with_capacity(signatures.len());
        for (index, signature) in signatures.iter().enumerate() {
            match recover_signer(digest, signature) {
                Ok(signer) if members.is_member(&signer) => signers.push(signer),
                Ok(signer) => {
                    debug!(index, %signer, "signer not an active member");
                    return Err(Rejection::InvalidSigner { index });
                }
                Err(err) => {
                    debug!(index, error = %err, "signature did not recover");
                    return Err(Rejection::InvalidSigner { index });
                }
            }
        }

        for (i, signer) in signers.iter().enumerate() {
            if signers[..i].contains(signer) {
                return Err(Rejection::DuplicateSignature { signer: *signer });
            }
        }

        Ok(signers)
    }
}
