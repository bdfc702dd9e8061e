//! Checkpoint / light-client store
//!
//! Maps header ids to accepted state roots. Every accepted header stays
//! queryable; `latest` only records the most recent submission.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use qbridge_core::encoding::hex_digest;
use qbridge_core::{checkpoint_digest, digest_hex, Address, ChainId, Digest, RelayerSignature};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Rejection;
use crate::inclusion::verify_encoded;
use crate::quorum::QuorumVerifier;
use crate::registry::{Membership, ValidatorSet};

/// An accepted `header id -> state root` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(with = "hex_digest")]
    pub header_id: Digest,
    #[serde(with = "hex_digest")]
    pub accepted_root: Digest,
}

/// Source-chain header submitted for validator attestation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointHeader {
    pub source_chain: ChainId,
    pub height: u64,
    #[serde(with = "hex_digest")]
    pub header_id: Digest,
    #[serde(with = "hex_digest")]
    pub state_root: Digest,
}

impl CheckpointHeader {
    /// Digest validators sign for this header.
    pub fn digest(&self) -> Digest {
        checkpoint_digest(self.source_chain, self.height, &self.header_id, &self.state_root)
    }
}

/// Who may record checkpoints.
#[derive(Debug, Clone)]
pub enum SubmitterPolicy {
    /// A single owner account.
    Owner(Address),
    /// Any member of the validator set, or a validator quorum via
    /// [`CheckpointStore::submit_checkpoint`].
    Validators(Arc<ValidatorSet>),
}

/// Read side used by the proof acceptance path.
pub trait LightClient: Send + Sync {
    fn accepted_root(&self, header_id: &Digest) -> Option<Digest>;

    fn latest_checkpoint(&self) -> Option<Checkpoint>;

    /// Verify an encoded proof against the root accepted for `header_id`,
    /// returning the receipt leaf.
    fn verify_inclusion(&self, header_id: &Digest, encoded_proof: &[u8]) -> Result<Digest, Rejection> {
        let root = self.accepted_root(header_id).ok_or_else(|| {
            Rejection::InvalidProof(format!("unknown header {}", digest_hex(header_id)))
        })?;
        verify_encoded(&root, encoded_proof)
    }

    fn verify_proof(&self, header_id: &Digest, encoded_proof: &[u8]) -> bool {
        self.verify_inclusion(header_id, encoded_proof).is_ok()
    }
}

#[derive(Debug, Default)]
struct StoreState {
    roots: HashMap<Digest, Digest>,
    latest: Option<Checkpoint>,
}

#[derive(Debug)]
pub struct CheckpointStore {
    policy: SubmitterPolicy,
    state: RwLock<StoreState>,
}

impl CheckpointStore {
    pub fn new(policy: SubmitterPolicy) -> Self {
        Self {
            policy,
            state: RwLock::new(StoreState::default()),
        }
    }

    pub fn policy(&self) -> &SubmitterPolicy {
        &self.policy
    }

    fn authorize(&self, caller: &Address) -> Result<(), Rejection> {
        let allowed = match &self.policy {
            SubmitterPolicy::Owner(owner) => owner == caller,
            SubmitterPolicy::Validators(set) => set.is_member(caller),
        };
        if allowed {
            Ok(())
        } else {
            Err(Rejection::Unauthorized(format!("{caller} may not submit checkpoints")))
        }
    }

    /// Record a root directly. The caller must be authorized by the policy.
    pub fn submit_header(
        &self,
        caller: &Address,
        header_id: Digest,
        accepted_root: Digest,
    ) -> Result<(), Rejection> {
        self.authorize(caller)?;
        self.record(header_id, accepted_root)
    }

    /// Record a header attested by a validator quorum.
    pub fn submit_checkpoint(
        &self,
        header: &CheckpointHeader,
        signatures: &[RelayerSignature],
    ) -> Result<(), Rejection> {
        let SubmitterPolicy::Validators(validators) = &self.policy else {
            return Err(Rejection::Unauthorized(
                "quorum checkpoints need a validator set".into(),
            ));
        };
        let signers = QuorumVerifier::verify(&**validators, &header.digest(), signatures)?;
        debug!(
            chain = %header.source_chain,
            height = header.height,
            signers = signers.len(),
            "checkpoint quorum verified"
        );
        self.record(header.header_id, header.state_root)
    }

    fn record(&self, header_id: Digest, accepted_root: Digest) -> Result<(), Rejection> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match state.roots.get(&header_id) {
            Some(existing) if *existing != accepted_root => {
                return Err(Rejection::CheckpointConflict { header_id });
            }
            Some(_) => debug!(header = %digest_hex(&header_id), "checkpoint resubmitted"),
            None => {
                state.roots.insert(header_id, accepted_root);
                info!(
                    header = %digest_hex(&header_id),
                    root = %digest_hex(&accepted_root),
                    "checkpoint accepted"
                );
            }
        }
        state.latest = Some(Checkpoint {
            header_id,
            accepted_root,
        });
        Ok(())
    }

    pub fn checkpoint_count(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .roots
            .len()
    }
}

impl LightClient for CheckpointStore {
    fn accepted_root(&self, header_id: &Digest) -> Option<Digest> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .roots
            .get(header_id)
            .copied()
    }

    fn latest_checkpoint(&self) -> Option<Checkpoint> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).latest
    }
}
