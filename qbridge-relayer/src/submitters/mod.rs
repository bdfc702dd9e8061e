//! Destination chain submitters.

#[cfg(feature = "evm")]
mod evm;
mod local;

#[cfg(feature = "evm")]
pub use evm::EvmSubmitter;
pub use local::LocalSubmitter;

use anyhow::Result;
use async_trait::async_trait;
use qbridge_core::{Address, BridgeMessage, ChainId, Digest};
use qbridge_verifier::{AcceptancePath, AcceptanceProof};
use serde::{Deserialize, Serialize};

use crate::error::SubmitError;

/// A message and the proof it is submitted with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRequest {
    pub message: BridgeMessage,
    pub proof: AcceptanceProof,
}

impl SubmissionRequest {
    pub fn digest(&self) -> Digest {
        self.message.digest()
    }
}

/// Confirmation of an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionReceipt {
    pub digest: Digest,
    pub path: AcceptancePath,
    /// Transaction hash, when the destination is a real chain.
    pub tx_hash: Option<String>,
}

/// Trait for destination submitters.
#[async_trait]
pub trait Submitter: Send + Sync {
    /// Destination chain this submitter delivers to.
    fn destination(&self) -> ChainId;

    /// Submit one message. Rejections the destination explains come back as
    /// [`SubmitError::Rejected`].
    async fn submit(&self, request: &SubmissionRequest) -> Result<SubmissionReceipt, SubmitError>;

    /// Whether the destination already consumed `digest`.
    async fn is_delivered(&self, digest: &Digest) -> Result<bool, SubmitError>;

    /// Relayers the destination currently accepts signatures from. Read
    /// before every quorum check.
    async fn relayer_set(&self) -> Result<Vec<Address>, SubmitError>;

    /// Check if the submitter is healthy.
    async fn health_check(&self) -> Result<bool>;
}
