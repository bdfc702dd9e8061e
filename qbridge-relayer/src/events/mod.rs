//! Source-chain event observation.

#[cfg(feature = "evm")]
mod evm;

#[cfg(feature = "evm")]
pub use evm::EvmLogSource;

use async_trait::async_trait;
use qbridge_core::encoding::{hex_bytes, hex_digest};
use qbridge_core::{BridgeMessage, ChainId, Digest};
use qbridge_verifier::AcceptanceProof;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{RelayerError, Result};

/// Receipt inclusion proof that accompanies an observed event when the
/// source chain has been checkpointed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionEvidence {
    #[serde(with = "hex_digest")]
    pub header_id: Digest,
    #[serde(with = "hex_bytes")]
    pub encoded_proof: Vec<u8>,
}

impl InclusionEvidence {
    pub fn to_proof(&self) -> AcceptanceProof {
        AcceptanceProof::MerkleInclusion {
            header_id: self.header_id,
            encoded_proof: self.encoded_proof.clone(),
        }
    }
}

/// A bridge message seen on a source chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedEvent {
    pub source_chain: ChainId,
    pub message: BridgeMessage,
    pub block_number: u64,
    #[serde(with = "hex_digest")]
    pub tx_hash: Digest,
    pub evidence: Option<InclusionEvidence>,
}

/// Trait for source-chain event feeds.
#[async_trait]
pub trait EventSource: Send {
    fn source_chain(&self) -> ChainId;

    /// Wait for the next batch of events. Returns
    /// [`RelayerError::SourceClosed`] once the feed is exhausted.
    async fn next_events(&mut self) -> Result<Vec<ObservedEvent>>;
}

/// Event source fed through an mpsc channel.
#[derive(Debug)]
pub struct ChannelEventSource {
    chain: ChainId,
    receiver: mpsc::Receiver<ObservedEvent>,
}

impl ChannelEventSource {
    pub fn new(chain: ChainId, capacity: usize) -> (mpsc::Sender<ObservedEvent>, Self) {
        let (sender, receiver) = mpsc::channel(capacity);
        (sender, Self { chain, receiver })
    }
}

#[async_trait]
impl EventSource for ChannelEventSource {
    fn source_chain(&self) -> ChainId {
        self.chain
    }

    async fn next_events(&mut self) -> Result<Vec<ObservedEvent>> {
        let first = self.receiver.recv().await.ok_or(RelayerError::SourceClosed)?;
        let mut batch = vec![first];
        while let Ok(event) = self.receiver.try_recv() {
            batch.push(event);
        }
        Ok(batch)
    }
}
