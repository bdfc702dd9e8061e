//! In-process submitter.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use qbridge_core::{digest_hex, Address, ChainId, Digest};
use qbridge_verifier::BridgeGateway;
use tracing::info;

use super::{SubmissionReceipt, SubmissionRequest, Submitter};
use crate::error::SubmitError;

/// Delivers straight into a [`BridgeGateway`] living in the same process.
#[derive(Debug, Clone)]
pub struct LocalSubmitter {
    gateway: Arc<BridgeGateway>,
}

impl LocalSubmitter {
    pub fn new(gateway: Arc<BridgeGateway>) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &Arc<BridgeGateway> {
        &self.gateway
    }
}

#[async_trait]
impl Submitter for LocalSubmitter {
    fn destination(&self) -> ChainId {
        self.gateway.chain_id()
    }

    async fn submit(&self, request: &SubmissionRequest) -> Result<SubmissionReceipt, SubmitError> {
        let acceptance = self.gateway.accept(&request.message, &request.proof)?;
        info!(
            digest = %digest_hex(&acceptance.digest),
            destination = %self.gateway.chain_id(),
            path = ?acceptance.path,
            "delivered to local gateway"
        );
        Ok(SubmissionReceipt {
            digest: acceptance.digest,
            path: acceptance.path,
            tx_hash: None,
        })
    }

    async fn is_delivered(&self, digest: &Digest) -> Result<bool, SubmitError> {
        Ok(self.gateway.is_consumed(digest))
    }

    async fn relayer_set(&self) -> Result<Vec<Address>, SubmitError> {
        Ok(self.gateway.active_relayers())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::SigningKey;
    use qbridge_core::{address_of, sign_digest, BridgeMessage, TokenTransferIntent};
    use qbridge_verifier::{AcceptanceProof, BridgeRegistry, InMemoryLedger, Rejection};

    #[tokio::test]
    async fn test_local_submitter_delivers_once() {
        let key = SigningKey::from_slice(&[1; 32]).unwrap();
        let registry = Arc::new(BridgeRegistry::new(0));
        registry.register_relayer(address_of(key.verifying_key()), 0).unwrap();
        registry.enable_chain(ChainId(1));
        registry.enable_chain(ChainId(10));
        registry.allow_token(ChainId(10), Address([2; 20]));
        let ledger = Arc::new(InMemoryLedger::new());
        let gateway = Arc::new(BridgeGateway::new(ChainId(10), registry, ledger.clone()));
        let submitter = LocalSubmitter::new(gateway);

        let message: BridgeMessage = TokenTransferIntent {
            nonce: 1,
            from_chain: ChainId(1),
            to_chain: ChainId(10),
            sender: Address([1; 20]),
            token: Address([2; 20]),
            recipient: Address([3; 20]),
            amount: 50,
        }
        .into();
        let digest = message.digest();
        let request = SubmissionRequest {
            proof: AcceptanceProof::SignatureQuorum {
                signatures: vec![sign_digest(&key, &digest).unwrap()],
            },
            message,
        };

        assert_eq!(
            submitter.relayer_set().await.unwrap(),
            vec![address_of(key.verifying_key())]
        );
        assert!(!submitter.is_delivered(&digest).await.unwrap());
        let receipt = submitter.submit(&request).await.unwrap();
        assert_eq!(receipt.digest, digest);
        assert!(submitter.is_delivered(&digest).await.unwrap());

        let err = submitter.submit(&request).await.unwrap_err();
        assert_eq!(err, SubmitError::Rejected(Rejection::AlreadyConsumed { digest }));
        assert!(err.is_delivered());
        assert_eq!(ledger.balance_of(&Address([2; 20]), &Address([3; 20])), 50);
        assert_eq!(submitter.destination(), ChainId(10));
    }
}
