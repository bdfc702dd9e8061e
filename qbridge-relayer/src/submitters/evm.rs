//! EVM chain submitter.

use anyhow::{Context, Result};
use async_trait::async_trait;
use ethers::{
    abi::{ParamType, Token},
    prelude::*,
    types::{transaction::eip2718::TypedTransaction, Address as EthAddress, Bytes, U256},
};
use qbridge_core::{digest_hex, Address, BridgeMessage, ChainId, Digest};
use qbridge_verifier::{AcceptanceProof, Rejection};
use std::sync::Arc;
use tracing::{debug, info};

use super::{SubmissionReceipt, SubmissionRequest, Submitter};
use crate::error::SubmitError;

const CALL_TUPLE: &str = "(uint64,uint64,uint64,address,address,bytes,uint256)";
const TRANSFER_TUPLE: &str = "(uint64,uint64,uint64,address,address,address,uint256)";

/// EVM chain submitter.
pub struct EvmSubmitter {
    destination: ChainId,
    client: Arc<SignerMiddleware<Provider<Http>, LocalWallet>>,
    bridge_address: EthAddress,
}

impl EvmSubmitter {
    pub fn new(
        destination: ChainId,
        rpc_url: &str,
        bridge_address: &str,
        private_key: &str,
    ) -> Result<Self> {
        let provider =
            Provider::<Http>::try_from(rpc_url).context("Failed to create HTTP provider")?;

        let wallet = private_key
            .trim_start_matches("0x")
            .parse::<LocalWallet>()
            .context("Invalid private key")?
            .with_chain_id(destination.as_u64());

        let client = SignerMiddleware::new(provider, wallet);

        let bridge_address: EthAddress = bridge_address
            .parse()
            .context("Invalid bridge address")?;

        Ok(Self {
            destination,
            client: Arc::new(client),
            bridge_address,
        })
    }

    fn calldata(request: &SubmissionRequest) -> Vec<u8> {
        let (tuple, message) = match &request.message {
            BridgeMessage::Call(msg) => (
                CALL_TUPLE,
                Token::Tuple(vec![
                    Token::Uint(U256::from(msg.nonce)),
                    Token::Uint(U256::from(msg.from_chain.as_u64())),
                    Token::Uint(U256::from(msg.to_chain.as_u64())),
                    address_token(&msg.sender),
                    address_token(&msg.target),
                    Token::Bytes(msg.payload.clone()),
                    Token::Uint(U256::from(msg.value)),
                ]),
            ),
            BridgeMessage::Transfer(intent) => (
                TRANSFER_TUPLE,
                Token::Tuple(vec![
                    Token::Uint(U256::from(intent.nonce)),
                    Token::Uint(U256::from(intent.from_chain.as_u64())),
                    Token::Uint(U256::from(intent.to_chain.as_u64())),
                    address_token(&intent.sender),
                    address_token(&intent.token),
                    address_token(&intent.recipient),
                    Token::Uint(U256::from(intent.amount)),
                ]),
            ),
        };
        let name = match &request.message {
            BridgeMessage::Call(_) => "receiveMessage",
            BridgeMessage::Transfer(_) => "receiveTokens",
        };

        let (signature, args) = match &request.proof {
            AcceptanceProof::SignatureQuorum { signatures } => (
                format!("{name}({tuple},bytes[])"),
                vec![
                    message,
                    Token::Array(
                        signatures
                            .iter()
                            .map(|s| Token::Bytes(s.as_bytes().to_vec()))
                            .collect(),
                    ),
                ],
            ),
            AcceptanceProof::MerkleInclusion {
                header_id,
                encoded_proof,
            } => (
                format!("{name}WithProof({tuple},bytes32,bytes)"),
                vec![
                    message,
                    Token::FixedBytes(header_id.to_vec()),
                    Token::Bytes(encoded_proof.clone()),
                ],
            ),
        };

        let selector = &ethers::utils::keccak256(signature.as_bytes())[..4];
        let mut calldata = selector.to_vec();
        calldata.extend_from_slice(&ethers::abi::encode(&args));
        calldata
    }
}

fn address_token(address: &Address) -> Token {
    Token::Address(EthAddress::from(address.0))
}

/// Decode the `address[]` returned by `activeRelayers()`.
fn decode_relayers(output: &[u8]) -> Result<Vec<Address>, SubmitError> {
    let tokens = ethers::abi::decode(&[ParamType::Array(Box::new(ParamType::Address))], output)
        .map_err(|e| SubmitError::Transient(format!("bad activeRelayers() output: {e}")))?;
    let Some(Token::Array(items)) = tokens.into_iter().next() else {
        return Err(SubmitError::Transient("activeRelayers() returned no array".into()));
    };
    items
        .into_iter()
        .map(|item| match item {
            Token::Address(addr) => Ok(Address(addr.0)),
            other => Err(SubmitError::Transient(format!("unexpected relayer entry {other:?}"))),
        })
        .collect()
}

/// Revert reasons the bridge contract uses for replays surface as
/// rejections, everything else is worth retrying.
fn classify(digest: Digest, err: impl std::fmt::Display) -> SubmitError {
    let message = err.to_string();
    if message.contains("already consumed") {
        SubmitError::Rejected(Rejection::AlreadyConsumed { digest })
    } else {
        SubmitError::Transient(message)
    }
}

#[async_trait]
impl Submitter for EvmSubmitter {
    fn destination(&self) -> ChainId {
        self.destination
    }

    async fn submit(&self, request: &SubmissionRequest) -> Result<SubmissionReceipt, SubmitError> {
        let digest = request.digest();
        info!(
            digest = %digest_hex(&digest),
            destination = %self.destination,
            path = ?request.proof.path(),
            "Submitting message to EVM"
        );

        let tx = TransactionRequest::new()
            .to(self.bridge_address)
            .data(Bytes::from(Self::calldata(request)))
            .gas(500_000u64);

        debug!("Sending transaction to bridge at {:?}", self.bridge_address);

        let pending_tx = self
            .client
            .send_transaction(tx, None)
            .await
            .map_err(|e| classify(digest, e))?;
        let tx_hash = pending_tx.tx_hash();

        info!("Transaction submitted: {:?}", tx_hash);

        // Wait for confirmation
        let receipt = pending_tx
            .await
            .map_err(|e| classify(digest, e))?
            .ok_or_else(|| SubmitError::Transient("transaction dropped".into()))?;
        if receipt.status != Some(U64::from(1)) {
            return Err(SubmitError::Transient(format!(
                "transaction {:?} reverted",
                receipt.transaction_hash
            )));
        }

        Ok(SubmissionReceipt {
            digest,
            path: request.proof.path(),
            tx_hash: Some(format!("{:?}", receipt.transaction_hash)),
        })
    }

    async fn is_delivered(&self, digest: &Digest) -> Result<bool, SubmitError> {
        let selector = &ethers::utils::keccak256("consumed(bytes32)")[..4];
        let mut calldata = selector.to_vec();
        calldata.extend_from_slice(digest);

        let tx: TypedTransaction = TransactionRequest::new()
            .to(self.bridge_address)
            .data(Bytes::from(calldata))
            .into();
        let output = self
            .client
            .call(&tx, None)
            .await
            .map_err(|e| SubmitError::Transient(e.to_string()))?;
        Ok(output.last().is_some_and(|b| *b == 1))
    }

    async fn relayer_set(&self) -> Result<Vec<Address>, SubmitError> {
        let selector = &ethers::utils::keccak256("activeRelayers()")[..4];
        let tx: TypedTransaction = TransactionRequest::new()
            .to(self.bridge_address)
            .data(Bytes::from(selector.to_vec()))
            .into();
        let output = self
            .client
            .call(&tx, None)
            .await
            .map_err(|e| SubmitError::Transient(e.to_string()))?;
        let relayers = decode_relayers(&output)?;
        debug!(destination = %self.destination, count = relayers.len(), "read relayer set");
        Ok(relayers)
    }

    async fn health_check(&self) -> Result<bool> {
        let block = self.client.get_block_number().await?;
        debug!("EVM health check: block {}", block);
        Ok(true)
    }
}
