//! EVM log source.
//!
//! Polls `eth_getLogs` on the source bridge contract for
//!
//! ```text
//! MessageSent(uint64 indexed nonce, uint64 toChain, address sender, address target, uint256 value, bytes payload)
//! TokensLocked(uint64 indexed nonce, uint64 toChain, address sender, address token, address recipient, uint256 amount)
//! ```
//!
//! and turns them into [`ObservedEvent`]s once they are `confirmations` deep.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token};
use ethers::prelude::*;
use ethers::types::{Address as EthAddress, Log, H256};
use qbridge_core::chains::known_chain;
use qbridge_core::{Address, BridgeMessage, ChainId, CrossChainMessage, TokenTransferIntent};
use tracing::{debug, info, warn};

use super::{EventSource, ObservedEvent};
use crate::error::{RelayerError, Result};

const MESSAGE_SENT: &str = "MessageSent(uint64,uint64,address,address,uint256,bytes)";
const TOKENS_LOCKED: &str = "TokensLocked(uint64,uint64,address,address,address,uint256)";

/// Polling `eth_getLogs` source for one chain.
pub struct EvmLogSource {
    chain: ChainId,
    provider: Provider<Http>,
    bridge: EthAddress,
    next_block: u64,
    confirmations: u64,
    poll_interval: Duration,
    message_sent: H256,
    tokens_locked: H256,
}

impl EvmLogSource {
    pub fn new(
        chain: ChainId,
        rpc_url: &str,
        bridge_address: &str,
        start_block: u64,
        poll_interval: Duration,
    ) -> anyhow::Result<Self> {
        let provider =
            Provider::<Http>::try_from(rpc_url).context("Failed to create HTTP provider")?;
        let bridge: EthAddress = bridge_address
            .parse()
            .context("Invalid bridge address")?;
        let confirmations = known_chain(chain).map_or(12, |info| info.confirmations);

        Ok(Self {
            chain,
            provider,
            bridge,
            next_block: start_block,
            confirmations,
            poll_interval,
            message_sent: H256::from(ethers::utils::keccak256(MESSAGE_SENT)),
            tokens_locked: H256::from(ethers::utils::keccak256(TOKENS_LOCKED)),
        })
    }

    fn decode(&self, log: &Log) -> Result<BridgeMessage> {
        let topic0 = log.topics.first().copied().unwrap_or_default();
        let nonce = log
            .topics
            .get(1)
            .map(|t| U256::from_big_endian(t.as_bytes()).low_u64())
            .ok_or_else(|| RelayerError::Source("missing nonce topic".into()))?;

        if topic0 == self.message_sent {
            let tokens = abi::decode(
                &[
                    ParamType::Uint(64),
                    ParamType::Address,
                    ParamType::Address,
                    ParamType::Uint(256),
                    ParamType::Bytes,
                ],
                &log.data,
            )
            .map_err(|e| RelayerError::Source(format!("MessageSent: {e}")))?;
            Ok(CrossChainMessage {
                nonce,
                from_chain: self.chain,
                to_chain: ChainId(uint(&tokens[0])?.low_u64()),
                sender: address(&tokens[1])?,
                target: address(&tokens[2])?,
                value: uint(&tokens[3])?.as_u128(),
                payload: tokens[4].clone().into_bytes().unwrap_or_default(),
            }
            .into())
        } else if topic0 == self.tokens_locked {
            let tokens = abi::decode(
                &[
                    ParamType::Uint(64),
                    ParamType::Address,
                    ParamType::Address,
                    ParamType::Address,
                    ParamType::Uint(256),
                ],
                &log.data,
            )
            .map_err(|e| RelayerError::Source(format!("TokensLocked: {e}")))?;
            Ok(TokenTransferIntent {
                nonce,
                from_chain: self.chain,
                to_chain: ChainId(uint(&tokens[0])?.low_u64()),
                sender: address(&tokens[1])?,
                token: address(&tokens[2])?,
                recipient: address(&tokens[3])?,
                amount: uint(&tokens[4])?.as_u128(),
            }
            .into())
        } else {
            Err(RelayerError::Source(format!("unexpected topic {topic0:?}")))
        }
    }
}

fn uint(token: &Token) -> Result<U256> {
    token
        .clone()
        .into_uint()
        .ok_or_else(|| RelayerError::Source("expected uint".into()))
}

fn address(token: &Token) -> Result<Address> {
    token
        .clone()
        .into_address()
        .map(|a| Address(a.0))
        .ok_or_else(|| RelayerError::Source("expected address".into()))
}

#[async_trait]
impl EventSource for EvmLogSource {
    fn source_chain(&self) -> ChainId {
        self.chain
    }

    async fn next_events(&mut self) -> Result<Vec<ObservedEvent>> {
        loop {
            let head = self
                .provider
                .get_block_number()
                .await
                .map_err(|e| RelayerError::Source(e.to_string()))?
                .as_u64();
            let safe = head.saturating_sub(self.confirmations);
            if safe < self.next_block {
                tokio::time::sleep(self.poll_interval).await;
                continue;
            }

            let filter = Filter::new()
                .address(self.bridge)
                .from_block(self.next_block)
                .to_block(safe)
                .topic0(vec![self.message_sent, self.tokens_locked]);
            let logs = self
                .provider
                .get_logs(&filter)
                .await
                .map_err(|e| RelayerError::Source(e.to_string()))?;
            debug!(chain = %self.chain, from = self.next_block, to = safe, logs = logs.len(), "polled logs");
            self.next_block = safe + 1;

            let mut events = Vec::with_capacity(logs.len());
            for log in &logs {
                match self.decode(log) {
                    Ok(message) => events.push(ObservedEvent {
                        source_chain: self.chain,
                        message,
                        block_number: log.block_number.map_or(safe, |n| n.as_u64()),
                        tx_hash: log.transaction_hash.map(|h| h.0).unwrap_or_default(),
                        evidence: None,
                    }),
                    Err(e) => warn!(chain = %self.chain, error = %e, "skipping undecodable log"),
                }
            }
            if !events.is_empty() {
                info!(chain = %self.chain, count = events.len(), "observed bridge events");
                return Ok(events);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
