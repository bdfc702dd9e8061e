//! Destination gateway
//!
//! Entry point for relayed messages. Both acceptance paths run the same
//! pipeline: allowlist checks, a replay pre-check on the message digest, proof
//! verification, reservation of the replay keys, the external effect, then
//! commit. A failing effect drops the reservation and nothing is consumed.

use std::sync::{Arc, Mutex, PoisonError};

use qbridge_core::encoding::{hex_bytes, hex_digest};
use qbridge_core::{
    digest_hex, proof_leaf_key, Address, BridgeMessage, ChainId, Digest, MessageKind,
    RelayerSignature,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::checkpoint::LightClient;
use crate::effects::BridgeEffects;
use crate::error::Rejection;
use crate::quorum::QuorumVerifier;
use crate::registry::ConfigRegistry;
use crate::replay::ReplayGuard;

/// Evidence that a message happened on its source chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AcceptanceProof {
    SignatureQuorum {
        signatures: Vec<RelayerSignature>,
    },
    MerkleInclusion {
        #[serde(with = "hex_digest")]
        header_id: Digest,
        #[serde(with = "hex_bytes")]
        encoded_proof: Vec<u8>,
    },
}

impl AcceptanceProof {
    pub fn path(&self) -> AcceptancePath {
        match self {
            AcceptanceProof::SignatureQuorum { .. } => AcceptancePath::SignatureQuorum,
            AcceptanceProof::MerkleInclusion { .. } => AcceptancePath::MerkleInclusion,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptancePath {
    SignatureQuorum,
    MerkleInclusion,
}

/// Result of a successful acceptance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acceptance {
    pub digest: Digest,
    pub kind: MessageKind,
    pub path: AcceptancePath,
    /// Recovered signers on the quorum path.
    pub signers: Vec<Address>,
    /// Receipt leaf on the inclusion path.
    pub leaf: Option<Digest>,
}

/// Emitted once per accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumptionEvent {
    #[serde(with = "hex_digest")]
    pub digest: Digest,
    pub kind: MessageKind,
    pub path: AcceptancePath,
    pub source_chain: ChainId,
    pub nonce: u64,
}

pub struct BridgeGateway {
    chain_id: ChainId,
    registry: Arc<dyn ConfigRegistry>,
    effects: Arc<dyn BridgeEffects>,
    light_client: Option<Arc<dyn LightClient>>,
    replay: ReplayGuard,
    events: Mutex<Vec<ConsumptionEvent>>,
}

impl BridgeGateway {
    pub fn new(
        chain_id: ChainId,
        registry: Arc<dyn ConfigRegistry>,
        effects: Arc<dyn BridgeEffects>,
    ) -> Self {
        Self {
            chain_id,
            registry,
            effects,
            light_client: None,
            replay: ReplayGuard::new(),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Light client used by [`BridgeGateway::accept`] for inclusion proofs.
    pub fn with_light_client(mut self, light_client: Arc<dyn LightClient>) -> Self {
        self.light_client = Some(light_client);
        self
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn replay_guard(&self) -> &ReplayGuard {
        &self.replay
    }

    pub fn is_consumed(&self, digest: &Digest) -> bool {
        self.replay.is_consumed(digest)
    }

    /// Relayers whose signatures currently count, read from the registry.
    pub fn active_relayers(&self) -> Vec<Address> {
        self.registry.active_relayers()
    }

    /// Dispatch on the proof variant.
    pub fn accept(
        &self,
        message: &BridgeMessage,
        proof: &AcceptanceProof,
    ) -> Result<Acceptance, Rejection> {
        match proof {
            AcceptanceProof::SignatureQuorum { signatures } => {
                self.accept_with_signatures(message, signatures)
            }
            AcceptanceProof::MerkleInclusion {
                header_id,
                encoded_proof,
            } => {
                let light_client = self.light_client.as_deref().ok_or_else(|| {
                    Rejection::InvalidProof("no light client configured".into())
                })?;
                self.accept_with_proof(message, header_id, encoded_proof, light_client)
            }
        }
    }

    /// Accept a message attested by a relayer quorum.
    pub fn accept_with_signatures(
        &self,
        message: &BridgeMessage,
        signatures: &[RelayerSignature],
    ) -> Result<Acceptance, Rejection> {
        let digest = self.precheck(message)?;
        let signers = QuorumVerifier::verify(&*self.registry, &digest, signatures)
            .inspect_err(|reason| warn!(digest = %digest_hex(&digest), %reason, "quorum rejected"))?;

        self.consume(message, digest, &[digest], AcceptancePath::SignatureQuorum)?;
        Ok(Acceptance {
            digest,
            kind: message.kind(),
            path: AcceptancePath::SignatureQuorum,
            signers,
            leaf: None,
        })
    }

    /// Accept a message backed by a receipt included under a checkpointed
    /// root. The message digest and the receipt leaf are consumed together.
    pub fn accept_with_proof(
        &self,
        message: &BridgeMessage,
        header_id: &Digest,
        encoded_proof: &[u8],
        light_client: &dyn LightClient,
    ) -> Result<Acceptance, Rejection> {
        let digest = self.precheck(message)?;
        let leaf = light_client
            .verify_inclusion(header_id, encoded_proof)
            .inspect_err(|reason| warn!(digest = %digest_hex(&digest), %reason, "proof rejected"))?;

        let leaf_key = proof_leaf_key(self.chain_id, &leaf);
        self.consume(message, digest, &[digest, leaf_key], AcceptancePath::MerkleInclusion)?;
        Ok(Acceptance {
            digest,
            kind: message.kind(),
            path: AcceptancePath::MerkleInclusion,
            signers: Vec::new(),
            leaf: Some(leaf),
        })
    }

    /// Events for every acceptance since the last drain.
    pub fn drain_events(&self) -> Vec<ConsumptionEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn precheck(&self, message: &BridgeMessage) -> Result<Digest, Rejection> {
        let destination = message.destination();
        if destination != self.chain_id {
            return Err(Rejection::WrongDestination {
                expected: self.chain_id,
                got: destination,
            });
        }
        for chain in [destination, message.source()] {
            if !self.registry.is_chain_enabled(chain) {
                return Err(Rejection::ChainDisabled(chain));
            }
        }
        if let BridgeMessage::Transfer(intent) = message {
            if !self.registry.is_token_supported(destination, &intent.token) {
                return Err(Rejection::TokenNotSupported {
                    chain: destination,
                    token: intent.token,
                });
            }
        }

        let digest = message.digest();
        if self.replay.is_consumed(&digest) {
            return Err(Rejection::AlreadyConsumed { digest });
        }
        Ok(digest)
    }

    fn consume(
        &self,
        message: &BridgeMessage,
        digest: Digest,
        keys: &[Digest],
        path: AcceptancePath,
    ) -> Result<(), Rejection> {
        let reservation = self.replay.reserve(keys)?;

        let effect = match message {
            BridgeMessage::Call(call) => self.effects.execute(&call.target, &call.payload, call.value),
            BridgeMessage::Transfer(intent) => {
                self.effects
                    .mint(&intent.token, &intent.recipient, intent.amount)
            }
        };
        if let Err(err) = effect {
            warn!(digest = %digest_hex(&digest), error = %err, "effect failed, acceptance reverted");
            return Err(Rejection::EffectFailed(err.to_string()));
        }

        reservation.commit();
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ConsumptionEvent {
                digest,
                kind: message.kind(),
                path,
                source_chain: message.source(),
                nonce: message.nonce(),
            });
        info!(
            digest = %digest_hex(&digest),
            kind = %message.kind(),
            source = %message.source(),
            ?path,
            "message accepted"
        );
        Ok(())
    }
}

impl std::fmt::Debug for BridgeGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeGateway")
            .field("chain_id", &self.chain_id)
            .field("consumed", &self.replay.consumed_count())
            .finish_non_exhaustive()
    }
}
