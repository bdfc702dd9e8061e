//! qbridge-core
//!
//! Primitives shared bit-for-bit by the destination verifier and the off-chain
//! relay coordinator: domain-separated message digests, the balanced merkle
//! tree used for receipt inclusion proofs, the receipt envelope validator, the
//! ABI-style proof codec and secp256k1 signer recovery.
//!
//! Anything that feeds a digest lives here and only here. A coordinator that
//! hashes a message differently from the verifier does not get an error, it
//! gets signatures nobody will ever accept.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod chains;
pub mod digest;
pub mod encoding;
pub mod merkle;
pub mod receipt;
pub mod signature;

pub use chains::ChainId;
pub use digest::{checkpoint_digest, message_digest, proof_leaf_key, transfer_digest};
pub use encoding::{Bitmask, EncodedProof};
pub use merkle::{fold_proof, hash_pair, MerkleProof, MerkleTree, ZERO_HASH};
pub use receipt::{encode_receipt, receipt_leaf, validate_receipt};
pub use signature::{
    address_of, eth_signed_hash, recover_signer, sign_digest, signing_key_from_hex, RelayerSignature,
};

/// 32-byte Keccak-256 output used for digests, leaves and roots.
pub type Digest = [u8; 32];

// ═══════════════════════════════════════════════════════════════════════════════
// ERRORS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Structural rejection of a receipt or encoded proof.
    #[error("Invalid proof: {0}")]
    InvalidProof(String),

    #[error("merkle tree needs at least one leaf")]
    EmptyTree,

    /// A level that failed to shrink while building the tree. Never expected;
    /// surfaced instead of looping forever.
    #[error("merkle level {level} did not shrink (size {size})")]
    NonShrinkingLevel { level: usize, size: usize },

    #[error("leaf index {index} out of range for {leaves} leaves")]
    LeafIndexOutOfRange { index: usize, leaves: usize },

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("decoding error: {0}")]
    Decoding(String),
}

// ═══════════════════════════════════════════════════════════════════════════════
// IDENTITIES
// ═══════════════════════════════════════════════════════════════════════════════

/// 20-byte account identity (relayer, sender, target, token, recipient).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(pub [u8; 20]);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    /// Left-pad the address into a 32-byte ABI word.
    pub fn to_word(&self) -> [u8; 32] {
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(&self.0);
        word
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(raw).map_err(|e| CoreError::InvalidAddress(e.to_string()))?;
        let bytes: [u8; 20] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| CoreError::InvalidAddress(format!("expected 20 bytes, got {}", v.len())))?;
        Ok(Address(bytes))
    }
}

impl TryFrom<String> for Address {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_hex()
    }
}

impl From<[u8; 20]> for Address {
    fn from(bytes: [u8; 20]) -> Self {
        Address(bytes)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MESSAGES
// ═══════════════════════════════════════════════════════════════════════════════

/// Arbitrary call relayed from a source chain to a target on the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossChainMessage {
    pub nonce: u64,
    pub from_chain: ChainId,
    pub to_chain: ChainId,
    pub sender: Address,
    pub target: Address,
    /// Opaque call data; only its hash enters the digest.
    #[serde(with = "encoding::hex_bytes")]
    pub payload: Vec<u8>,
    pub value: u128,
}

impl CrossChainMessage {
    pub fn digest(&self) -> Digest {
        message_digest(self)
    }
}

/// Token lock on the source chain to be minted on the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTransferIntent {
    pub nonce: u64,
    pub from_chain: ChainId,
    pub to_chain: ChainId,
    pub sender: Address,
    pub token: Address,
    pub recipient: Address,
    pub amount: u128,
}

impl TokenTransferIntent {
    pub fn digest(&self) -> Digest {
        transfer_digest(self)
    }
}

/// The two message kinds the bridge carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Call,
    Transfer,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Call => f.write_str("call"),
            MessageKind::Transfer => f.write_str("transfer"),
        }
    }
}

/// A relayable message of either kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeMessage {
    Call(CrossChainMessage),
    Transfer(TokenTransferIntent),
}

impl BridgeMessage {
    /// Replay identity of the message. Identical for both acceptance paths.
    pub fn digest(&self) -> Digest {
        match self {
            BridgeMessage::Call(msg) => msg.digest(),
            BridgeMessage::Transfer(intent) => intent.digest(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            BridgeMessage::Call(_) => MessageKind::Call,
            BridgeMessage::Transfer(_) => MessageKind::Transfer,
        }
    }

    pub fn source(&self) -> ChainId {
        match self {
            BridgeMessage::Call(msg) => msg.from_chain,
            BridgeMessage::Transfer(intent) => intent.from_chain,
        }
    }

    pub fn destination(&self) -> ChainId {
        match self {
            BridgeMessage::Call(msg) => msg.to_chain,
            BridgeMessage::Transfer(intent) => intent.to_chain,
        }
    }

    pub fn nonce(&self) -> u64 {
        match self {
            BridgeMessage::Call(msg) => msg.nonce,
            BridgeMessage::Transfer(intent) => intent.nonce,
        }
    }
}

impl From<CrossChainMessage> for BridgeMessage {
    fn from(msg: CrossChainMessage) -> Self {
        BridgeMessage::Call(msg)
    }
}

impl From<TokenTransferIntent> for BridgeMessage {
    fn from(intent: TokenTransferIntent) -> Self {
        BridgeMessage::Transfer(intent)
    }
}

/// Render a digest the way logs and record file names show it.
pub fn digest_hex(digest: &Digest) -> String {
    format!("0x{}", hex::encode(digest))
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
