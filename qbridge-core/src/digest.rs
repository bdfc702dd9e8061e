//! Domain-separated digests
//!
//! Every digest starts with the keccak of a per-kind domain tag, then each
//! semantic field as a 32-byte ABI word. Variable-length payloads contribute
//! their own hash, never their raw bytes, so a payload cannot be truncated or
//! extended without moving the digest.

use sha3::{Digest as _, Keccak256};

use crate::encoding::{u128_word, u64_word};
use crate::{ChainId, CrossChainMessage, Digest, TokenTransferIntent};

/// Domain tag for arbitrary cross-chain calls.
pub const MESSAGE_DOMAIN: &[u8] = b"qbridge.message.v1";
/// Domain tag for token transfer intents.
pub const TRANSFER_DOMAIN: &[u8] = b"qbridge.token_transfer.v1";
/// Domain tag for validator-signed checkpoints.
pub const CHECKPOINT_DOMAIN: &[u8] = b"qbridge.checkpoint.v1";
/// Domain tag for receipt leaves consumed through the inclusion path.
pub const PROOF_LEAF_DOMAIN: &[u8] = b"qbridge.proof_leaf.v1";

/// Plain Keccak-256.
pub fn keccak256(data: impl AsRef<[u8]>) -> Digest {
    Keccak256::digest(data.as_ref()).into()
}

fn domain_hasher(tag: &[u8]) -> Keccak256 {
    let mut hasher = Keccak256::new();
    hasher.update(keccak256(tag));
    hasher
}

/// Digest of a cross-chain call.
pub fn message_digest(msg: &CrossChainMessage) -> Digest {
    let mut hasher = domain_hasher(MESSAGE_DOMAIN);
    hasher.update(u64_word(msg.nonce));
    hasher.update(msg.from_chain.to_word());
    hasher.update(msg.to_chain.to_word());
    hasher.update(msg.sender.to_word());
    hasher.update(msg.target.to_word());
    hasher.update(keccak256(&msg.payload));
    hasher.update(u128_word(msg.value));
    hasher.finalize().into()
}

/// Digest of a token transfer intent.
pub fn transfer_digest(intent: &TokenTransferIntent) -> Digest {
    let mut hasher = domain_hasher(TRANSFER_DOMAIN);
    hasher.update(u64_word(intent.nonce));
    hasher.update(intent.from_chain.to_word());
    hasher.update(intent.to_chain.to_word());
    hasher.update(intent.sender.to_word());
    hasher.update(intent.token.to_word());
    hasher.update(intent.recipient.to_word());
    hasher.update(u128_word(intent.amount));
    hasher.finalize().into()
}

/// Digest validators sign to authorize a checkpoint.
pub fn checkpoint_digest(
    source_chain: ChainId,
    height: u64,
    header_id: &Digest,
    accepted_root: &Digest,
) -> Digest {
    let mut hasher = domain_hasher(CHECKPOINT_DOMAIN);
    hasher.update(source_chain.to_word());
    hasher.update(u64_word(height));
    hasher.update(header_id);
    hasher.update(accepted_root);
    hasher.finalize().into()
}

/// Replay key for a receipt leaf accepted on `to_chain`. Lives in its own
/// domain so it can never equal a message digest.
pub fn proof_leaf_key(to_chain: ChainId, leaf: &Digest) -> Digest {
    let mut hasher = domain_hasher(PROOF_LEAF_DOMAIN);
    hasher.update(to_chain.to_word());
    hasher.update(leaf);
    hasher.finalize().into()
}
