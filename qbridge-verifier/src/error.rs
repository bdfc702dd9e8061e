//! Error types for the destination verifier.

use qbridge_core::{Address, ChainId, CoreError, Digest};
use thiserror::Error;

fn hex32(digest: &Digest) -> String {
    qbridge_core::digest_hex(digest)
}

/// Why a submission was turned away. Every rejection is final for the
/// verifier; retrying is the coordinator's business.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Fewer signatures than the live threshold.
    #[error("not enough signatures")]
    NotEnoughSignatures { got: usize, required: usize },

    /// A signature that does not recover to an active member.
    #[error("invalid signer")]
    InvalidSigner { index: usize },

    /// Two signatures recovered to the same member.
    #[error("duplicate signature")]
    DuplicateSignature { signer: Address },

    /// Malformed receipt or encoded proof, unknown header, or root mismatch.
    #[error("Invalid proof: {0}")]
    InvalidProof(String),

    /// Replay guard hit. Kept apart from integrity failures.
    #[error("already consumed: {}", hex32(.digest))]
    AlreadyConsumed { digest: Digest },

    #[error("chain not enabled: {0}")]
    ChainDisabled(ChainId),

    #[error("token {token} not supported on chain {chain}")]
    TokenNotSupported { chain: ChainId, token: Address },

    #[error("message for chain {got} delivered to chain {expected}")]
    WrongDestination { expected: ChainId, got: ChainId },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("checkpoint conflict for header {}", hex32(.header_id))]
    CheckpointConflict { header_id: Digest },

    /// The external effect failed; nothing was consumed.
    #[error("effect failed: {0}")]
    EffectFailed(String),
}

impl Rejection {
    /// Replay rejections mean the message already landed.
    pub fn is_replay(&self) -> bool {
        matches!(self, Rejection::AlreadyConsumed { .. })
    }
}

impl From<CoreError> for Rejection {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidProof(reason) => Rejection::InvalidProof(reason),
            other => Rejection::InvalidProof(other.to_string()),
        }
    }
}

/// Errors from administrative operations and effect collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifierError {
    #[error("stake {stake} below minimum {minimum}")]
    InsufficientStake { stake: u128, minimum: u128 },

    #[error("unknown relayer: {0}")]
    UnknownRelayer(Address),

    #[error("effect error: {0}")]
    Effect(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}
