//! qbridge-verifier
//!
//! Destination-side acceptance of relayed messages. A message is accepted at
//! most once, either on a quorum of relayer signatures or on a receipt
//! inclusion proof against a checkpointed root, and only then is its effect
//! (mint or call) performed.
//!
//! Everything here is synchronous and local: a rejection is final and carries
//! a reason, retrying is left to the relay coordinator.

pub mod checkpoint;
pub mod effects;
pub mod error;
pub mod gateway;
pub mod inclusion;
pub mod quorum;
pub mod registry;
pub mod replay;

pub use checkpoint::{Checkpoint, CheckpointHeader, CheckpointStore, LightClient, SubmitterPolicy};
pub use effects::{BridgeEffects, ExecutedCall, InMemoryLedger};
pub use error::{Rejection, VerifierError};
pub use gateway::{Acceptance, AcceptancePath, AcceptanceProof, BridgeGateway, ConsumptionEvent};
pub use inclusion::{verify_encoded, verify_inclusion};
pub use quorum::QuorumVerifier;
pub use registry::{quorum_threshold, BridgeRegistry, ConfigRegistry, Membership, ValidatorSet};
pub use replay::{ReplayGuard, Reservation};
