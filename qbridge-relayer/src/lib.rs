//! qbridge-relayer
//!
//! Relay coordinator that carries bridge messages from source chains to
//! destination gateways.
//!
//! Architecture:
//! 1. Observe bridge events on each source chain
//! 2. Sign the message digest and publish the signature to a shared pool
//! 3. Elect a leader per destination chain through a time-bounded lease
//! 4. The leader locks the digest and submits it with bounded retries
//!
//! Coordination state lives in a shared directory of small JSON records, so
//! independent processes observe each other's progress without talking to
//! one another.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod lease;
pub mod lock;
pub mod pool;
pub mod retry;
pub mod store;
pub mod submitters;
pub mod task;

pub use config::{ChainEndpoint, ProofMode, RelayerConfig};
pub use coordinator::{Coordinator, Progress, SweepReport};
pub use error::{RelayerError, SubmitError};
pub use events::{ChannelEventSource, EventSource, InclusionEvidence, ObservedEvent};
pub use lease::{LeaderLease, LeaseManager};
pub use lock::{MessageLock, MessageLocks};
pub use pool::{PoolRecord, SignaturePool};
pub use retry::RetryPolicy;
pub use store::{FailureLog, FailureRecord, StateDir};
pub use submitters::{LocalSubmitter, SubmissionReceipt, SubmissionRequest, Submitter};
pub use task::{SubmissionTask, TaskOutcome, TaskState};

#[cfg(feature = "evm")]
pub use events::EvmLogSource;
#[cfg(feature = "evm")]
pub use submitters::EvmSubmitter;
