//! Error types for the relay coordinator.

use std::path::PathBuf;

use qbridge_core::{ChainId, CoreError};
use qbridge_verifier::Rejection;
use thiserror::Error;

/// Coordinator-side failures. Submission failures have their own type.
#[derive(Error, Debug)]
pub enum RelayerError {
    /// State directory I/O.
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A durable record that does not parse.
    #[error("corrupt record {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    /// Event source failure (RPC, decoding).
    #[error("event source error: {0}")]
    Source(String),

    /// The destination's relayer set could not be read.
    #[error("relayer set of chain {chain} unavailable: {source}")]
    Membership {
        chain: ChainId,
        #[source]
        source: SubmitError,
    },

    /// The event source has no more events.
    #[error("event source closed")]
    SourceClosed,
}

impl RelayerError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RelayerError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<config::ConfigError> for RelayerError {
    fn from(err: config::ConfigError) -> Self {
        RelayerError::Config(err.to_string())
    }
}

/// Outcome of a failed submission attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// The destination verifier turned the submission down.
    #[error("rejected: {0}")]
    Rejected(Rejection),

    /// RPC failure, timeout or a revert the destination did not explain.
    #[error("transient: {0}")]
    Transient(String),
}

impl SubmitError {
    /// A replay rejection means the message is already delivered.
    pub fn is_delivered(&self) -> bool {
        matches!(self, SubmitError::Rejected(rejection) if rejection.is_replay())
    }
}

impl From<Rejection> for SubmitError {
    fn from(rejection: Rejection) -> Self {
        SubmitError::Rejected(rejection)
    }
}

pub type Result<T, E = RelayerError> = std::result::Result<T, E>;
