//! Per-destination leader lease.
//!
//! A lease is a plain record: whoever wrote the unexpired record is the
//! leader for that destination chain. Acquisition is check-then-write followed
//! by a read-back, which narrows but does not close the window in which two
//! processes both believe they lead. Duplicate submissions that slip through
//! are absorbed by the destination replay guard.

use std::time::Duration;

use qbridge_core::{Address, ChainId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{RelayerError, Result};
use crate::store::{now_ms, read_json, remove_record, write_json, StateDir};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderLease {
    pub chain: ChainId,
    pub holder: Address,
    pub acquired_at_ms: u64,
    pub expires_at_ms: u64,
}

impl LeaderLease {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }

    pub fn is_held_by(&self, identity: &Address) -> bool {
        self.holder == *identity
    }
}

/// Acquires and renews leases on behalf of one relayer identity.
#[derive(Debug, Clone)]
pub struct LeaseManager {
    dir: StateDir,
    identity: Address,
    ttl: Duration,
}

impl LeaseManager {
    pub fn new(dir: StateDir, identity: Address, ttl: Duration) -> Self {
        Self { dir, identity, ttl }
    }

    pub fn identity(&self) -> Address {
        self.identity
    }

    /// The lease currently on record, expired or not. A record that does not
    /// parse is reported as absent so it can be overwritten.
    pub fn current(&self, chain: ChainId) -> Result<Option<LeaderLease>> {
        match read_json(&self.dir.lease_path(chain)) {
            Err(RelayerError::Corrupt { path, source }) => {
                warn!(path = %path.display(), error = %source, "corrupt lease record");
                Ok(None)
            }
            other => other,
        }
    }

    /// Become (or stay) leader for `chain` unless someone else holds an
    /// unexpired lease.
    pub fn try_acquire(&self, chain: ChainId) -> Result<bool> {
        self.try_acquire_at(chain, now_ms())
    }

    pub fn try_acquire_at(&self, chain: ChainId, now_ms: u64) -> Result<bool> {
        let acquired_at_ms = match self.current(chain)? {
            Some(lease) if !lease.is_expired(now_ms) && !lease.is_held_by(&self.identity) => {
                debug!(%chain, holder = %lease.holder, "lease held by peer");
                return Ok(false);
            }
            Some(lease) if !lease.is_expired(now_ms) => lease.acquired_at_ms,
            Some(lease) => {
                if !lease.is_held_by(&self.identity) {
                    info!(%chain, previous = %lease.holder, "taking over expired lease");
                }
                now_ms
            }
            None => now_ms,
        };

        self.write_and_confirm(chain, acquired_at_ms, now_ms)
    }

    /// Extend our own lease. Returns false if a peer has taken it over.
    pub fn renew(&self, chain: ChainId) -> Result<bool> {
        self.renew_at(chain, now_ms())
    }

    pub fn renew_at(&self, chain: ChainId, now_ms: u64) -> Result<bool> {
        match self.current(chain)? {
            Some(lease) if lease.is_held_by(&self.identity) => {
                self.write_and_confirm(chain, lease.acquired_at_ms, now_ms)
            }
            Some(_) => Ok(false),
            None => self.try_acquire_at(chain, now_ms),
        }
    }

    /// Drop our lease so a peer can take over without waiting for expiry.
    pub fn release(&self, chain: ChainId) -> Result<bool> {
        match self.current(chain)? {
            Some(lease) if lease.is_held_by(&self.identity) => {
                remove_record(&self.dir.lease_path(chain))
            }
            _ => Ok(false),
        }
    }

    fn write_and_confirm(&self, chain: ChainId, acquired_at_ms: u64, now_ms: u64) -> Result<bool> {
        let lease = LeaderLease {
            chain,
            holder: self.identity,
            acquired_at_ms,
            expires_at_ms: now_ms.saturating_add(self.ttl.as_millis() as u64),
        };
        write_json(&self.dir.lease_path(chain), &lease)?;

        // A peer that wrote after us wins.
        let confirmed = self
            .current(chain)?
            .is_some_and(|l| l.is_held_by(&self.identity));
        if !confirmed {
            debug!(%chain, "lease lost on read-back");
        }
        Ok(confirmed)
    }
}
