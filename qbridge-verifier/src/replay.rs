//! Replay guard
//!
//! One consumption ledger shared by both acceptance paths. A key is reserved
//! before the external effect runs and committed only after it succeeds, so a
//! reentrant call made from inside the effect already sees it as consumed.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use qbridge_core::{digest_hex, Digest};
use tracing::debug;

use crate::error::Rejection;

#[derive(Debug, Default)]
struct Ledger {
    consumed: HashSet<Digest>,
    reserved: HashSet<Digest>,
}

#[derive(Debug, Default)]
pub struct ReplayGuard {
    ledger: Mutex<Ledger>,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True once a key is committed, and while it is reserved.
    pub fn is_consumed(&self, key: &Digest) -> bool {
        let ledger = self.lock();
        ledger.consumed.contains(key) || ledger.reserved.contains(key)
    }

    /// Number of permanently consumed keys.
    pub fn consumed_count(&self) -> usize {
        self.lock().consumed.len()
    }

    /// Reserve every key or none of them.
    pub fn reserve(&self, keys: &[Digest]) -> Result<Reservation<'_>, Rejection> {
        let mut ledger = self.lock();
        if let Some(taken) = keys
            .iter()
            .find(|k| ledger.consumed.contains(*k) || ledger.reserved.contains(*k))
        {
            debug!(key = %digest_hex(taken), "replay rejected");
            return Err(Rejection::AlreadyConsumed { digest: *taken });
        }

        let mut held = Vec::with_capacity(keys.len());
        for key in keys {
            if ledger.reserved.insert(*key) {
                held.push(*key);
            }
        }

        Ok(Reservation {
            guard: self,
            keys: held,
            committed: false,
        })
    }
}

/// Keys held between verification and the end of the effect. Dropping the
/// reservation without committing releases them again.
#[derive(Debug)]
#[must_use = "dropping a reservation releases its keys"]
pub struct Reservation<'a> {
    guard: &'a ReplayGuard,
    keys: Vec<Digest>,
    committed: bool,
}

impl Reservation<'_> {
    pub fn keys(&self) -> &[Digest] {
        &self.keys
    }

    /// Mark every key permanently consumed.
    pub fn commit(mut self) {
        let mut ledger = self.guard.lock();
        for key in &self.keys {
            ledger.reserved.remove(key);
            ledger.consumed.insert(*key);
        }
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut ledger = self.guard.lock();
        for key in &self.keys {
            ledger.reserved.remove(key);
        }
        debug!(keys = self.keys.len(), "reservation released");
    }
}
