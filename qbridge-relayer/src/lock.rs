//! Per-message submission lock.
//!
//! Held by the leader while it submits one digest. Created with create-new
//! semantics so only one process can hold a fresh lock; a lock older than the
//! TTL belongs to a process that died and may be reclaimed by anyone.
//!
//! Replacing a stale lock is a remove followed by a create, so it happens
//! under a second create-new file (`<digest>.reclaim`). Only the process
//! holding that file may remove the lock, and it re-checks staleness first.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

use qbridge_core::encoding::hex_digest;
use qbridge_core::{digest_hex, Address, Digest};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{RelayerError, Result};
use crate::store::{now_ms, read_json, remove_record, StateDir};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageLock {
    #[serde(with = "hex_digest")]
    pub digest: Digest,
    pub holder: Address,
    pub acquired_at_ms: u64,
}

#[derive(Debug, Clone)]
pub struct MessageLocks {
    dir: StateDir,
    identity: Address,
    ttl: Duration,
}

impl MessageLocks {
    pub fn new(dir: StateDir, identity: Address, ttl: Duration) -> Self {
        Self { dir, identity, ttl }
    }

    /// Take the lock for `digest`. False when a live lock is held elsewhere.
    pub fn try_acquire(&self, digest: &Digest) -> Result<bool> {
        self.try_acquire_at(digest, now_ms())
    }

    pub fn try_acquire_at(&self, digest: &Digest, now_ms: u64) -> Result<bool> {
        if self.create(&self.dir.lock_path(digest), digest, now_ms)? {
            return Ok(true);
        }

        let age_ms = now_ms.saturating_sub(self.acquired_at(digest)?);
        if age_ms < self.ttl_ms() {
            debug!(digest = %digest_hex(digest), age_ms, "lock held");
            return Ok(false);
        }
        self.reclaim(digest, now_ms)
    }

    /// Replace a lock observed stale. False when another process is already
    /// reclaiming it, or it was replaced since it was observed.
    fn reclaim(&self, digest: &Digest, now_ms: u64) -> Result<bool> {
        let guard = self.dir.reclaim_path(digest);
        if !self.create(&guard, digest, now_ms)? {
            self.clear_abandoned_guard(digest, now_ms)?;
            return Ok(false);
        }

        let result = self.replace_stale(digest, now_ms);
        remove_record(&guard)?;
        result
    }

    fn replace_stale(&self, digest: &Digest, now_ms: u64) -> Result<bool> {
        let path = self.dir.lock_path(digest);
        if path.exists() {
            let age_ms = now_ms.saturating_sub(self.acquired_at(digest)?);
            if age_ms < self.ttl_ms() {
                debug!(digest = %digest_hex(digest), age_ms, "lock replaced before reclaim");
                return Ok(false);
            }
            warn!(digest = %digest_hex(digest), age_ms, "reclaiming stale lock");
            remove_record(&path)?;
        }
        self.create(&path, digest, now_ms)
    }

    /// A reclaimer that died mid-reclaim leaves its guard behind; drop it
    /// once it is older than the TTL so the next attempt can proceed.
    fn clear_abandoned_guard(&self, digest: &Digest, now_ms: u64) -> Result<()> {
        let guard = self.dir.reclaim_path(digest);
        let started_at = match read_json::<MessageLock>(&guard) {
            Ok(Some(lock)) => lock.acquired_at_ms,
            // Gone already, or still being written
            Ok(None) | Err(RelayerError::Corrupt { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        if now_ms.saturating_sub(started_at) >= self.ttl_ms() {
            warn!(digest = %digest_hex(digest), "removing abandoned reclaim guard");
            remove_record(&guard)?;
        }
        Ok(())
    }

    fn ttl_ms(&self) -> u64 {
        self.ttl.as_millis() as u64
    }

    /// Remove the lock if we hold it.
    pub fn release(&self, digest: &Digest) -> Result<bool> {
        match self.holder(digest)? {
            Some(lock) if lock.holder == self.identity => {
                remove_record(&self.dir.lock_path(digest))
            }
            _ => Ok(false),
        }
    }

    pub fn holder(&self, digest: &Digest) -> Result<Option<MessageLock>> {
        match read_json(&self.dir.lock_path(digest)) {
            Err(RelayerError::Corrupt { .. }) => Ok(None),
            other => other,
        }
    }

    fn create(&self, path: &Path, digest: &Digest, now_ms: u64) -> Result<bool> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(RelayerError::io(path, e)),
        };

        let lock = MessageLock {
            digest: *digest,
            holder: self.identity,
            acquired_at_ms: now_ms,
        };
        let bytes = serde_json::to_vec(&lock).map_err(|source| RelayerError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;
        file.write_all(&bytes)
            .and_then(|()| file.sync_all())
            .map_err(|e| RelayerError::io(path, e))?;
        Ok(true)
    }

    /// Lock timestamp, falling back to the file mtime when the record was
    /// left half-written.
    fn acquired_at(&self, digest: &Digest) -> Result<u64> {
        if let Some(lock) = self.holder(digest)? {
            return Ok(lock.acquired_at_ms);
        }
        let path = self.dir.lock_path(digest);
        match fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(modified) => Ok(modified
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0)),
            // Vanished between the create attempt and now.
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(RelayerError::io(&path, e)),
        }
    }
}
