//! Durable coordinator state.
//!
//! Small JSON records in a directory shared by every coordinator process:
//!
//! ```text
//! <state_dir>/pool/<digest>.json      pending signatures
//! <state_dir>/leases/<chain>.json     destination leader lease
//! <state_dir>/locks/<digest>.lock     per-message submission lock
//! <state_dir>/locks/<digest>.reclaim  held while a stale lock is replaced
//! <state_dir>/failures/<digest>.json  exhausted submissions
//! ```
//!
//! Writes go to a temp file in the same directory and are renamed into place,
//! so readers never observe a half-written record.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use qbridge_core::encoding::{hex_digest, hex_to_bytes32};
use qbridge_core::{ChainId, Digest};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{RelayerError, Result};

/// Milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Record file stem for a digest.
pub fn digest_stem(digest: &Digest) -> String {
    hex::encode(digest)
}

/// Root of the shared state directory.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    /// Open (and create if needed) the directory layout under `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let dir = Self { root: root.into() };
        for sub in [dir.pool_dir(), dir.leases_dir(), dir.locks_dir(), dir.failures_dir()] {
            fs::create_dir_all(&sub).map_err(|e| RelayerError::io(&sub, e))?;
        }
        Ok(dir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pool_dir(&self) -> PathBuf {
        self.root.join("pool")
    }

    pub fn leases_dir(&self) -> PathBuf {
        self.root.join("leases")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn failures_dir(&self) -> PathBuf {
        self.root.join("failures")
    }

    pub fn pool_path(&self, digest: &Digest) -> PathBuf {
        self.pool_dir().join(format!("{}.json", digest_stem(digest)))
    }

    pub fn lease_path(&self, chain: ChainId) -> PathBuf {
        self.leases_dir().join(format!("{}.json", chain.as_u64()))
    }

    pub fn lock_path(&self, digest: &Digest) -> PathBuf {
        self.locks_dir().join(format!("{}.lock", digest_stem(digest)))
    }

    pub fn reclaim_path(&self, digest: &Digest) -> PathBuf {
        self.locks_dir().join(format!("{}.reclaim", digest_stem(digest)))
    }

    pub fn failure_path(&self, digest: &Digest) -> PathBuf {
        self.failures_dir().join(format!("{}.json", digest_stem(digest)))
    }
}

/// Write `value` as JSON through a temp file and an atomic rename.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| RelayerError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("record");
    let tmp = path.with_file_name(format!(
        ".{file_name}.{}.{:08x}.tmp",
        std::process::id(),
        rand::random::<u32>()
    ));

    let mut file = fs::File::create(&tmp).map_err(|e| RelayerError::io(&tmp, e))?;
    file.write_all(&bytes).map_err(|e| RelayerError::io(&tmp, e))?;
    file.sync_all().map_err(|e| RelayerError::io(&tmp, e))?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        RelayerError::io(path, e)
    })
}

/// Read a JSON record; `None` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(RelayerError::io(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| RelayerError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

/// Remove a record. Returns whether it existed.
pub fn remove_record(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(RelayerError::io(path, e)),
    }
}

/// Digests of every `<digest>.<extension>` record in `dir`. Temp files and
/// names that are not digests are skipped.
pub fn list_digests(dir: &Path, extension: &str) -> Result<Vec<Digest>> {
    let entries = fs::read_dir(dir).map_err(|e| RelayerError::io(dir, e))?;
    let mut digests = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| RelayerError::io(dir, e))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(extension) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if stem.starts_with('.') {
            continue;
        }
        match hex_to_bytes32(stem) {
            Ok(digest) => digests.push(digest),
            Err(_) => warn!(path = %path.display(), "ignoring foreign file in state dir"),
        }
    }
    digests.sort_unstable();
    Ok(digests)
}

// ═══════════════════════════════════════════════════════════════════════════════
// FAILURE LOG
// ═══════════════════════════════════════════════════════════════════════════════

/// A submission that ran out of attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    #[serde(with = "hex_digest")]
    pub digest: Digest,
    pub destination: ChainId,
    pub attempts: u32,
    pub last_error: String,
    pub failed_at_ms: u64,
}

/// Failed-attempt records, so exhausted digests are surfaced instead of
/// silently dropped, and are not retried again before a cooldown.
#[derive(Debug, Clone)]
pub struct FailureLog {
    dir: StateDir,
}

impl FailureLog {
    pub fn new(dir: StateDir) -> Self {
        Self { dir }
    }

    pub fn record(&self, failure: &FailureRecord) -> Result<()> {
        write_json(&self.dir.failure_path(&failure.digest), failure)
    }

    pub fn get(&self, digest: &Digest) -> Result<Option<FailureRecord>> {
        read_json(&self.dir.failure_path(digest))
    }

    pub fn clear(&self, digest: &Digest) -> Result<bool> {
        remove_record(&self.dir.failure_path(digest))
    }

    /// Whether `digest` failed less than `cooldown` before `now_ms`.
    pub fn in_cooldown(&self, digest: &Digest, cooldown: Duration, now_ms: u64) -> Result<bool> {
        Ok(self
            .get(digest)?
            .is_some_and(|f| now_ms.saturating_sub(f.failed_at_ms) < cooldown.as_millis() as u64))
    }

    pub fn list(&self) -> Result<Vec<FailureRecord>> {
        let mut records = Vec::new();
        for digest in list_digests(&self.dir.failures_dir(), "json")? {
            if let Some(record) = self.get(&digest)? {
                records.push(record);
            }
        }
        Ok(records)
    }
}
