//! Signature pool.
//!
//! Relayer signatures over a digest, kept in an in-process cache and mirrored
//! to `pool/<digest>.json` so peer coordinators can see them. Records are
//! keyed by signer identity, so a relayer that publishes twice still counts
//! once.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use qbridge_core::encoding::hex_digest;
use qbridge_core::{
    digest_hex, recover_signer, Address, BridgeMessage, ChainId, Digest, RelayerSignature,
};
use qbridge_verifier::Membership;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{RelayerError, Result};
use crate::events::InclusionEvidence;
use crate::store::{list_digests, now_ms, read_json, remove_record, write_json, StateDir};

/// Pending signatures for one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRecord {
    #[serde(with = "hex_digest")]
    pub digest: Digest,
    pub destination: ChainId,
    pub message: BridgeMessage,
    pub signatures: BTreeMap<Address, RelayerSignature>,
    #[serde(default)]
    pub evidence: Option<InclusionEvidence>,
    pub first_seen_ms: u64,
    pub updated_ms: u64,
}

impl PoolRecord {
    pub fn new(message: BridgeMessage, now_ms: u64) -> Self {
        Self {
            digest: message.digest(),
            destination: message.destination(),
            message,
            signatures: BTreeMap::new(),
            evidence: None,
            first_seen_ms: now_ms,
            updated_ms: now_ms,
        }
    }

    /// Fold `other` into this record. Returns true if anything was added.
    fn merge(&mut self, other: &PoolRecord) -> bool {
        let mut changed = false;
        for (signer, signature) in &other.signatures {
            if !self.signatures.contains_key(signer) {
                self.signatures.insert(*signer, *signature);
                changed = true;
            }
        }
        if self.evidence.is_none() && other.evidence.is_some() {
            self.evidence = other.evidence.clone();
            changed = true;
        }
        self.first_seen_ms = self.first_seen_ms.min(other.first_seen_ms);
        self.updated_ms = self.updated_ms.max(other.updated_ms);
        changed
    }

    pub fn signature_count(&self) -> usize {
        self.signatures.len()
    }
}

pub struct SignaturePool {
    dir: StateDir,
    cache: Mutex<HashMap<Digest, PoolRecord>>,
}

impl SignaturePool {
    pub fn new(dir: StateDir) -> Self {
        Self {
            dir,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<Digest, PoolRecord>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Durable record for `digest`. Records whose message does not hash to
    /// the file's digest are discarded.
    fn load(&self, digest: &Digest) -> Result<Option<PoolRecord>> {
        let path = self.dir.pool_path(digest);
        let record: Option<PoolRecord> = match read_json(&path) {
            Err(RelayerError::Corrupt { path, source }) => {
                warn!(path = %path.display(), error = %source, "corrupt pool record");
                None
            }
            other => other?,
        };
        Ok(record.filter(|r| {
            let valid = r.digest == *digest && r.message.digest() == *digest;
            if !valid {
                warn!(digest = %digest_hex(digest), "pool record does not match its digest");
            }
            valid
        }))
    }

    /// Add `signer`'s signature for `message` and persist the merged record.
    pub fn publish(
        &self,
        message: &BridgeMessage,
        evidence: Option<InclusionEvidence>,
        signer: Address,
        signature: RelayerSignature,
    ) -> Result<PoolRecord> {
        let digest = message.digest();
        let now = now_ms();
        let mut cache = self.cache();
        let record = cache
            .entry(digest)
            .or_insert_with(|| PoolRecord::new(message.clone(), now));

        if let Some(durable) = self.load(&digest)? {
            record.merge(&durable);
        }
        record.signatures.insert(signer, signature);
        if record.evidence.is_none() {
            record.evidence = evidence;
        }
        record.updated_ms = now;

        write_json(&self.dir.pool_path(&digest), &*record)?;
        debug!(
            digest = %digest_hex(&digest),
            %signer,
            signatures = record.signature_count(),
            "signature published"
        );
        Ok(record.clone())
    }

    /// Merge the durable record into the cache. If the cache holds signatures
    /// the file lost to a concurrent writer, the file is rewritten.
    pub fn refresh(&self, digest: &Digest) -> Result<Option<PoolRecord>> {
        let durable = self.load(digest)?;
        let mut cache = self.cache();
        let Some(durable) = durable else {
            return Ok(cache.get(digest).cloned());
        };

        match cache.entry(*digest) {
            Entry::Occupied(mut entry) => {
                let cached = entry.get_mut();
                cached.merge(&durable);
                if cached.signatures.len() > durable.signatures.len()
                    || (cached.evidence.is_some() && durable.evidence.is_none())
                {
                    debug!(digest = %digest_hex(digest), "repairing pool record");
                    write_json(&self.dir.pool_path(digest), &*cached)?;
                }
                Ok(Some(cached.clone()))
            }
            Entry::Vacant(entry) => Ok(Some(entry.insert(durable).clone())),
        }
    }

    /// Signatures that recover to their claimed signer and to a current
    /// member, ordered by signer.
    pub fn collect<M: Membership + ?Sized>(
        &self,
        digest: &Digest,
        members: &M,
    ) -> Result<Vec<RelayerSignature>> {
        let Some(record) = self.refresh(digest)? else {
            return Ok(Vec::new());
        };

        let mut valid = Vec::with_capacity(record.signatures.len());
        for (claimed, signature) in &record.signatures {
            match recover_signer(digest, signature) {
                Ok(signer) if signer == *claimed && members.is_member(&signer) => {
                    valid.push(*signature)
                }
                Ok(signer) => {
                    debug!(digest = %digest_hex(digest), %claimed, %signer, "ignoring pooled signature")
                }
                Err(e) => {
                    debug!(digest = %digest_hex(digest), %claimed, error = %e, "unrecoverable pooled signature")
                }
            }
        }
        Ok(valid)
    }

    /// Cached record, if any, without touching the disk.
    pub fn get(&self, digest: &Digest) -> Option<PoolRecord> {
        self.cache().get(digest).cloned()
    }

    /// Forget `digest` everywhere.
    pub fn remove(&self, digest: &Digest) -> Result<bool> {
        let cached = self.cache().remove(digest).is_some();
        let durable = remove_record(&self.dir.pool_path(digest))?;
        Ok(cached || durable)
    }

    /// Every digest known locally or on disk.
    pub fn pending_digests(&self) -> Result<Vec<Digest>> {
        let mut digests = list_digests(&self.dir.pool_dir(), "json")?;
        digests.extend(self.cache().keys().copied());
        digests.sort_unstable();
        digests.dedup();
        Ok(digests)
    }

    /// Drop records first seen more than `ttl` before `now_ms`.
    pub fn prune_expired(&self, ttl: Duration, now_ms: u64) -> Result<Vec<Digest>> {
        let ttl_ms = ttl.as_millis() as u64;
        let mut pruned = Vec::new();
        for digest in self.pending_digests()? {
            let Some(record) = self.refresh(&digest)? else {
                continue;
            };
            if now_ms.saturating_sub(record.first_seen_ms) >= ttl_ms {
                self.remove(&digest)?;
                info!(digest = %digest_hex(&digest), "pool record expired");
                pruned.push(digest);
            }
        }
        Ok(pruned)
    }
}

impl std::fmt::Debug for SignaturePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignaturePool")
            .field("dir", &self.dir.root())
            .field("cached", &self.cache().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::SigningKey;
    use qbridge_core::{address_of, sign_digest, TokenTransferIntent};
    use qbridge_verifier::ValidatorSet;
    use tempfile::TempDir;

    fn keys() -> Vec<SigningKey> {
        (1..=4u8)
            .map(|i| SigningKey::from_slice(&[i; 32]).unwrap())
            .collect()
    }

    fn message() -> BridgeMessage {
        TokenTransferIntent {
            nonce: 1,
            from_chain: ChainId(1),
            to_chain: ChainId(10),
            sender: Address([1; 20]),
            token: Address([2; 20]),
            recipient: Address([3; 20]),
            amount: 1_000,
        }
        .into()
    }

    fn publish(pool: &SignaturePool, key: &SigningKey, message: &BridgeMessage) -> PoolRecord {
        let signature = sign_digest(key, &message.digest()).unwrap();
        pool.publish(message, None, address_of(key.verifying_key()), signature)
            .unwrap()
    }

    #[test]
    fn test_publish_dedupes_by_identity() {
        let tmp = TempDir::new().unwrap();
        let pool = SignaturePool::new(StateDir::open(tmp.path()).unwrap());
        let keys = keys();
        let msg = message();

        publish(&pool, &keys[0], &msg);
        let record = publish(&pool, &keys[0], &msg);
        assert_eq!(record.signature_count(), 1);
        let record = publish(&pool, &keys[1], &msg);
        assert_eq!(record.signature_count(), 2);
        assert_eq!(record.destination, ChainId(10));
    }

    #[test]
    fn test_peers_see_each_other() {
        let tmp = TempDir::new().unwrap();
        let dir = StateDir::open(tmp.path()).unwrap();
        let a = SignaturePool::new(dir.clone());
        let b = SignaturePool::new(dir);
        let keys = keys();
        let msg = message();
        let digest = msg.digest();

        publish(&a, &keys[0], &msg);
        publish(&b, &keys[1], &msg);
        assert_eq!(a.refresh(&digest).unwrap().unwrap().signature_count(), 2);
        assert_eq!(b.pending_digests().unwrap(), vec![digest]);
    }

    #[test]
    fn test_refresh_repairs_lost_update() {
        let tmp = TempDir::new().unwrap();
        let dir = StateDir::open(tmp.path()).unwrap();
        let a = SignaturePool::new(dir.clone());
        let keys = keys();
        let msg = message();
        let digest = msg.digest();

        publish(&a, &keys[0], &msg);
        publish(&a, &keys[1], &msg);
        // A peer overwrote the file with a stale view
        let mut stale = PoolRecord::new(msg.clone(), 0);
        stale
            .signatures
            .insert(address_of(keys[2].verifying_key()), sign_digest(&keys[2], &digest).unwrap());
        write_json(&dir.pool_path(&digest), &stale).unwrap();

        assert_eq!(a.refresh(&digest).unwrap().unwrap().signature_count(), 3);
        let durable: PoolRecord = read_json(&dir.pool_path(&digest)).unwrap().unwrap();
        assert_eq!(durable.signature_count(), 3);
    }

    #[test]
    fn test_collect_filters_non_members_and_forgeries() {
        let tmp = TempDir::new().unwrap();
        let pool = SignaturePool::new(StateDir::open(tmp.path()).unwrap());
        let keys = keys();
        let msg = message();
        let digest = msg.digest();
        let members = ValidatorSet::new(keys[..3].iter().map(|k| address_of(k.verifying_key())));

        publish(&pool, &keys[0], &msg);
        publish(&pool, &keys[1], &msg);
        // Non-member
        publish(&pool, &keys[3], &msg);
        // Claims to be keys[2] but signed by keys[0]
        pool.publish(
            &msg,
            None,
            address_of(keys[2].verifying_key()),
            sign_digest(&keys[0], &digest).unwrap(),
        )
        .unwrap();

        assert_eq!(pool.collect(&digest, &members).unwrap().len(), 2);

        members.remove(&address_of(keys[1].verifying_key()));
        assert_eq!(pool.collect(&digest, &members).unwrap().len(), 1);
    }

    #[test]
    fn test_tampered_record_ignored() {
        let tmp = TempDir::new().unwrap();
        let dir = StateDir::open(tmp.path()).unwrap();
        let pool = SignaturePool::new(dir.clone());
        let msg = message();
        let mut other = message();
        if let BridgeMessage::Transfer(intent) = &mut other {
            intent.amount = 1;
        }
        // File named after msg but carrying a different message
        let mut record = PoolRecord::new(other, 0);
        record.digest = msg.digest();
        write_json(&dir.pool_path(&msg.digest()), &record).unwrap();

        assert!(pool.refresh(&msg.digest()).unwrap().is_none());
    }

    #[test]
    fn test_remove_and_prune() {
        let tmp = TempDir::new().unwrap();
        let pool = SignaturePool::new(StateDir::open(tmp.path()).unwrap());
        let keys = keys();
        let msg = message();
        let digest = msg.digest();

        let record = publish(&pool, &keys[0], &msg);
        let ttl = Duration::from_secs(60);
        assert!(pool.prune_expired(ttl, record.first_seen_ms + 1_000).unwrap().is_empty());
        assert_eq!(
            pool.prune_expired(ttl, record.first_seen_ms + 60_000).unwrap(),
            vec![digest]
        );
        assert!(pool.pending_digests().unwrap().is_empty());
        assert!(!pool.remove(&digest).unwrap());
    }
}
