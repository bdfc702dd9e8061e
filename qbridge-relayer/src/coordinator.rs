//! Relay coordinator.
//!
//! Per digest the coordinator moves a message through
//! `observed → signed → pooled → leader → locked → submitting → confirmed | failed`.
//! Every process signs and pools; only the lease holder for the destination
//! submits, and only while it holds the digest's lock. Pooled signatures are
//! counted against the relayer set the destination reports at that moment. Nothing here is a
//! transaction: a crash at any point is recovered by the lease and lock TTLs
//! and by the destination rejecting replays.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use k256::ecdsa::SigningKey;
use qbridge_core::{address_of, digest_hex, sign_digest, Address, ChainId, Digest};
use qbridge_verifier::{AcceptancePath, AcceptanceProof, Membership, ValidatorSet};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{ProofMode, RelayerConfig};
use crate::error::{RelayerError, Result};
use crate::events::{EventSource, ObservedEvent};
use crate::lease::LeaseManager;
use crate::lock::MessageLocks;
use crate::pool::{PoolRecord, SignaturePool};
use crate::retry::RetryPolicy;
use crate::store::{now_ms, FailureLog, FailureRecord, StateDir};
use crate::submitters::{SubmissionRequest, Submitter};
use crate::task::{SubmissionTask, TaskOutcome};

/// Where a digest stands after [`Coordinator::process_digest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// No pool record for the digest.
    Unknown,
    /// This process does not submit to the message's destination.
    NoSubmitter,
    /// The destination already consumed it; local state was cleaned up.
    Delivered,
    /// Recently exhausted its retries.
    CoolingDown,
    /// Fewer valid signatures than the current threshold.
    Pending { signatures: usize, threshold: usize },
    /// Another process holds the destination lease.
    NotLeader,
    /// Another process holds the message lock.
    Locked,
    /// A task of ours is already submitting it.
    InFlight,
    /// A submission task was started.
    Submitting,
}

/// Counts from one [`Coordinator::sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub pending: usize,
    pub submitting: usize,
    pub delivered: usize,
    pub pruned: usize,
    pub errors: usize,
}

pub struct Coordinator {
    identity: Address,
    signing_key: SigningKey,
    source_chains: Vec<ChainId>,
    pool: SignaturePool,
    leases: LeaseManager,
    locks: MessageLocks,
    failures: FailureLog,
    submitters: HashMap<ChainId, Arc<dyn Submitter>>,
    policy: RetryPolicy,
    proof_mode: ProofMode,
    pending_ttl: Duration,
    failure_cooldown: Duration,
    poll_interval: Duration,
    sweep_interval: Duration,
    in_flight: Mutex<HashSet<Digest>>,
    /// Digests whose inclusion proof exhausted its retries; they go out with
    /// the signature quorum from then on.
    inclusion_rejected: Mutex<HashSet<Digest>>,
    tasks: AsyncMutex<JoinSet<()>>,
    shutdown: watch::Sender<bool>,
}

impl Coordinator {
    /// Build a coordinator from validated configuration.
    pub fn new(config: &RelayerConfig) -> Result<Self> {
        config.validate()?;
        let signing_key = config.signing_key()?;
        let identity = address_of(signing_key.verifying_key());
        let dir = StateDir::open(&config.state_dir)?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            identity,
            signing_key,
            source_chains: config.source_chains.clone(),
            pool: SignaturePool::new(dir.clone()),
            leases: LeaseManager::new(dir.clone(), identity, config.lease_ttl()),
            locks: MessageLocks::new(dir.clone(), identity, config.lock_ttl()),
            failures: FailureLog::new(dir),
            submitters: HashMap::new(),
            policy: config.retry_policy(),
            proof_mode: config.proof_mode,
            pending_ttl: config.pending_ttl(),
            failure_cooldown: config.failure_cooldown(),
            poll_interval: config.poll_interval(),
            sweep_interval: config.sweep_interval(),
            in_flight: Mutex::new(HashSet::new()),
            inclusion_rejected: Mutex::new(HashSet::new()),
            tasks: AsyncMutex::new(JoinSet::new()),
            shutdown,
        })
    }

    /// Register the submitter for its destination chain.
    pub fn with_submitter(mut self, submitter: Arc<dyn Submitter>) -> Self {
        self.submitters.insert(submitter.destination(), submitter);
        self
    }

    pub fn identity(&self) -> Address {
        self.identity
    }

    pub fn pool(&self) -> &SignaturePool {
        &self.pool
    }

    pub fn failures(&self) -> &FailureLog {
        &self.failures
    }

    fn in_flight(&self) -> MutexGuard<'_, HashSet<Digest>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn inclusion_rejected(&self) -> MutexGuard<'_, HashSet<Digest>> {
        self.inclusion_rejected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Sign an observed event, publish the signature and try to move the
    /// digest forward.
    pub async fn handle_event(self: &Arc<Self>, event: &ObservedEvent) -> Result<Progress> {
        if event.message.source() != event.source_chain {
            warn!(
                observed_on = %event.source_chain,
                claims = %event.message.source(),
                "event source chain mismatch, ignoring"
            );
            return Ok(Progress::Unknown);
        }
        if !self.source_chains.is_empty() && !self.source_chains.contains(&event.source_chain) {
            debug!(chain = %event.source_chain, "event from unwatched chain");
            return Ok(Progress::Unknown);
        }

        let digest = event.message.digest();
        let signature = sign_digest(&self.signing_key, &digest)?;
        let record = self.pool.publish(
            &event.message,
            event.evidence.clone(),
            self.identity,
            signature,
        )?;
        info!(
            digest = %digest_hex(&digest),
            kind = %event.message.kind(),
            source = %event.source_chain,
            destination = %record.destination,
            block = event.block_number,
            signatures = record.signature_count(),
            "signed and pooled"
        );

        self.process_digest(digest).await
    }

    /// Re-read the pool for `digest` and submit it if this process is the
    /// leader and can take the lock.
    pub async fn process_digest(self: &Arc<Self>, digest: Digest) -> Result<Progress> {
        // Claimed before the lease and lock, so a second caller in this
        // process never touches the lock of a running task.
        if !self.in_flight().insert(digest) {
            return Ok(Progress::InFlight);
        }
        let progress = self.try_submit(digest).await;
        if !matches!(progress, Ok(Progress::Submitting)) {
            self.in_flight().remove(&digest);
        }
        progress
    }

    async fn try_submit(self: &Arc<Self>, digest: Digest) -> Result<Progress> {
        let Some(record) = self.pool.refresh(&digest)? else {
            return Ok(Progress::Unknown);
        };
        let Some(submitter) = self.submitters.get(&record.destination).cloned() else {
            return Ok(Progress::NoSubmitter);
        };

        match submitter.is_delivered(&digest).await {
            Ok(true) => {
                self.pool.remove(&digest)?;
                self.inclusion_rejected().remove(&digest);
                debug!(digest = %digest_hex(&digest), "already delivered, pool record dropped");
                return Ok(Progress::Delivered);
            }
            Ok(false) => {}
            Err(e) => warn!(digest = %digest_hex(&digest), error = %e, "delivery check failed"),
        }

        if self.failures.in_cooldown(&digest, self.failure_cooldown, now_ms())? {
            return Ok(Progress::CoolingDown);
        }

        let proof = match self.choose_proof(&record, &*submitter).await? {
            Ok(proof) => proof,
            Err(progress) => return Ok(progress),
        };

        let destination = record.destination;
        if !self.leases.try_acquire(destination)? {
            return Ok(Progress::NotLeader);
        }
        if !self.locks.try_acquire(&digest)? {
            return Ok(Progress::Locked);
        }
        if !self.leases.renew(destination)? {
            self.locks.release(&digest)?;
            return Ok(Progress::NotLeader);
        }

        let path = proof.path();
        let task = SubmissionTask::new(
            SubmissionRequest {
                message: record.message,
                proof,
            },
            submitter,
            self.policy,
            self.shutdown.subscribe(),
        );
        info!(digest = %digest_hex(&digest), %destination, ?path, "leader submitting");

        let this = Arc::clone(self);
        self.tasks.lock().await.spawn(async move {
            let (outcome, state) = task.run().await;
            if let Err(e) = this.finish(digest, destination, path, outcome, state.attempts) {
                error!(digest = %digest_hex(&digest), error = %e, "failed to record submission outcome");
            }
            this.in_flight().remove(&digest);
        });
        Ok(Progress::Submitting)
    }

    /// The inclusion proof when preferred and available, otherwise a quorum
    /// of pooled signatures from the destination's current relayer set.
    async fn choose_proof(
        &self,
        record: &PoolRecord,
        submitter: &dyn Submitter,
    ) -> Result<std::result::Result<AcceptanceProof, Progress>> {
        let prefer_inclusion = self.proof_mode == ProofMode::PreferInclusion
            && !self.inclusion_rejected().contains(&record.digest);
        if prefer_inclusion {
            if let Some(evidence) = &record.evidence {
                return Ok(Ok(evidence.to_proof()));
            }
        }

        let relayers = submitter
            .relayer_set()
            .await
            .map_err(|source| RelayerError::Membership {
                chain: record.destination,
                source,
            })?;
        let members = ValidatorSet::new(relayers);
        let signatures = self.pool.collect(&record.digest, &members)?;
        let threshold = members.threshold();
        if signatures.len() < threshold {
            debug!(
                digest = %digest_hex(&record.digest),
                signatures = signatures.len(),
                threshold,
                "below threshold"
            );
            return Ok(Err(Progress::Pending {
                signatures: signatures.len(),
                threshold,
            }));
        }
        Ok(Ok(AcceptanceProof::SignatureQuorum { signatures }))
    }

    fn finish(
        &self,
        digest: Digest,
        destination: ChainId,
        path: AcceptancePath,
        outcome: TaskOutcome,
        attempts: u32,
    ) -> Result<()> {
        match outcome {
            TaskOutcome::Confirmed(_) | TaskOutcome::AlreadyDelivered => {
                self.pool.remove(&digest)?;
                self.failures.clear(&digest)?;
                self.inclusion_rejected().remove(&digest);
                self.locks.release(&digest)?;
            }
            TaskOutcome::Exhausted { last_error, .. } if path == AcceptancePath::MerkleInclusion => {
                warn!(
                    digest = %digest_hex(&digest),
                    attempts,
                    error = %last_error,
                    "inclusion proof exhausted, falling back to the signature quorum"
                );
                self.inclusion_rejected().insert(digest);
                self.locks.release(&digest)?;
            }
            TaskOutcome::Exhausted { last_error, .. } => {
                error!(digest = %digest_hex(&digest), attempts, error = %last_error, "submission exhausted");
                self.failures.record(&FailureRecord {
                    digest,
                    destination,
                    attempts,
                    last_error,
                    failed_at_ms: now_ms(),
                })?;
                self.locks.release(&digest)?;
            }
            TaskOutcome::Cancelled => {
                debug!(digest = %digest_hex(&digest), attempts, "submission cancelled");
                self.locks.release(&digest)?;
            }
        }
        Ok(())
    }

    /// Drop expired pool records and try every pending digest, including
    /// ones only peers have seen.
    pub async fn sweep(self: &Arc<Self>) -> Result<SweepReport> {
        let pruned = self.pool.prune_expired(self.pending_ttl, now_ms())?;
        {
            let mut rejected = self.inclusion_rejected();
            for digest in &pruned {
                rejected.remove(digest);
            }
        }
        let mut report = SweepReport {
            pruned: pruned.len(),
            ..SweepReport::default()
        };

        self.reap().await;
        for digest in self.pool.pending_digests()? {
            match self.process_digest(digest).await {
                Ok(Progress::Submitting | Progress::InFlight) => report.submitting += 1,
                Ok(Progress::Delivered) => report.delivered += 1,
                Ok(Progress::Unknown) => {}
                Ok(_) => report.pending += 1,
                Err(e) => {
                    warn!(digest = %digest_hex(&digest), error = %e, "sweep failed for digest");
                    report.errors += 1;
                }
            }
        }
        debug!(?report, "sweep finished");
        Ok(report)
    }

    /// Watch `sources` and sweep periodically until [`Coordinator::shutdown`].
    pub async fn run(self: Arc<Self>, sources: Vec<Box<dyn EventSource>>) -> Result<()> {
        info!(
            identity = %self.identity,
            destinations = ?self.submitters.keys().collect::<Vec<_>>(),
            sources = sources.len(),
            "coordinator started"
        );

        let mut listeners = JoinSet::new();
        for source in sources {
            listeners.spawn(Arc::clone(&self).listen(source));
        }

        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "sweep failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        while listeners.join_next().await.is_some() {}
        self.wait_idle().await;
        for chain in self.submitters.keys() {
            if let Err(e) = self.leases.release(*chain) {
                warn!(%chain, error = %e, "failed to release lease");
            }
        }
        info!("coordinator stopped");
        Ok(())
    }

    async fn listen(self: Arc<Self>, mut source: Box<dyn EventSource>) {
        let chain = source.source_chain();
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            let batch = tokio::select! {
                batch = source.next_events() => batch,
                _ = shutdown.changed() => break,
            };
            match batch {
                Ok(events) => {
                    for event in &events {
                        if let Err(e) = self.handle_event(event).await {
                            error!(%chain, error = %e, "failed to handle event");
                        }
                    }
                }
                Err(RelayerError::SourceClosed) => {
                    info!(%chain, "event source closed");
                    break;
                }
                Err(e) => {
                    warn!(%chain, error = %e, "event source error");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Signal every loop and submission task to stop.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Wait for every spawned submission task to finish.
    pub async fn wait_idle(&self) {
        let mut tasks = self.tasks.lock().await;
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "submission task panicked");
            }
        }
    }

    async fn reap(&self) {
        let mut tasks = self.tasks.lock().await;
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                error!(error = %e, "submission task panicked");
            }
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("identity", &self.identity)
            .field("destinations", &self.submitters.keys().collect::<Vec<_>>())
            .field("proof_mode", &self.proof_mode)
            .field("in_flight", &self.in_flight().len())
            .finish_non_exhaustive()
    }
}
