//! Integration tests for qbridge-relayer.
//!
//! Several coordinators share one state directory and one in-process
//! destination gateway, the way independent relayer processes share a volume
//! and a destination chain.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k256::ecdsa::SigningKey;
use qbridge_core::receipt::BLOOM_LEN;
use qbridge_core::{
    address_of, encode_receipt, receipt_leaf, Address, BridgeMessage, ChainId, Digest,
    EncodedProof, MerkleTree, TokenTransferIntent,
};
use qbridge_relayer::store::now_ms;
use qbridge_relayer::{
    ChannelEventSource, Coordinator, EventSource, InclusionEvidence, LeaseManager, LocalSubmitter,
    MessageLocks, ObservedEvent, Progress, ProofMode, RelayerConfig, RelayerError, StateDir,
    SubmissionReceipt, SubmissionRequest, SubmitError, Submitter,
};
use qbridge_verifier::{
    AcceptancePath, BridgeGateway, BridgeRegistry, CheckpointStore, InMemoryLedger,
    SubmitterPolicy,
};
use tempfile::TempDir;
use tokio::sync::Notify;

// === Test Fixtures ===

const SOURCE: ChainId = ChainId(1);
const DEST: ChainId = ChainId(10);
const TOKEN: Address = Address([0x70; 20]);
const RECIPIENT: Address = Address([0x0b; 20]);
const OWNER: Address = Address([0xee; 20]);
const DEAD_RELAYER: Address = Address([0xde; 20]);

struct Network {
    keys: Vec<[u8; 32]>,
    registry: Arc<BridgeRegistry>,
    ledger: Arc<InMemoryLedger>,
    checkpoints: Arc<CheckpointStore>,
    gateway: Arc<BridgeGateway>,
    state: TempDir,
}

impl Network {
    fn new(relayers: u8) -> Self {
        let keys: Vec<[u8; 32]> = (1..=relayers).map(|i| [i; 32]).collect();
        let registry = Arc::new(BridgeRegistry::new(1));
        for key in &keys {
            let key = SigningKey::from_slice(key).unwrap();
            registry
                .register_relayer(address_of(key.verifying_key()), 1)
                .unwrap();
        }
        registry.enable_chain(SOURCE);
        registry.enable_chain(DEST);
        registry.allow_token(DEST, TOKEN);

        let ledger = Arc::new(InMemoryLedger::new());
        let checkpoints = Arc::new(CheckpointStore::new(SubmitterPolicy::Owner(OWNER)));
        let gateway = Arc::new(
            BridgeGateway::new(DEST, registry.clone(), ledger.clone())
                .with_light_client(checkpoints.clone()),
        );

        Self {
            keys,
            registry,
            ledger,
            checkpoints,
            gateway,
            state: TempDir::new().unwrap(),
        }
    }

    fn config(&self, relayer: usize) -> RelayerConfig {
        RelayerConfig {
            relayer_key: hex::encode(self.keys[relayer]),
            state_dir: self.state.path().to_path_buf(),
            source_chains: vec![SOURCE],
            destination_chains: vec![DEST],
            sweep_interval_ms: 20,
            poll_interval_ms: 20,
            max_retries: 3,
            retry_base_ms: 10,
            retry_max_ms: 40,
            jitter_min_ms: 0,
            jitter_max_ms: 5,
            ..RelayerConfig::default()
        }
    }

    fn relayer(&self, index: usize) -> Address {
        address_of(SigningKey::from_slice(&self.keys[index]).unwrap().verifying_key())
    }

    fn coordinator_with(&self, config: RelayerConfig, submitter: Arc<dyn Submitter>) -> Arc<Coordinator> {
        Arc::new(
            Coordinator::new(&config)
                .unwrap()
                .with_submitter(submitter),
        )
    }

    fn coordinator(&self, relayer: usize) -> Arc<Coordinator> {
        self.coordinator_with(
            self.config(relayer),
            Arc::new(LocalSubmitter::new(self.gateway.clone())),
        )
    }

    fn dir(&self) -> StateDir {
        StateDir::open(self.state.path()).unwrap()
    }

    fn balance(&self) -> u128 {
        self.ledger.balance_of(&TOKEN, &RECIPIENT)
    }
}

fn transfer(nonce: u64, amount: u128) -> BridgeMessage {
    TokenTransferIntent {
        nonce,
        from_chain: SOURCE,
        to_chain: DEST,
        sender: Address([0x0a; 20]),
        token: TOKEN,
        recipient: RECIPIENT,
        amount,
    }
    .into()
}

fn observed(message: BridgeMessage) -> ObservedEvent {
    ObservedEvent {
        source_chain: SOURCE,
        block_number: 1_000 + message.nonce(),
        tx_hash: [message.nonce() as u8; 32],
        evidence: None,
        message,
    }
}

/// Fails transiently `failures` times, then delegates to the gateway.
struct FlakySubmitter {
    inner: LocalSubmitter,
    failures: u32,
    calls: AtomicU32,
}

impl FlakySubmitter {
    fn new(gateway: Arc<BridgeGateway>, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            inner: LocalSubmitter::new(gateway),
            failures,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl Submitter for FlakySubmitter {
    fn destination(&self) -> ChainId {
        self.inner.destination()
    }

    async fn submit(&self, request: &SubmissionRequest) -> Result<SubmissionReceipt, SubmitError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(SubmitError::Transient("rpc timeout".into()));
        }
        self.inner.submit(request).await
    }

    async fn is_delivered(&self, digest: &Digest) -> Result<bool, SubmitError> {
        self.inner.is_delivered(digest).await
    }

    async fn relayer_set(&self) -> Result<Vec<Address>, SubmitError> {
        self.inner.relayer_set().await
    }

    async fn health_check(&self) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// Holds every submission until the gate opens.
struct GatedSubmitter {
    inner: LocalSubmitter,
    gate: Notify,
}

#[async_trait]
impl Submitter for GatedSubmitter {
    fn destination(&self) -> ChainId {
        self.inner.destination()
    }

    async fn submit(&self, request: &SubmissionRequest) -> Result<SubmissionReceipt, SubmitError> {
        self.gate.notified().await;
        self.inner.submit(request).await
    }

    async fn is_delivered(&self, digest: &Digest) -> Result<bool, SubmitError> {
        self.inner.is_delivered(digest).await
    }

    async fn relayer_set(&self) -> Result<Vec<Address>, SubmitError> {
        self.inner.relayer_set().await
    }

    async fn health_check(&self) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// Destination whose registry cannot be read.
struct UnreachableRegistry {
    inner: LocalSubmitter,
}

#[async_trait]
impl Submitter for UnreachableRegistry {
    fn destination(&self) -> ChainId {
        self.inner.destination()
    }

    async fn submit(&self, request: &SubmissionRequest) -> Result<SubmissionReceipt, SubmitError> {
        self.inner.submit(request).await
    }

    async fn is_delivered(&self, digest: &Digest) -> Result<bool, SubmitError> {
        self.inner.is_delivered(digest).await
    }

    async fn relayer_set(&self) -> Result<Vec<Address>, SubmitError> {
        Err(SubmitError::Transient("eth_call timed out".into()))
    }

    async fn health_check(&self) -> anyhow::Result<bool> {
        Ok(false)
    }
}

// === Quorum Submission ===

#[tokio::test]
async fn test_threshold_reached_then_single_delivery() {
    let net = Network::new(3);
    let coordinators: Vec<_> = (0..3).map(|i| net.coordinator(i)).collect();
    let event = observed(transfer(1, 500));
    let digest = event.message.digest();

    assert_eq!(
        coordinators[0].handle_event(&event).await.unwrap(),
        Progress::Pending { signatures: 1, threshold: 3 }
    );
    assert_eq!(
        coordinators[1].handle_event(&event).await.unwrap(),
        Progress::Pending { signatures: 2, threshold: 3 }
    );
    assert_eq!(
        coordinators[2].handle_event(&event).await.unwrap(),
        Progress::Submitting
    );
    coordinators[2].wait_idle().await;

    assert!(net.gateway.is_consumed(&digest));
    assert_eq!(net.balance(), 500);
    let dir = net.dir();
    assert!(!dir.pool_path(&digest).exists());
    assert!(!dir.lock_path(&digest).exists());

    // Peers still caching the record learn it was delivered
    assert_eq!(
        coordinators[0].process_digest(digest).await.unwrap(),
        Progress::Delivered
    );
    assert!(coordinators[0].pool().get(&digest).is_none());

    // A late duplicate observation never mints twice
    coordinators[1].handle_event(&event).await.unwrap();
    coordinators[1].wait_idle().await;
    assert_eq!(net.balance(), 500);
}

#[tokio::test]
async fn test_non_leader_defers_to_lease_holder() {
    let net = Network::new(4);
    let coordinators: Vec<_> = (0..4).map(|i| net.coordinator(i)).collect();
    let leader = LeaseManager::new(net.dir(), coordinators[0].identity(), Duration::from_secs(30));
    assert!(leader.try_acquire(DEST).unwrap());

    let event = observed(transfer(2, 75));
    coordinators[1].handle_event(&event).await.unwrap();
    coordinators[2].handle_event(&event).await.unwrap();
    assert_eq!(
        coordinators[3].handle_event(&event).await.unwrap(),
        Progress::NotLeader
    );
    assert_eq!(net.balance(), 0);

    // The leader never observed the event itself but finds it in the pool
    let report = coordinators[0].sweep().await.unwrap();
    assert_eq!(report.submitting, 1);
    coordinators[0].wait_idle().await;
    assert_eq!(net.balance(), 75);
}

#[tokio::test]
async fn test_removed_relayer_signature_stops_counting() {
    let net = Network::new(4);
    let coordinators: Vec<_> = (0..4).map(|i| net.coordinator(i)).collect();
    let event = observed(transfer(3, 10));

    for coordinator in &coordinators[..2] {
        coordinator.handle_event(&event).await.unwrap();
    }
    // 4 members need 3; after removing one of the signers, 3 members still
    // need 3 and only one pooled signature counts
    let removed = coordinators[0].identity();
    net.registry.remove_relayer(&removed).unwrap();
    assert_eq!(
        coordinators[2].handle_event(&event).await.unwrap(),
        Progress::Pending { signatures: 2, threshold: 3 }
    );
    assert_eq!(
        coordinators[3].handle_event(&event).await.unwrap(),
        Progress::Submitting
    );
    coordinators[3].wait_idle().await;
    assert_eq!(net.balance(), 10);
}

#[tokio::test]
async fn test_relayers_added_after_start_raise_threshold() {
    let net = Network::new(5);
    let coordinators: Vec<_> = (0..5).map(|i| net.coordinator(i)).collect();
    for i in 3..5 {
        net.registry.remove_relayer(&net.relayer(i)).unwrap();
    }
    let event = observed(transfer(12, 40));

    coordinators[0].handle_event(&event).await.unwrap();
    assert_eq!(
        coordinators[1].handle_event(&event).await.unwrap(),
        Progress::Pending { signatures: 2, threshold: 3 }
    );

    // Two more relayers join the running network: 5 members need 4
    for i in 3..5 {
        net.registry.register_relayer(net.relayer(i), 1).unwrap();
    }
    assert_eq!(
        coordinators[2].handle_event(&event).await.unwrap(),
        Progress::Pending { signatures: 3, threshold: 4 }
    );
    assert_eq!(
        coordinators[3].handle_event(&event).await.unwrap(),
        Progress::Submitting
    );
    coordinators[3].wait_idle().await;
    assert_eq!(net.balance(), 40);
}

#[tokio::test]
async fn test_unreadable_relayer_set_defers_submission() {
    let net = Network::new(1);
    let coordinator = net.coordinator_with(
        net.config(0),
        Arc::new(UnreachableRegistry {
            inner: LocalSubmitter::new(net.gateway.clone()),
        }),
    );
    let event = observed(transfer(13, 8));
    let digest = event.message.digest();

    let err = coordinator.handle_event(&event).await.unwrap_err();
    assert!(matches!(err, RelayerError::Membership { chain, .. } if chain == DEST));
    // Signature stays pooled and nothing is locked
    assert!(net.dir().pool_path(&digest).exists());
    assert!(!net.dir().lock_path(&digest).exists());
    assert_eq!(net.balance(), 0);
}

// === Crash Recovery ===

#[tokio::test]
async fn test_expired_lease_of_dead_leader_is_taken_over() {
    let net = Network::new(3);
    let coordinators: Vec<_> = (0..3).map(|i| net.coordinator(i)).collect();
    let dead = LeaseManager::new(net.dir(), DEAD_RELAYER, Duration::from_secs(30));

    // Live lease of a peer blocks submission
    assert!(dead.try_acquire_at(DEST, now_ms()).unwrap());
    let event = observed(transfer(4, 1));
    for coordinator in &coordinators[..2] {
        coordinator.handle_event(&event).await.unwrap();
    }
    assert_eq!(
        coordinators[2].handle_event(&event).await.unwrap(),
        Progress::NotLeader
    );

    // Once it has expired anyone may take over
    std::fs::remove_file(net.dir().lease_path(DEST)).unwrap();
    assert!(dead.try_acquire_at(DEST, now_ms() - 60_000).unwrap());
    assert_eq!(
        coordinators[2].process_digest(event.message.digest()).await.unwrap(),
        Progress::Submitting
    );
    coordinators[2].wait_idle().await;
    assert_eq!(net.balance(), 1);

    let lease = dead.current(DEST).unwrap().unwrap();
    assert_eq!(lease.holder, coordinators[2].identity());
}

#[tokio::test]
async fn test_stale_message_lock_is_reclaimed() {
    let net = Network::new(3);
    let coordinators: Vec<_> = (0..3).map(|i| net.coordinator(i)).collect();
    let event = observed(transfer(5, 2));
    let digest = event.message.digest();
    let dead = MessageLocks::new(net.dir(), DEAD_RELAYER, Duration::from_secs(120));

    assert!(dead.try_acquire_at(&digest, now_ms()).unwrap());
    for coordinator in &coordinators[..2] {
        coordinator.handle_event(&event).await.unwrap();
    }
    assert_eq!(
        coordinators[2].handle_event(&event).await.unwrap(),
        Progress::Locked
    );

    // Rewrite the lock as if its holder died two minutes ago
    std::fs::remove_file(net.dir().lock_path(&digest)).unwrap();
    assert!(dead.try_acquire_at(&digest, now_ms() - 121_000).unwrap());
    assert_eq!(
        coordinators[2].process_digest(digest).await.unwrap(),
        Progress::Submitting
    );
    coordinators[2].wait_idle().await;
    assert_eq!(net.balance(), 2);
    assert!(!net.dir().lock_path(&digest).exists());
}

#[tokio::test]
async fn test_second_attempt_while_in_flight_leaves_lock_alone() {
    let net = Network::new(1);
    let gated = Arc::new(GatedSubmitter {
        inner: LocalSubmitter::new(net.gateway.clone()),
        gate: Notify::new(),
    });
    let coordinator = net.coordinator_with(net.config(0), gated.clone());
    let event = observed(transfer(14, 6));
    let digest = event.message.digest();

    assert_eq!(
        coordinator.handle_event(&event).await.unwrap(),
        Progress::Submitting
    );
    assert_eq!(
        coordinator.process_digest(digest).await.unwrap(),
        Progress::InFlight
    );
    let locks = MessageLocks::new(net.dir(), DEAD_RELAYER, Duration::from_secs(120));
    assert_eq!(
        locks.holder(&digest).unwrap().unwrap().holder,
        coordinator.identity()
    );

    gated.gate.notify_one();
    coordinator.wait_idle().await;
    assert_eq!(net.balance(), 6);
    assert!(!net.dir().lock_path(&digest).exists());
}

// === Retry ===

#[tokio::test]
async fn test_transient_failures_retried_then_confirmed() {
    let net = Network::new(1);
    let flaky = FlakySubmitter::new(net.gateway.clone(), 2);
    let coordinator = net.coordinator_with(net.config(0), flaky.clone());

    let event = observed(transfer(6, 33));
    assert_eq!(
        coordinator.handle_event(&event).await.unwrap(),
        Progress::Submitting
    );
    coordinator.wait_idle().await;

    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    assert_eq!(net.balance(), 33);
    assert!(coordinator.failures().list().unwrap().is_empty());
}

#[tokio::test]
async fn test_exhausted_submission_recorded_and_cooled_down() {
    let net = Network::new(1);
    let flaky = FlakySubmitter::new(net.gateway.clone(), u32::MAX);
    let coordinator = net.coordinator_with(net.config(0), flaky.clone());

    let event = observed(transfer(7, 9));
    let digest = event.message.digest();
    coordinator.handle_event(&event).await.unwrap();
    coordinator.wait_idle().await;

    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    let failure = coordinator.failures().get(&digest).unwrap().unwrap();
    assert_eq!(failure.attempts, 3);
    assert_eq!(failure.destination, DEST);
    assert_eq!(failure.last_error, "transient: rpc timeout");

    // Lock released, record kept for a later attempt, but not before cooldown
    let dir = net.dir();
    assert!(!dir.lock_path(&digest).exists());
    assert!(dir.pool_path(&digest).exists());
    assert_eq!(
        coordinator.process_digest(digest).await.unwrap(),
        Progress::CoolingDown
    );
    assert_eq!(net.balance(), 0);
}

// === Inclusion Proofs ===

#[tokio::test]
async fn test_inclusion_evidence_submitted_without_quorum() {
    let net = Network::new(3);
    let receipts: Vec<Vec<u8>> = (0..3u8)
        .map(|i| encode_receipt(&[1], 21_000 + i as u64, &[i; BLOOM_LEN], &[]))
        .collect();
    let leaves: Vec<Digest> = receipts.iter().map(|r| receipt_leaf(r).unwrap()).collect();
    let tree = MerkleTree::build(&leaves).unwrap();
    let header_id = [0x11; 32];
    net.checkpoints
        .submit_header(&OWNER, header_id, tree.root())
        .unwrap();

    let mut event = observed(transfer(8, 64));
    event.evidence = Some(InclusionEvidence {
        header_id,
        encoded_proof: EncodedProof::new(receipts[1].clone(), &tree.proof(1).unwrap()).encode(),
    });

    let config = RelayerConfig {
        proof_mode: ProofMode::PreferInclusion,
        ..net.config(0)
    };
    let coordinator =
        net.coordinator_with(config, Arc::new(LocalSubmitter::new(net.gateway.clone())));

    // One signature is far below threshold; the proof does not need it
    assert_eq!(
        coordinator.handle_event(&event).await.unwrap(),
        Progress::Submitting
    );
    coordinator.wait_idle().await;

    assert_eq!(net.balance(), 64);
    let events = net.gateway.drain_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].path, AcceptancePath::MerkleInclusion);
}

#[tokio::test]
async fn test_rejected_inclusion_falls_back_to_quorum() {
    let net = Network::new(3);
    let config = |i| RelayerConfig {
        proof_mode: ProofMode::PreferInclusion,
        ..net.config(i)
    };
    let coordinators: Vec<_> = (0..3)
        .map(|i| net.coordinator_with(config(i), Arc::new(LocalSubmitter::new(net.gateway.clone()))))
        .collect();

    // Evidence against a header the destination never accepted
    let mut event = observed(transfer(15, 90));
    event.evidence = Some(InclusionEvidence {
        header_id: [0x33; 32],
        encoded_proof: vec![0; 96],
    });
    let digest = event.message.digest();

    assert_eq!(
        coordinators[0].handle_event(&event).await.unwrap(),
        Progress::Submitting
    );
    coordinators[0].wait_idle().await;
    assert_eq!(net.balance(), 0);
    assert!(coordinators[0].failures().get(&digest).unwrap().is_none());

    for coordinator in &coordinators[1..] {
        assert_eq!(
            coordinator.handle_event(&event).await.unwrap(),
            Progress::NotLeader
        );
    }
    assert_eq!(
        coordinators[0].process_digest(digest).await.unwrap(),
        Progress::Submitting
    );
    coordinators[0].wait_idle().await;

    assert_eq!(net.balance(), 90);
    let events = net.gateway.drain_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].path, AcceptancePath::SignatureQuorum);
}

#[tokio::test]
async fn test_quorum_mode_ignores_evidence() {
    let net = Network::new(3);
    let coordinator = net.coordinator(0);
    let mut event = observed(transfer(9, 1));
    event.evidence = Some(InclusionEvidence {
        header_id: [0x22; 32],
        encoded_proof: vec![0; 96],
    });
    assert_eq!(
        coordinator.handle_event(&event).await.unwrap(),
        Progress::Pending { signatures: 1, threshold: 3 }
    );
}

// === Event Loop ===

#[tokio::test]
async fn test_run_loop_delivers_and_shuts_down() {
    let net = Network::new(3);
    let coordinators: Vec<_> = (0..3).map(|i| net.coordinator(i)).collect();
    let message = transfer(10, 250);
    let digest = message.digest();

    let mut senders = Vec::new();
    let mut handles = Vec::new();
    for coordinator in &coordinators {
        let (sender, source) = ChannelEventSource::new(SOURCE, 16);
        let sources: Vec<Box<dyn EventSource>> = vec![Box::new(source)];
        handles.push(tokio::spawn(Arc::clone(coordinator).run(sources)));
        senders.push(sender);
    }
    for sender in &senders {
        sender.send(observed(message.clone())).await.unwrap();
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !net.gateway.is_consumed(&digest) {
        assert!(tokio::time::Instant::now() < deadline, "message never delivered");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    for coordinator in &coordinators {
        coordinator.shutdown();
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(net.balance(), 250);
    assert!(!net.dir().lease_path(DEST).exists());
}

#[tokio::test]
async fn test_events_from_unwatched_chains_ignored() {
    let net = Network::new(1);
    let coordinator = net.coordinator(0);

    let mut message = transfer(11, 5);
    if let BridgeMessage::Transfer(intent) = &mut message {
        intent.from_chain = ChainId(56);
    }
    let mut foreign = observed(message);
    foreign.source_chain = ChainId(56);
    assert_eq!(
        coordinator.handle_event(&foreign).await.unwrap(),
        Progress::Unknown
    );
    assert!(coordinator.pool().pending_digests().unwrap().is_empty());
}
