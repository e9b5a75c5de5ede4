use async_trait::async_trait;
use dubhe_relayer::{
    chains::{
        Call, DestinationClient, Ed25519Signer, EventConnection, EventSource, SignedExtrinsic,
        Signer, StatusStream,
    },
    decode_intent,
    types::{
        BlockHash, DestinationConfig, FailureKind, FailureReason, ProcessingConfig, SourceConfig,
        TransferShape,
    },
    AmountInput, AmountValidator, Claim, EventStream, EventSubscriber, FileStore, MemoryStore,
    RawEvent, RecordState, RecordStore, RelayError, RelayOrchestrator, SourceEventId,
    SubmissionRecord, TransactionSubmitter, TxHash, TxStatus,
};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{sync::mpsc, time::sleep};

const ALICE: &str = "5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY";
const SEED: &str = "0x9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60";

#[derive(Debug, Clone, Copy)]
enum Step {
    Accept,
    Transport,
    Reject,
    Hang,
}

/// What a status watch reports after the extrinsic was accepted
#[derive(Debug, Clone, Copy)]
enum Watch {
    Finalize,
    /// InBlock, then the stream closes without a verdict
    CloseEarly,
    /// The pool drops the extrinsic
    Drop,
}

/// Destination chain double: each submission consumes one scripted step,
/// falling back to `default` once the script is exhausted. Each watch consumes
/// one `Watch` the same way, falling back to `Finalize`.
struct ScriptedChain {
    script: Mutex<VecDeque<Step>>,
    default: Step,
    watches: Mutex<VecDeque<Watch>>,
    default_watch: Watch,
    submits: AtomicUsize,
    submitted: Mutex<Vec<SignedExtrinsic>>,
    watched: Mutex<Vec<TxHash>>,
    nonce: AtomicU64,
}

impl ScriptedChain {
    fn new(script: Vec<Step>, default: Step) -> Arc<Self> {
        Self::with_watches(script, default, vec![], Watch::Finalize)
    }

    fn with_watches(
        script: Vec<Step>,
        default: Step,
        watches: Vec<Watch>,
        default_watch: Watch,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            default,
            watches: Mutex::new(watches.into()),
            default_watch,
            submits: AtomicUsize::new(0),
            submitted: Mutex::new(Vec::new()),
            watched: Mutex::new(Vec::new()),
            nonce: AtomicU64::new(0),
        })
    }

    fn watched(&self) -> Vec<TxHash> {
        self.watched.lock().unwrap().clone()
    }

    fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    fn nonces(&self) -> Vec<u64> {
        self.submitted.lock().unwrap().iter().map(|x| x.nonce).collect()
    }
}

#[async_trait]
impl DestinationClient for ScriptedChain {
    async fn next_nonce(&self, _account: &str) -> Result<u64, RelayError> {
        Ok(self.nonce.load(Ordering::SeqCst))
    }

    async fn submit_extrinsic(&self, extrinsic: &SignedExtrinsic) -> Result<TxHash, RelayError> {
        let count = self.submits.fetch_add(1, Ordering::SeqCst) + 1;
        self.submitted.lock().unwrap().push(extrinsic.clone());
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.default);

        match step {
            Step::Accept => Ok(TxHash(format!("0x{:04x}", count))),
            Step::Transport => Err(RelayError::Transport("connection reset".to_string())),
            Step::Reject => Err(RelayError::RpcRejected(
                "1010: Invalid Transaction: Inability to pay some fees".to_string(),
            )),
            Step::Hang => {
                sleep(Duration::from_secs(3600)).await;
                Err(RelayError::Transport("unreachable".to_string()))
            }
        }
    }

    async fn watch(&self, hash: &TxHash) -> Result<StatusStream, RelayError> {
        self.watched.lock().unwrap().push(hash.clone());
        let watch = self
            .watches
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.default_watch);

        let (sender, receiver) = mpsc::channel(4);
        let block = BlockHash(format!("0xb{}", hash.0.trim_start_matches("0x")));
        match watch {
            Watch::Finalize => {
                sender.try_send(TxStatus::InBlock(block.clone())).unwrap();
                sender.try_send(TxStatus::Finalized(block)).unwrap();
            }
            Watch::CloseEarly => {
                sender.try_send(TxStatus::InBlock(block)).unwrap();
            }
            Watch::Drop => {
                sender
                    .try_send(TxStatus::Failed(FailureReason::new(
                        FailureKind::Dropped,
                        "dropped from the pool",
                    )))
                    .unwrap();
            }
        }
        Ok(receiver)
    }
}

/// A signer whose key went away
struct UnpluggedSigner;

#[async_trait]
impl Signer for UnpluggedSigner {
    fn public_key(&self) -> [u8; 32] {
        [1u8; 32]
    }

    async fn sign(&self, _payload: &[u8]) -> Result<Vec<u8>, RelayError> {
        Err(RelayError::SigningFailure("key store unavailable".to_string()))
    }

    fn is_available(&self) -> bool {
        false
    }
}

/// Delivers its events, then keeps the connection open forever.
struct OpenEndedSource {
    events: Vec<RawEvent>,
}

struct OpenEndedConnection {
    events: VecDeque<RawEvent>,
}

#[async_trait]
impl EventConnection for OpenEndedConnection {
    async fn next_event(&mut self) -> Result<Option<RawEvent>, RelayError> {
        match self.events.pop_front() {
            Some(event) => Ok(Some(event)),
            None => std::future::pending().await,
        }
    }
}

#[async_trait]
impl EventSource for OpenEndedSource {
    async fn connect(
        &self,
        _event_names: &[String],
        _resume_after: Option<SourceEventId>,
    ) -> Result<Box<dyn EventConnection>, RelayError> {
        Ok(Box::new(OpenEndedConnection {
            events: self.events.clone().into(),
        }))
    }
}

/// Record store whose claims fail for one id
struct BrokenClaimStore {
    inner: MemoryStore,
    broken: SourceEventId,
}

#[async_trait]
impl RecordStore for BrokenClaimStore {
    async fn claim(&self, event: &RawEvent) -> Result<Claim, RelayError> {
        if event.id == self.broken {
            return Err(RelayError::Store("disk full".to_string()));
        }
        self.inner.claim(event).await
    }

    async fn update(&self, record: &SubmissionRecord) -> Result<(), RelayError> {
        self.inner.update(record).await
    }

    async fn archive(&self, id: &SourceEventId) -> Result<(), RelayError> {
        self.inner.archive(id).await
    }

    async fn get(&self, id: &SourceEventId) -> Result<Option<SubmissionRecord>, RelayError> {
        self.inner.get(id).await
    }

    async fn non_terminal(&self) -> Result<Vec<SubmissionRecord>, RelayError> {
        self.inner.non_terminal().await
    }

    async fn list(&self) -> Result<Vec<SubmissionRecord>, RelayError> {
        self.inner.list().await
    }

    async fn low_water_mark(&self) -> Result<Option<SourceEventId>, RelayError> {
        self.inner.low_water_mark().await
    }
}

fn event(block: u64, dest: &str, amount: &str) -> RawEvent {
    RawEvent {
        name: "asset_moved_event".to_string(),
        id: SourceEventId::new(block, 0),
        origin_chain: None,
        origin_address: Some("0x2300e4f1".to_string()),
        chain_address: dest.to_string(),
        amount: AmountInput::from(amount),
        malformed: None,
    }
}

fn processing(max_attempts: u32) -> ProcessingConfig {
    ProcessingConfig {
        max_attempts,
        retry_initial_ms: 1,
        retry_max_ms: 5,
        submit_timeout_ms: 200,
        max_concurrent_submissions: 4,
        max_amount: None,
        shutdown_grace_secs: 10,
    }
}

fn orchestrator_with(
    chain: Arc<ScriptedChain>,
    signer: Arc<dyn Signer>,
    store: Arc<dyn RecordStore>,
    max_attempts: u32,
    shape: TransferShape,
) -> Arc<RelayOrchestrator> {
    let destination = DestinationConfig {
        transfer_shape: shape,
        ..Default::default()
    };
    let submitter = Arc::new(TransactionSubmitter::new(chain, signer, &destination).unwrap());
    Arc::new(RelayOrchestrator::new(processing(max_attempts), "sui", store, submitter).unwrap())
}

fn orchestrator(
    chain: Arc<ScriptedChain>,
    store: Arc<dyn RecordStore>,
    max_attempts: u32,
) -> Arc<RelayOrchestrator> {
    let signer = Arc::new(Ed25519Signer::from_hex_seed(SEED).unwrap());
    orchestrator_with(chain, signer, store, max_attempts, TransferShape::Transfer)
}

async fn relay(orchestrator: Arc<RelayOrchestrator>, events: Vec<RawEvent>) {
    orchestrator
        .run(EventStream::from_events(events), std::future::pending())
        .await
        .unwrap();
}

async fn record(store: &dyn RecordStore, block: u64) -> SubmissionRecord {
    store
        .get(&SourceEventId::new(block, 0))
        .await
        .unwrap()
        .expect("record exists")
}

#[tokio::test]
async fn test_happy_path() {
    let chain = ScriptedChain::new(vec![], Step::Accept);
    let store = Arc::new(MemoryStore::new());
    let relayer = orchestrator(chain.clone(), store.clone(), 3);

    relay(relayer.clone(), vec![event(100, ALICE, "500")]).await;

    let record = record(store.as_ref(), 100).await;
    assert_eq!(
        record.history_labels(),
        vec!["Seen", "Validating", "Validated", "Submitting", "Submitted", "InBlock", "Finalized"]
    );
    assert!(matches!(record.state, RecordState::Finalized { .. }));
    assert_eq!(record.attempts, 1);
    assert_eq!(record.destination_tx_hash, Some(TxHash("0x0001".to_string())));
    assert_eq!(chain.submits(), 1);

    let metrics = relayer.metrics().await;
    assert_eq!(metrics.finalized, 1);
    assert_eq!(metrics.in_flight, 0);
    assert!(metrics.last_finalized_at.is_some());

    assert!(store.non_terminal().await.unwrap().is_empty());
    assert_eq!(
        store.low_water_mark().await.unwrap(),
        Some(SourceEventId::new(100, 0))
    );

    match &chain.submitted.lock().unwrap()[0].call {
        Call::TransferKeepAlive { dest, amount } => {
            assert_eq!(dest, ALICE);
            assert_eq!(*amount, 500);
        }
        other => panic!("unexpected call {:?}", other),
    };
}

#[tokio::test]
async fn test_duplicate_delivery_submits_once() {
    let chain = ScriptedChain::new(vec![], Step::Accept);
    let store = Arc::new(MemoryStore::new());
    let relayer = orchestrator(chain.clone(), store.clone(), 3);

    relay(
        relayer.clone(),
        vec![event(100, ALICE, "500"), event(100, ALICE, "500")],
    )
    .await;

    assert_eq!(chain.submits(), 1);
    assert_eq!(store.list().await.unwrap().len(), 1);
    assert_eq!(relayer.metrics().await.duplicates_discarded, 1);

    // redelivery after finality is still discarded
    relay(relayer.clone(), vec![event(100, ALICE, "500")]).await;
    assert_eq!(chain.submits(), 1);
    assert_eq!(relayer.metrics().await.duplicates_discarded, 2);
}

#[tokio::test]
async fn test_bad_address_is_rejected() {
    let chain = ScriptedChain::new(vec![], Step::Accept);
    let store = Arc::new(MemoryStore::new());
    let relayer = orchestrator(chain.clone(), store.clone(), 3);

    relay(relayer.clone(), vec![event(100, "not-an-address", "500")]).await;

    let record = record(store.as_ref(), 100).await;
    assert_eq!(record.history_labels(), vec!["Seen", "Validating", "Rejected"]);
    assert!(record.is_terminal());
    assert_eq!(chain.submits(), 0);
    assert_eq!(relayer.metrics().await.rejected, 1);
}

#[tokio::test]
async fn test_undecodable_event_is_recorded_as_rejected() {
    let chain = ScriptedChain::new(vec![], Step::Accept);
    let store = Arc::new(MemoryStore::new());
    let relayer = orchestrator(chain.clone(), store.clone(), 3);

    relay(
        relayer,
        vec![RawEvent::malformed(
            "asset_moved_event",
            SourceEventId::new(100, 0),
            "invalid type: sequence, expected a string or an integer",
        )],
    )
    .await;

    let record = record(store.as_ref(), 100).await;
    match &record.state {
        RecordState::Rejected { reason } => assert!(reason.contains("B100-0"), "{}", reason),
        other => panic!("unexpected state {}", other),
    }
    assert_eq!(chain.submits(), 0);
    assert_eq!(
        store.low_water_mark().await.unwrap(),
        Some(SourceEventId::new(100, 0))
    );
}

#[tokio::test]
async fn test_unclaimable_event_stops_ingestion() {
    let chain = ScriptedChain::new(vec![], Step::Accept);
    let store = Arc::new(BrokenClaimStore {
        inner: MemoryStore::new(),
        broken: SourceEventId::new(5, 0),
    });
    let relayer = orchestrator(chain.clone(), store.clone(), 3);

    let result = relayer
        .run(
            EventStream::from_events(vec![
                event(4, ALICE, "500"),
                event(5, ALICE, "500"),
                event(6, ALICE, "500"),
            ]),
            std::future::pending(),
        )
        .await;
    assert!(matches!(result, Err(RelayError::Store(_))));

    // nothing after the unclaimed event was taken, so a restart delivers it again
    assert!(matches!(record(store.as_ref(), 4).await.state, RecordState::Finalized { .. }));
    assert_eq!(store.get(&SourceEventId::new(5, 0)).await.unwrap(), None);
    assert_eq!(store.get(&SourceEventId::new(6, 0)).await.unwrap(), None);
    assert_eq!(
        store.low_water_mark().await.unwrap(),
        Some(SourceEventId::new(4, 0))
    );
    assert_eq!(chain.submits(), 1);
}

#[tokio::test]
async fn test_invalid_inputs_never_reach_the_chain() {
    let chain = ScriptedChain::new(vec![], Step::Accept);
    let store = Arc::new(MemoryStore::new());
    let relayer = orchestrator(chain.clone(), store.clone(), 3);

    relay(
        relayer,
        vec![
            event(1, ALICE, "0"),
            event(2, ALICE, "-1"),
            event(3, ALICE, "abc"),
            event(4, "0x0102030405060708", "500"),
            event(5, "0x0102", "500"),
        ],
    )
    .await;

    for block in 1..=5 {
        let record = record(store.as_ref(), block).await;
        assert!(
            matches!(record.state, RecordState::Rejected { .. }),
            "block {} ended in {}",
            block,
            record.state
        );
    }
    assert_eq!(chain.submits(), 0);
}

#[tokio::test]
async fn test_retry_bound_on_transport_failures() {
    let chain = ScriptedChain::new(vec![], Step::Transport);
    let store = Arc::new(MemoryStore::new());
    let relayer = orchestrator(chain.clone(), store.clone(), 3);

    relay(relayer.clone(), vec![event(100, ALICE, "500")]).await;

    let record = record(store.as_ref(), 100).await;
    match &record.state {
        RecordState::Failed { reason, terminal } => {
            assert!(terminal);
            assert_eq!(reason.kind, FailureKind::Transport);
        }
        other => panic!("unexpected state {}", other),
    }
    assert_eq!(record.attempts, 3);
    assert_eq!(chain.submits(), 3);

    // every retry replaced the unacknowledged attempt instead of paying twice
    assert_eq!(chain.nonces(), vec![0, 0, 0]);
    assert_eq!(record.nonce_in_doubt, Some(0));
    assert!(!record.is_revivable());

    let metrics = relayer.metrics().await;
    assert_eq!(metrics.failed, 1);
    assert_eq!(metrics.retries, 2);
}

#[tokio::test]
async fn test_transient_failure_then_recovery() {
    let chain = ScriptedChain::new(vec![Step::Transport], Step::Accept);
    let store = Arc::new(MemoryStore::new());
    let relayer = orchestrator(chain.clone(), store.clone(), 3);

    relay(relayer, vec![event(100, ALICE, "500")]).await;

    let record = record(store.as_ref(), 100).await;
    assert!(matches!(record.state, RecordState::Finalized { .. }));
    assert_eq!(record.attempts, 2);
    assert_eq!(record.nonce_in_doubt, None);
    assert_eq!(chain.submits(), 2);
}

#[tokio::test]
async fn test_submission_timeout_is_retried_with_same_nonce() {
    let chain = ScriptedChain::new(vec![Step::Hang], Step::Accept);
    let store = Arc::new(MemoryStore::new());
    let relayer = orchestrator(chain.clone(), store.clone(), 3);

    relay(relayer, vec![event(100, ALICE, "500")]).await;

    let record = record(store.as_ref(), 100).await;
    assert!(matches!(record.state, RecordState::Finalized { .. }));
    assert_eq!(record.attempts, 2);
    assert!(record.history.iter().any(|state| matches!(
        state,
        RecordState::Failed { reason, terminal: false } if reason.kind == FailureKind::Timeout
    )));
    assert_eq!(chain.nonces(), vec![0, 0]);
}

#[tokio::test]
async fn test_status_stream_without_verdict_is_watched_again() {
    let chain = ScriptedChain::with_watches(vec![], Step::Accept, vec![], Watch::CloseEarly);
    let store = Arc::new(MemoryStore::new());
    let relayer = orchestrator(chain.clone(), store.clone(), 3);

    relay(relayer.clone(), vec![event(100, ALICE, "500")]).await;

    let record = record(store.as_ref(), 100).await;
    match &record.state {
        RecordState::Failed { reason, terminal } => {
            assert!(terminal);
            assert_eq!(reason.kind, FailureKind::Transport);
        }
        other => panic!("unexpected state {}", other),
    }
    // the accepted extrinsic was never replaced, only watched again
    assert_eq!(chain.submits(), 1);
    assert_eq!(record.attempts, 1);
    let hash = TxHash("0x0001".to_string());
    assert_eq!(chain.watched(), vec![hash.clone(), hash.clone(), hash.clone()]);
    assert_eq!(record.destination_tx_hash, Some(hash));
    assert!(record.abandoned_tx_hashes.is_empty());
    assert!(!record.is_revivable());
    assert_eq!(relayer.metrics().await.failed, 1);
}

#[tokio::test]
async fn test_dropped_extrinsic_is_replaced_with_same_nonce() {
    let chain = ScriptedChain::with_watches(vec![], Step::Accept, vec![Watch::Drop], Watch::Finalize);
    let store = Arc::new(MemoryStore::new());
    let relayer = orchestrator(chain.clone(), store.clone(), 3);

    relay(relayer.clone(), vec![event(100, ALICE, "500")]).await;

    let record = record(store.as_ref(), 100).await;
    assert!(matches!(record.state, RecordState::Finalized { .. }));
    assert_eq!(record.attempts, 2);
    assert_eq!(chain.nonces(), vec![0, 0]);
    assert_eq!(record.abandoned_tx_hashes, vec![TxHash("0x0001".to_string())]);
    assert_eq!(record.destination_tx_hash, Some(TxHash("0x0002".to_string())));
    assert_eq!(record.nonce_in_doubt, None);
    assert!(record.history.iter().any(|state| matches!(
        state,
        RecordState::Failed { reason, terminal: false } if reason.kind == FailureKind::Dropped
    )));
    assert_eq!(relayer.metrics().await.retries, 1);
}

#[tokio::test]
async fn test_rejected_record_is_revived_by_redelivery() {
    let chain = ScriptedChain::new(vec![Step::Reject, Step::Reject], Step::Accept);
    let store = Arc::new(MemoryStore::new());
    let relayer = orchestrator(chain.clone(), store.clone(), 2);

    relay(relayer.clone(), vec![event(100, ALICE, "500")]).await;
    let failed = record(store.as_ref(), 100).await;
    assert!(matches!(failed.state, RecordState::Failed { terminal: true, .. }));
    assert!(failed.is_revivable());

    relay(relayer, vec![event(100, ALICE, "500")]).await;
    let revived = record(store.as_ref(), 100).await;
    assert_eq!(revived.id, failed.id);
    assert_eq!(revived.revivals, 1);
    assert_eq!(revived.attempts, 1);
    assert!(matches!(revived.state, RecordState::Finalized { .. }));
    assert_eq!(chain.submits(), 3);
}

#[tokio::test]
async fn test_deposit_shape() {
    let chain = ScriptedChain::new(vec![], Step::Accept);
    let store = Arc::new(MemoryStore::new());
    let signer = Arc::new(Ed25519Signer::from_hex_seed(SEED).unwrap());
    let relayer = orchestrator_with(chain.clone(), signer, store, 3, TransferShape::Deposit);

    relay(relayer, vec![event(100, ALICE, "500")]).await;

    let submitted = chain.submitted.lock().unwrap();
    assert_eq!(
        submitted[0].call,
        Call::Deposit {
            origin_chain: "sui".to_string(),
            origin_address: "0x2300e4f1".to_string(),
            dest: ALICE.to_string(),
            amount: 500,
        }
    );
}

#[tokio::test]
async fn test_restart_rewatches_submitted_transfer() {
    let path = std::env::temp_dir().join(format!("dubhe-relayer-restart-{}.json", uuid::Uuid::new_v4()));
    let submitted_event = event(100, ALICE, "500");

    {
        let store = FileStore::open(&path).await.unwrap();
        let Claim::Fresh(mut record) = store.claim(&submitted_event).await.unwrap() else {
            panic!("expected a fresh claim");
        };
        record.advance(RecordState::Validating);
        record.intent =
            Some(decode_intent(&submitted_event, "sui", &AmountValidator::default()).unwrap());
        record.advance(RecordState::Validated);
        record.attempts = 1;
        record.nonce = Some(0);
        record.advance(RecordState::Submitting);
        record.destination_tx_hash = Some(TxHash("0x00aa".to_string()));
        record.advance(RecordState::Submitted);
        store.update(&record).await.unwrap();
    }

    let chain = ScriptedChain::new(vec![], Step::Accept);
    let store: Arc<dyn RecordStore> = Arc::new(FileStore::open(&path).await.unwrap());
    let relayer = orchestrator(chain.clone(), store.clone(), 3);

    relay(relayer, vec![]).await;

    let record = record(store.as_ref(), 100).await;
    assert!(matches!(record.state, RecordState::Finalized { .. }));
    assert_eq!(record.attempts, 1);
    assert_eq!(record.destination_tx_hash, Some(TxHash("0x00aa".to_string())));
    assert_eq!(chain.submits(), 0);

    // a later redelivery of the same event stays blocked
    assert!(matches!(
        store.claim(&submitted_event).await.unwrap(),
        Claim::Duplicate(RecordState::Finalized { .. })
    ));

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_unusable_signer_halts_the_relay() {
    let chain = ScriptedChain::new(vec![], Step::Accept);
    let store = Arc::new(MemoryStore::new());
    let relayer = orchestrator_with(
        chain.clone(),
        Arc::new(UnpluggedSigner),
        store.clone(),
        3,
        TransferShape::Transfer,
    );

    let source = Arc::new(OpenEndedSource {
        events: vec![event(100, ALICE, "500")],
    });
    let events = EventSubscriber::new(source, &SourceConfig::default()).subscribe(None);

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        relayer.run(events, std::future::pending()),
    )
    .await
    .expect("relay halts on its own");
    assert!(matches!(result, Err(RelayError::SigningFailure(_))));

    let record = record(store.as_ref(), 100).await;
    match &record.state {
        RecordState::Failed { reason, terminal } => {
            assert!(terminal);
            assert_eq!(reason.kind, FailureKind::Signing);
        }
        other => panic!("unexpected state {}", other),
    }
    assert_eq!(record.attempts, 1);
    assert_eq!(chain.submits(), 0);
}
