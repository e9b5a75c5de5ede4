use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};
use uuid::Uuid;

use crate::address::PublicKey;
use crate::amount::{Amount, AmountInput};

/// Position of an event on the source chain. Ordered by block, then by event index.
///
/// The textual form is `B<block>-<index>`, e.g. `B100-0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceEventId {
    pub block: u64,
    pub index: u32,
}

impl SourceEventId {
    pub fn new(block: u64, index: u32) -> Self {
        Self { block, index }
    }
}

impl fmt::Display for SourceEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}-{}", self.block, self.index)
    }
}

impl FromStr for SourceEventId {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || RelayError::MalformedEvent(format!("Invalid event id: {}", s));
        let rest = s.strip_prefix('B').ok_or_else(malformed)?;
        let (block, index) = rest.split_once('-').ok_or_else(malformed)?;
        Ok(Self {
            block: block.parse().map_err(|_| malformed())?,
            index: index.parse().map_err(|_| malformed())?,
        })
    }
}

impl Serialize for SourceEventId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SourceEventId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxHash(pub String);

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockHash(pub String);

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Undecoded event as delivered by the source indexer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub name: String,
    pub id: SourceEventId,
    #[serde(default)]
    pub origin_chain: Option<String>,
    #[serde(default)]
    pub origin_address: Option<String>,
    pub chain_address: String,
    pub amount: AmountInput,
    /// Why the indexer could not decode the payload, if it could not
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub malformed: Option<String>,
}

impl RawEvent {
    /// An event whose id is known but whose payload did not decode.
    pub fn malformed(name: impl Into<String>, id: SourceEventId, reason: impl Into<String>) -> Self {
        RawEvent {
            name: name.into(),
            id,
            origin_chain: None,
            origin_address: None,
            chain_address: String::new(),
            amount: AmountInput::Text(String::new()),
            malformed: Some(reason.into()),
        }
    }
}

/// A validated request to move value, derived from a source-chain event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferIntent {
    pub source_chain: String,
    pub source_address: String,
    pub destination_address: String,
    #[serde(with = "hex::serde")]
    pub destination_key: PublicKey,
    pub amount: Amount,
    pub source_event_id: SourceEventId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transport,
    Timeout,
    RpcRejected,
    Dropped,
    Signing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureReason {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Signing failures are final for the intent; everything else may be retried up to the cap.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self.kind, FailureKind::Signing)
    }

    /// Whether the submission may have reached the chain even though it was not acknowledged.
    pub fn outcome_unknown(&self) -> bool {
        matches!(self.kind, FailureKind::Transport | FailureKind::Timeout)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl From<&RelayError> for FailureReason {
    fn from(err: &RelayError) -> Self {
        let kind = match err {
            RelayError::SigningFailure(_) => FailureKind::Signing,
            RelayError::RpcRejected(_) => FailureKind::RpcRejected,
            RelayError::Timeout(_) => FailureKind::Timeout,
            _ => FailureKind::Transport,
        };
        FailureReason::new(kind, err.to_string())
    }
}

/// Status transitions reported for a submitted extrinsic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatus {
    Submitted(TxHash),
    InBlock(BlockHash),
    Finalized(BlockHash),
    Failed(FailureReason),
}

/// Lifecycle state of one submission record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RecordState {
    Seen,
    Validating,
    Validated,
    Rejected { reason: String },
    Submitting,
    Submitted,
    InBlock { block: BlockHash },
    Finalized { block: BlockHash },
    Failed { reason: FailureReason, terminal: bool },
}

impl RecordState {
    pub fn label(&self) -> &'static str {
        match self {
            RecordState::Seen => "Seen",
            RecordState::Validating => "Validating",
            RecordState::Validated => "Validated",
            RecordState::Rejected { .. } => "Rejected",
            RecordState::Submitting => "Submitting",
            RecordState::Submitted => "Submitted",
            RecordState::InBlock { .. } => "InBlock",
            RecordState::Finalized { .. } => "Finalized",
            RecordState::Failed { .. } => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            RecordState::Rejected { .. } | RecordState::Finalized { .. } => true,
            RecordState::Failed { terminal, .. } => *terminal,
            _ => false,
        }
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordState::Rejected { reason } => write!(f, "Rejected({})", reason),
            RecordState::InBlock { block } => write!(f, "InBlock({})", block),
            RecordState::Finalized { block } => write!(f, "Finalized({})", block),
            RecordState::Failed { reason, terminal } => {
                write!(f, "Failed({}{})", reason, if *terminal { ", terminal" } else { "" })
            }
            other => f.write_str(other.label()),
        }
    }
}

/// Tracks the lifecycle of one intent's execution on the destination chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub id: Uuid,
    pub source_event_id: SourceEventId,
    pub event: RawEvent,
    pub intent: Option<TransferIntent>,
    pub state: RecordState,
    pub history: Vec<RecordState>,
    pub destination_tx_hash: Option<TxHash>,
    /// Hashes of earlier attempts the chain reported as dropped or invalid
    #[serde(default)]
    pub abandoned_tx_hashes: Vec<TxHash>,
    /// Nonce of the most recently signed attempt
    #[serde(default)]
    pub nonce: Option<u64>,
    /// Nonce of an attempt whose acceptance is unknown; the next attempt reuses it
    #[serde(default)]
    pub nonce_in_doubt: Option<u64>,
    pub attempts: u32,
    #[serde(default)]
    pub revivals: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubmissionRecord {
    pub fn new(event: RawEvent) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source_event_id: event.id,
            event,
            intent: None,
            state: RecordState::Seen,
            history: vec![RecordState::Seen],
            destination_tx_hash: None,
            abandoned_tx_hashes: Vec::new(),
            nonce: None,
            nonce_in_doubt: None,
            attempts: 0,
            revivals: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn advance(&mut self, state: RecordState) {
        self.history.push(state.clone());
        self.state = state;
        self.updated_at = Utc::now();
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// A terminally failed record can be picked up again by a redelivered event,
    /// provided no submission of it could still land on the destination chain.
    pub fn is_revivable(&self) -> bool {
        matches!(self.state, RecordState::Failed { terminal: true, .. })
            && self.destination_tx_hash.is_none()
            && self.nonce_in_doubt.is_none()
    }

    pub fn history_labels(&self) -> Vec<&'static str> {
        self.history.iter().map(RecordState::label).collect()
    }
}

/// How a validated intent is expressed as a destination-chain call.
/// One shape per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferShape {
    #[default]
    Transfer,
    Deposit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    #[default]
    Testnet,
    Mainnet,
    Devnet,
    Localnet,
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkType::Testnet => "testnet",
            NetworkType::Mainnet => "mainnet",
            NetworkType::Devnet => "devnet",
            NetworkType::Localnet => "localnet",
        };
        f.write_str(name)
    }
}

/// Relayer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayerConfig {
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    pub processing: ProcessingConfig,
    pub storage: StorageConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub indexer_url: String,
    pub network: NetworkType,
    pub package_id: String,
    pub chain_tag: String,
    pub event_names: Vec<String>,
    pub poll_interval_ms: u64,
    pub page_size: u32,
    pub request_timeout_secs: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            indexer_url: "http://127.0.0.1:3001".to_string(),
            network: NetworkType::Testnet,
            package_id: String::new(),
            chain_tag: "sui".to_string(),
            event_names: vec!["asset_moved_event".to_string()],
            poll_interval_ms: 1000,
            page_size: 100,
            request_timeout_secs: 20,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub rpc_url: String,
    pub ss58_format: u16,
    pub signing_key: String,
    pub transfer_shape: TransferShape,
    pub request_timeout_secs: u64,
    pub status_poll_ms: u64,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:9944".to_string(),
            ss58_format: crate::address::DEFAULT_SS58_FORMAT,
            signing_key: String::new(),
            transfer_shape: TransferShape::Transfer,
            request_timeout_secs: 30,
            status_poll_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    pub max_attempts: u32,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    pub submit_timeout_ms: u64,
    pub max_concurrent_submissions: usize,
    /// Largest transferable amount in smallest units; unbounded (u128) when absent
    #[serde(default)]
    pub max_amount: Option<String>,
    pub shutdown_grace_secs: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_initial_ms: 1000,
            retry_max_ms: 30_000,
            submit_timeout_ms: 30_000,
            max_concurrent_submissions: 16,
            max_amount: None,
            shutdown_grace_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub metrics_interval_secs: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_interval_secs: 60,
        }
    }
}

/// Error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Signing failure: {0}")]
    SigningFailure(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("RPC rejected call: {0}")]
    RpcRejected(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Storage error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RelayError {
    /// Validation errors reject the intent outright.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            RelayError::InvalidAddress(_)
                | RelayError::InvalidAmount(_)
                | RelayError::MalformedEvent(_)
        )
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RelayError::Timeout(err.to_string())
        } else {
            RelayError::Transport(err.to_string())
        }
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Store(err.to_string())
    }
}

/// Counters for operator visibility
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayerMetrics {
    pub events_seen: u64,
    pub duplicates_discarded: u64,
    pub rejected: u64,
    pub submissions: u64,
    pub retries: u64,
    pub finalized: u64,
    pub failed: u64,
    pub in_flight: u64,
    pub last_finalized_at: Option<DateTime<Utc>>,
}
