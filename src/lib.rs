//! Dubhe asset-movement relayer.
//!
//! Watches a source chain's indexer for asset movement events, validates the
//! destination address and amount, and submits the matching transfer on a
//! Substrate-style destination chain, tracking it to finality. Every source event
//! id is processed at most once; outcomes are recorded in a [`store::RecordStore`].

pub mod address;
pub mod amount;
pub mod chains;
pub mod config;
pub mod orchestrator;
pub mod store;
pub mod submitter;
pub mod subscriber;
pub mod types;

pub use amount::{Amount, AmountInput, AmountValidator};
pub use orchestrator::{decode_intent, RelayOrchestrator};
pub use store::{Claim, FileStore, MemoryStore, RecordStore};
pub use submitter::{NonceSequencer, SubmissionHandle, TransactionSubmitter};
pub use subscriber::{EventStream, EventSubscriber};
pub use types::{
    RawEvent, RecordState, RelayError, RelayerConfig, RelayerMetrics, SourceEventId,
    SubmissionRecord, TransferIntent, TxHash, TxStatus,
};
