pub mod indexer;
pub mod signer;
pub mod substrate;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::{RawEvent, RelayError, SourceEventId, TxHash, TxStatus};

pub use indexer::HttpIndexerSource;
pub use signer::Ed25519Signer;
pub use substrate::JsonRpcClient;

/// Status updates for one extrinsic, closed once a terminal status was sent
pub type StatusStream = mpsc::Receiver<TxStatus>;

/// Capability for reading named events from the source chain's indexer
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Open a connection that delivers events strictly after `resume_after`.
    async fn connect(
        &self,
        event_names: &[String],
        resume_after: Option<SourceEventId>,
    ) -> Result<Box<dyn EventConnection>, RelayError>;
}

/// One live connection to the indexer. `Ok(None)` means the remote closed it.
#[async_trait]
pub trait EventConnection: Send {
    async fn next_event(&mut self) -> Result<Option<RawEvent>, RelayError>;
}

/// Capability for talking to the destination chain's RPC
#[async_trait]
pub trait DestinationClient: Send + Sync {
    /// Next usable nonce for `account`, including transactions already in the pool.
    async fn next_nonce(&self, account: &str) -> Result<u64, RelayError>;

    /// Submit a signed extrinsic. Returns once the node accepted it.
    async fn submit_extrinsic(&self, extrinsic: &SignedExtrinsic) -> Result<TxHash, RelayError>;

    /// Follow an accepted extrinsic until it is finalized or definitively failed.
    async fn watch(&self, hash: &TxHash) -> Result<StatusStream, RelayError>;
}

/// Exclusive signing capability for the relay account
#[async_trait]
pub trait Signer: Send + Sync {
    fn public_key(&self) -> [u8; 32];

    async fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, RelayError>;

    /// False once the signer can no longer produce signatures at all.
    fn is_available(&self) -> bool {
        true
    }
}

/// Destination-chain call built for a transfer intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum Call {
    /// `balances.transfer_keep_alive`
    TransferKeepAlive { dest: String, amount: u128 },
    /// Bridge deposit carrying the origin chain tag and origin address
    Deposit {
        origin_chain: String,
        origin_address: String,
        dest: String,
        amount: u128,
    },
}

/// A call signed by the relay account, ready for submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedExtrinsic {
    pub call: Call,
    pub signer: String,
    pub nonce: u64,
    pub signature: String,
}

impl SignedExtrinsic {
    /// Bytes covered by the signature.
    pub fn signing_payload(call: &Call, signer: &str, nonce: u64) -> Result<Vec<u8>, RelayError> {
        Ok(serde_json::to_vec(&(call, signer, nonce))?)
    }

    /// Hex wire form accepted by `author_submitExtrinsic`.
    pub fn encode(&self) -> Result<String, RelayError> {
        Ok(format!("0x{}", hex::encode(serde_json::to_vec(self)?)))
    }

    pub fn decode(encoded: &str) -> Result<Self, RelayError> {
        let bytes = hex::decode(encoded.trim_start_matches("0x"))
            .map_err(|e| RelayError::Serialization(e.to_string()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
