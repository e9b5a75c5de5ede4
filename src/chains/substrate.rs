//! JSON-RPC 2.0 client for the destination relay gateway.
//!
//! The relayer does not speak SCALE. It talks to a gateway sitting in front of
//! the Substrate node, which owns extrinsic encoding and pool subscriptions and
//! exposes three methods:
//!
//! - `system_accountNextIndex(account) -> u64`, as on the node itself
//! - `author_submitExtrinsic(hex) -> hash`, where `hex` is the hex-encoded JSON
//!   of a [`SignedExtrinsic`] (call, signer, nonce, signature over the signing
//!   payload); the gateway verifies the signature, builds the real
//!   `balances.transferKeepAlive` or deposit extrinsic and submits it
//! - `relay_extrinsicStatus(hash) -> { status, block?, reason? }`, where
//!   `status` is one of the node's pool statuses (`ready`, `inBlock`,
//!   `finalized`, `invalid`, `dropped`, `usurped`, ...)
//!
//! Pointing `destination.rpc_url` straight at a node does not work.

use async_trait::async_trait;
use log::{debug, warn};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::mpsc, time::sleep};

use super::{DestinationClient, SignedExtrinsic, StatusStream};
use crate::types::{
    BlockHash, DestinationConfig, FailureKind, FailureReason, RelayError, TxHash, TxStatus,
};

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

/// Reply of `relay_extrinsicStatus`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtrinsicStatus {
    pub status: String,
    #[serde(default)]
    pub block: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// What the watcher should do with one polled status
#[derive(Debug, PartialEq, Eq)]
enum PollStep {
    Wait,
    Emit(TxStatus),
    Finish(TxStatus),
}

fn interpret(status: &ExtrinsicStatus) -> PollStep {
    let block = || BlockHash(status.block.clone().unwrap_or_default());
    let reason = || status.reason.clone().unwrap_or_else(|| status.status.clone());

    match status.status.as_str() {
        "inBlock" => PollStep::Emit(TxStatus::InBlock(block())),
        "finalized" => PollStep::Finish(TxStatus::Finalized(block())),
        "invalid" => PollStep::Finish(TxStatus::Failed(FailureReason::new(
            FailureKind::RpcRejected,
            reason(),
        ))),
        "dropped" | "usurped" => PollStep::Finish(TxStatus::Failed(FailureReason::new(
            FailureKind::Dropped,
            reason(),
        ))),
        // ready, future, broadcast, retracted, finalityTimeout: inclusion still open
        _ => PollStep::Wait,
    }
}

#[derive(Clone)]
pub struct JsonRpcClient {
    http: reqwest::Client,
    url: String,
    next_id: Arc<AtomicU64>,
    status_poll: Duration,
}

impl JsonRpcClient {
    pub fn new(config: &DestinationConfig) -> Result<Self, RelayError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| RelayError::Config(format!("Invalid RPC client: {}", e)))?;

        Ok(Self {
            http,
            url: config.rpc_url.clone(),
            next_id: Arc::new(AtomicU64::new(1)),
            status_poll: Duration::from_millis(config.status_poll_ms.max(1)),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RelayError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        debug!("RPC request {} {}", id, method);
        let response = self.http.post(&self.url).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(RelayError::Transport(format!(
                "{} returned HTTP {}",
                method,
                response.status()
            )));
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| RelayError::Transport(format!("{}: unreadable response: {}", method, e)))?;

        if let Some(error) = body.error {
            let detail = error.data.map(|d| format!(" ({})", d)).unwrap_or_default();
            return Err(RelayError::RpcRejected(format!(
                "{} failed with code {}: {}{}",
                method, error.code, error.message, detail
            )));
        }

        let result = body
            .result
            .ok_or_else(|| RelayError::Transport(format!("{}: empty result", method)))?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn extrinsic_status(&self, hash: &TxHash) -> Result<ExtrinsicStatus, RelayError> {
        self.call("relay_extrinsicStatus", json!([hash.0])).await
    }
}

#[async_trait]
impl DestinationClient for JsonRpcClient {
    async fn next_nonce(&self, account: &str) -> Result<u64, RelayError> {
        self.call("system_accountNextIndex", json!([account])).await
    }

    async fn submit_extrinsic(&self, extrinsic: &SignedExtrinsic) -> Result<TxHash, RelayError> {
        let hash: String = self
            .call("author_submitExtrinsic", json!([extrinsic.encode()?]))
            .await?;
        Ok(TxHash(hash))
    }

    async fn watch(&self, hash: &TxHash) -> Result<StatusStream, RelayError> {
        let (sender, receiver) = mpsc::channel(8);
        let client = self.clone();
        let hash = hash.clone();

        tokio::spawn(async move {
            let mut last_block: Option<BlockHash> = None;
            loop {
                if sender.is_closed() {
                    return;
                }

                match client.extrinsic_status(&hash).await {
                    Ok(status) => match interpret(&status) {
                        PollStep::Wait => {}
                        PollStep::Emit(TxStatus::InBlock(block)) => {
                            // re-emit only when the including block changes (retraction)
                            if last_block.as_ref() != Some(&block) {
                                last_block = Some(block.clone());
                                if sender.send(TxStatus::InBlock(block)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        PollStep::Emit(other) => {
                            if sender.send(other).await.is_err() {
                                return;
                            }
                        }
                        PollStep::Finish(terminal) => {
                            let _ = sender.send(terminal).await;
                            return;
                        }
                    },
                    // the extrinsic was accepted, so a failed poll never concludes anything
                    Err(e) => warn!("Status poll for {} failed: {}", hash, e),
                }

                sleep(client.status_poll).await;
            }
        });

        Ok(receiver)
    }
}
