//! Builds, signs and submits destination-chain extrinsics.
//!
//! Signing is serialized behind one lock; nonces come from a [`NonceSequencer`]
//! so several signed extrinsics can be in flight at once. A retry never reuses a
//! signed payload: every attempt rebuilds the call and signs again, optionally
//! pinned to the nonce of an attempt whose outcome is unknown.

use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::address::encode_key;
use crate::chains::{Call, DestinationClient, SignedExtrinsic, Signer, StatusStream};
use crate::types::{
    DestinationConfig, FailureReason, RelayError, TransferIntent, TransferShape, TxHash, TxStatus,
};

/// Monotonic nonce allocation for the relay account.
///
/// Initialised lazily from the chain. A released nonce is handed out again only
/// when it was the most recent allocation; otherwise the sequencer forgets its
/// position and re-reads it from the chain before the next allocation.
#[derive(Default)]
pub struct NonceSequencer {
    next: Mutex<Option<u64>>,
}

impl NonceSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn allocate(
        &self,
        client: &dyn DestinationClient,
        account: &str,
    ) -> Result<u64, RelayError> {
        let mut next = self.next.lock().await;
        let nonce = match *next {
            Some(nonce) => nonce,
            None => {
                let nonce = client.next_nonce(account).await?;
                debug!("Nonce for {} synced from chain: {}", account, nonce);
                nonce
            }
        };
        *next = Some(nonce + 1);
        Ok(nonce)
    }

    /// Give back a nonce that was never accepted by the chain.
    pub async fn release(&self, nonce: u64) {
        let mut next = self.next.lock().await;
        if *next == Some(nonce + 1) {
            *next = Some(nonce);
        } else {
            *next = None;
        }
    }

    pub async fn invalidate(&self) {
        *self.next.lock().await = None;
    }

    pub async fn peek(&self) -> Option<u64> {
        *self.next.lock().await
    }
}

/// A signed extrinsic that has not been submitted yet
#[derive(Debug, Clone)]
pub struct PreparedSubmission {
    pub extrinsic: SignedExtrinsic,
    pub nonce: u64,
    /// Whether the nonce was reused from an earlier attempt rather than allocated
    pub pinned: bool,
}

/// Status transitions of one accepted extrinsic
pub struct SubmissionHandle {
    pub tx_hash: TxHash,
    pending: Option<TxStatus>,
    statuses: StatusStream,
}

impl SubmissionHandle {
    fn new(tx_hash: TxHash, announce: bool, statuses: StatusStream) -> Self {
        let pending = announce.then(|| TxStatus::Submitted(tx_hash.clone()));
        Self {
            tx_hash,
            pending,
            statuses,
        }
    }

    /// Next status, or `None` if tracking ended without a verdict.
    pub async fn next(&mut self) -> Option<TxStatus> {
        if let Some(status) = self.pending.take() {
            return Some(status);
        }
        self.statuses.recv().await
    }
}

pub struct TransactionSubmitter {
    client: Arc<dyn DestinationClient>,
    signer: Arc<dyn Signer>,
    signing_lock: Mutex<()>,
    nonces: NonceSequencer,
    account: String,
    shape: TransferShape,
    ss58_format: u16,
}

impl TransactionSubmitter {
    pub fn new(
        client: Arc<dyn DestinationClient>,
        signer: Arc<dyn Signer>,
        config: &DestinationConfig,
    ) -> Result<Self, RelayError> {
        let account = encode_key(&signer.public_key(), config.ss58_format)?;
        info!(
            "Relay account {} submitting {:?} calls",
            account, config.transfer_shape
        );

        Ok(Self {
            client,
            signer,
            signing_lock: Mutex::new(()),
            nonces: NonceSequencer::new(),
            account,
            shape: config.transfer_shape,
            ss58_format: config.ss58_format,
        })
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn signer_available(&self) -> bool {
        self.signer.is_available()
    }

    /// The one call this deployment's transfer shape produces for `intent`.
    pub fn build_call(&self, intent: &TransferIntent) -> Result<Call, RelayError> {
        let dest = encode_key(&intent.destination_key, self.ss58_format)?;
        let amount = intent.amount.get();

        Ok(match self.shape {
            TransferShape::Transfer => Call::TransferKeepAlive { dest, amount },
            TransferShape::Deposit => Call::Deposit {
                origin_chain: intent.source_chain.clone(),
                origin_address: intent.source_address.clone(),
                dest,
                amount,
            },
        })
    }

    /// Build and sign an extrinsic for `intent`.
    ///
    /// With `pinned_nonce` the extrinsic reuses that nonce instead of allocating
    /// a new one, so it can only ever replace the earlier attempt.
    pub async fn prepare(
        &self,
        intent: &TransferIntent,
        pinned_nonce: Option<u64>,
    ) -> Result<PreparedSubmission, RelayError> {
        let call = self.build_call(intent)?;

        let _guard = self.signing_lock.lock().await;
        let (nonce, pinned) = match pinned_nonce {
            Some(nonce) => (nonce, true),
            None => (
                self.nonces
                    .allocate(self.client.as_ref(), &self.account)
                    .await?,
                false,
            ),
        };

        let signed = match SignedExtrinsic::signing_payload(&call, &self.account, nonce) {
            Ok(payload) => self.signer.sign(&payload).await,
            Err(e) => Err(e),
        };
        let signature = match signed {
            Ok(signature) => signature,
            Err(e) => {
                if !pinned {
                    self.nonces.release(nonce).await;
                }
                return Err(e);
            }
        };

        debug!(
            "Signed extrinsic for {} with nonce {}{}",
            intent.source_event_id,
            nonce,
            if pinned { " (pinned)" } else { "" }
        );

        Ok(PreparedSubmission {
            extrinsic: SignedExtrinsic {
                call,
                signer: self.account.clone(),
                nonce,
                signature: format!("0x{}", hex::encode(signature)),
            },
            nonce,
            pinned,
        })
    }

    /// Submit a prepared extrinsic. Returns once the node accepted it.
    pub async fn send(&self, prepared: &PreparedSubmission) -> Result<SubmissionHandle, RelayError> {
        let hash = match self.client.submit_extrinsic(&prepared.extrinsic).await {
            Ok(hash) => hash,
            Err(e) => {
                // a rejected extrinsic did not consume its nonce
                if matches!(e, RelayError::RpcRejected(_)) && !prepared.pinned {
                    self.nonces.release(prepared.nonce).await;
                }
                return Err(e);
            }
        };

        info!("Extrinsic {} accepted with nonce {}", hash, prepared.nonce);
        let statuses = self.watch_or_fail(&hash).await;
        Ok(SubmissionHandle::new(hash, true, statuses))
    }

    pub async fn submit(
        &self,
        intent: &TransferIntent,
        pinned_nonce: Option<u64>,
    ) -> Result<SubmissionHandle, RelayError> {
        let prepared = self.prepare(intent, pinned_nonce).await?;
        self.send(&prepared).await
    }

    /// Follow an extrinsic accepted earlier, e.g. before a restart.
    pub async fn track(&self, hash: &TxHash) -> SubmissionHandle {
        let statuses = self.watch_or_fail(hash).await;
        SubmissionHandle::new(hash.clone(), false, statuses)
    }

    pub async fn resync_nonce(&self) {
        self.nonces.invalidate().await;
    }

    async fn watch_or_fail(&self, hash: &TxHash) -> StatusStream {
        match self.client.watch(hash).await {
            Ok(statuses) => statuses,
            Err(e) => {
                warn!("Cannot watch extrinsic {}: {}", hash, e);
                let (sender, receiver) = mpsc::channel(1);
                let _ = sender.try_send(TxStatus::Failed(FailureReason::from(&e)));
                receiver
            }
        }
    }
}
