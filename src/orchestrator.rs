use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::Utc;
use log::{debug, error, info, warn};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{
    sync::{watch, RwLock, Semaphore},
    task::JoinSet,
    time::{interval, sleep, timeout},
};

use crate::{
    address,
    amount::AmountValidator,
    store::{Claim, RecordStore},
    submitter::{SubmissionHandle, TransactionSubmitter},
    subscriber::EventStream,
    types::{
        FailureKind, FailureReason, ProcessingConfig, RawEvent, RecordState, RelayError,
        RelayerMetrics, SubmissionRecord, TransferIntent, TxStatus,
    },
};

/// Decode a raw event into a transfer intent.
///
/// Amount first, then the destination address. Pure: the same event always
/// produces the same outcome.
pub fn decode_intent(
    event: &RawEvent,
    default_origin_chain: &str,
    amounts: &AmountValidator,
) -> Result<TransferIntent, RelayError> {
    if let Some(reason) = &event.malformed {
        return Err(RelayError::MalformedEvent(format!(
            "event {} could not be decoded: {}",
            event.id, reason
        )));
    }

    let source_chain = event
        .origin_chain
        .clone()
        .unwrap_or_else(|| default_origin_chain.to_string());
    if source_chain.trim().is_empty() {
        return Err(RelayError::MalformedEvent(format!(
            "event {} has no origin chain",
            event.id
        )));
    }

    let amount = amounts.validate(&event.amount)?;
    let destination_key = address::decode(&event.chain_address)?;

    Ok(TransferIntent {
        source_chain,
        source_address: event.origin_address.clone().unwrap_or_default(),
        destination_address: event.chain_address.trim().to_string(),
        destination_key,
        amount,
        source_event_id: event.id,
    })
}

/// How one submission attempt (or one tracking session) ended
enum Outcome {
    Finalized,
    /// The chain gave a verdict against the extrinsic, or it never got accepted
    Failed(FailureReason),
    /// Tracking of an accepted extrinsic ended without a verdict
    Lost(FailureReason),
}

/// Coordinates the relay pipeline for one event stream: claims and validates
/// events, drives submissions through to finality and records every outcome.
pub struct RelayOrchestrator {
    processing: ProcessingConfig,
    origin_chain: String,
    amounts: AmountValidator,
    store: Arc<dyn RecordStore>,
    submitter: Arc<TransactionSubmitter>,
    metrics: Arc<RwLock<RelayerMetrics>>,
    submission_slots: Arc<Semaphore>,
    metrics_interval: Duration,
    halt: watch::Sender<Option<String>>,
}

impl RelayOrchestrator {
    pub fn new(
        processing: ProcessingConfig,
        origin_chain: impl Into<String>,
        store: Arc<dyn RecordStore>,
        submitter: Arc<TransactionSubmitter>,
    ) -> Result<Self, RelayError> {
        let amounts = AmountValidator::from_setting(processing.max_amount.as_deref())?;
        let submission_slots = Arc::new(Semaphore::new(processing.max_concurrent_submissions.max(1)));
        let (halt, _) = watch::channel(None);

        Ok(Self {
            processing,
            origin_chain: origin_chain.into(),
            amounts,
            store,
            submitter,
            metrics: Arc::new(RwLock::new(RelayerMetrics::default())),
            submission_slots,
            metrics_interval: Duration::from_secs(60),
            halt,
        })
    }

    pub fn with_metrics_interval(mut self, every: Duration) -> Self {
        self.metrics_interval = every.max(Duration::from_secs(1));
        self
    }

    /// Get current metrics
    pub async fn metrics(&self) -> RelayerMetrics {
        self.metrics.read().await.clone()
    }

    /// Process events until the stream ends, `shutdown` resolves, the signer
    /// becomes unusable, or an event cannot be claimed.
    ///
    /// Unfinished records from the store are picked up first. On exit, in-flight
    /// transfers get `shutdown_grace_secs` to settle; anything still open stays
    /// persisted and is recovered on the next start.
    pub async fn run<F>(self: Arc<Self>, mut events: EventStream, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()>,
    {
        info!("Starting relay orchestrator");

        let mut tasks = JoinSet::new();
        self.recover(&mut tasks).await?;

        let mut halted = self.halt.subscribe();
        let mut report = interval(self.metrics_interval);
        report.tick().await;
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_event(event, &mut tasks).await {
                            break Err(e);
                        }
                    }
                    None => {
                        info!("Event stream ended");
                        break Ok(());
                    }
                },
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break Ok(());
                }
                changed = halted.changed() => {
                    let reason = halted.borrow().clone();
                    if let (Ok(()), Some(reason)) = (changed, reason) {
                        error!("Signer unavailable, halting relay: {}", reason);
                        break Err(RelayError::SigningFailure(reason));
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("Relay task aborted: {}", e);
                    }
                }
                _ = report.tick() => self.log_metrics().await,
            }
        };

        drop(events);
        self.drain(tasks).await;
        self.log_metrics().await;
        result
    }

    async fn recover(self: &Arc<Self>, tasks: &mut JoinSet<()>) -> Result<(), RelayError> {
        let pending = self.store.non_terminal().await?;
        if pending.is_empty() {
            return Ok(());
        }

        info!("Recovering {} unfinished transfers", pending.len());
        for mut record in pending {
            match record.state {
                RecordState::Seen | RecordState::Validating => {
                    if self.validate(&mut record).await {
                        self.spawn_drive(record, tasks);
                    }
                }
                RecordState::Submitting if record.destination_tx_hash.is_none() => {
                    // the interrupted attempt may have been accepted
                    record.nonce_in_doubt = record.nonce_in_doubt.or(record.nonce);
                    self.spawn_drive(record, tasks);
                }
                _ => {
                    debug!(
                        "Resuming {} from {}",
                        record.source_event_id, record.state
                    );
                    self.spawn_drive(record, tasks);
                }
            }
        }
        Ok(())
    }

    /// Claim, validate and hand off one event. An error means the event could
    /// not be claimed and ingestion has to stop.
    async fn handle_event(
        self: &Arc<Self>,
        event: RawEvent,
        tasks: &mut JoinSet<()>,
    ) -> Result<(), RelayError> {
        self.metrics.write().await.events_seen += 1;

        let claim = match self.store.claim(&event).await {
            Ok(claim) => claim,
            Err(e) => {
                // later claims would carry the low-water mark past this event
                error!("Failed to claim event {}, stopping ingestion: {}", event.id, e);
                return Err(e);
            }
        };

        let mut record = match claim {
            Claim::Fresh(record) => {
                debug!("New event {} ({})", record.source_event_id, record.id);
                record
            }
            Claim::Revived(record) => {
                info!(
                    "Redelivered event {} revives failed transfer {} (revival {})",
                    record.source_event_id, record.id, record.revivals
                );
                record
            }
            Claim::Duplicate(state) => {
                debug!("Discarding duplicate event {} ({})", event.id, state);
                self.metrics.write().await.duplicates_discarded += 1;
                return Ok(());
            }
        };

        if self.validate(&mut record).await {
            self.spawn_drive(record, tasks);
        }
        Ok(())
    }

    /// Validating → Validated, or → Rejected (terminal, archived).
    async fn validate(&self, record: &mut SubmissionRecord) -> bool {
        record.advance(RecordState::Validating);
        self.persist(record).await;

        match decode_intent(&record.event, &self.origin_chain, &self.amounts) {
            Ok(intent) => {
                record.intent = Some(intent);
                record.advance(RecordState::Validated);
                self.persist(record).await;
                true
            }
            Err(e) => {
                warn!("Transfer {} rejected: {}", record.source_event_id, e);
                record.advance(RecordState::Rejected {
                    reason: e.to_string(),
                });
                self.persist(record).await;
                if let Err(e) = self.store.archive(&record.source_event_id).await {
                    error!("Failed to archive {}: {}", record.source_event_id, e);
                }
                self.metrics.write().await.rejected += 1;
                false
            }
        }
    }

    fn spawn_drive(self: &Arc<Self>, record: SubmissionRecord, tasks: &mut JoinSet<()>) {
        let orchestrator = Arc::clone(self);
        let slots = Arc::clone(&self.submission_slots);

        tasks.spawn(async move {
            let _permit = match slots.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            orchestrator.metrics.write().await.in_flight += 1;
            orchestrator.drive(record).await;
            orchestrator.metrics.write().await.in_flight -= 1;
        });
    }

    fn retry_backoff(&self) -> ExponentialBackoff {
        let initial = Duration::from_millis(self.processing.retry_initial_ms.max(1));
        ExponentialBackoffBuilder::new()
            .with_initial_interval(initial)
            .with_max_interval(Duration::from_millis(self.processing.retry_max_ms).max(initial))
            .with_max_elapsed_time(None)
            .build()
    }

    /// Submit and track until a terminal state, retrying recoverable failures
    /// with backoff up to `max_attempts` submissions.
    async fn drive(&self, mut record: SubmissionRecord) {
        let Some(intent) = record.intent.clone() else {
            error!(
                "Transfer {} has no validated intent, cannot submit",
                record.source_event_id
            );
            return;
        };

        let max_attempts = self.processing.max_attempts.max(1);
        let max_delay = Duration::from_millis(self.processing.retry_max_ms);
        let mut backoff = self.retry_backoff();
        let mut tracking_losses = 0u32;

        loop {
            let outcome = match record.destination_tx_hash.clone() {
                Some(hash) => {
                    let handle = self.submitter.track(&hash).await;
                    self.follow(&mut record, handle).await
                }
                None => self.attempt(&mut record, &intent).await,
            };

            match outcome {
                Outcome::Finalized => {
                    self.finish(&record).await;
                    return;
                }
                Outcome::Lost(reason) if tracking_losses + 1 < max_attempts => {
                    tracking_losses += 1;
                    warn!(
                        "Lost track of {} for {} ({}), watching again",
                        record
                            .destination_tx_hash
                            .as_ref()
                            .map(|h| h.to_string())
                            .unwrap_or_default(),
                        record.source_event_id,
                        reason
                    );
                }
                Outcome::Lost(reason) => {
                    self.fail(&mut record, reason).await;
                    return;
                }
                Outcome::Failed(reason) => {
                    if !reason.is_recoverable() || record.attempts >= max_attempts {
                        self.fail(&mut record, reason).await;
                        return;
                    }

                    warn!(
                        "Attempt {}/{} for {} failed: {}",
                        record.attempts, max_attempts, record.source_event_id, reason
                    );
                    record.advance(RecordState::Failed {
                        reason,
                        terminal: false,
                    });
                    self.persist(&record).await;
                    self.metrics.write().await.retries += 1;
                }
            }

            sleep(backoff.next_backoff().unwrap_or(max_delay)).await;
        }
    }

    /// One submission: sign, submit under the attempt timeout, then follow.
    async fn attempt(&self, record: &mut SubmissionRecord, intent: &TransferIntent) -> Outcome {
        record.attempts += 1;
        record.advance(RecordState::Submitting);
        self.persist(record).await;
        self.metrics.write().await.submissions += 1;

        let prepared = match self.submitter.prepare(intent, record.nonce_in_doubt).await {
            Ok(prepared) => prepared,
            Err(e) => return Outcome::Failed(FailureReason::from(&e)),
        };
        record.nonce = Some(prepared.nonce);
        self.persist(record).await;

        let submit_timeout = Duration::from_millis(self.processing.submit_timeout_ms.max(1));
        let handle = match timeout(submit_timeout, self.submitter.send(&prepared)).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                let reason = FailureReason::from(&e);
                if reason.outcome_unknown() {
                    record.nonce_in_doubt = Some(prepared.nonce);
                }
                return Outcome::Failed(reason);
            }
            Err(_) => {
                record.nonce_in_doubt = Some(prepared.nonce);
                return Outcome::Failed(FailureReason::new(
                    FailureKind::Timeout,
                    format!("submission not acknowledged within {:?}", submit_timeout),
                ));
            }
        };

        self.follow(record, handle).await
    }

    async fn follow(&self, record: &mut SubmissionRecord, mut handle: SubmissionHandle) -> Outcome {
        while let Some(status) = handle.next().await {
            match status {
                TxStatus::Submitted(hash) => {
                    info!("Transfer {} submitted as {}", record.source_event_id, hash);
                    record.destination_tx_hash = Some(hash);
                    record.nonce_in_doubt = None;
                    record.advance(RecordState::Submitted);
                    self.persist(record).await;
                }
                TxStatus::InBlock(block) => {
                    debug!("Transfer {} included in {}", record.source_event_id, block);
                    record.advance(RecordState::InBlock { block });
                    self.persist(record).await;
                }
                TxStatus::Finalized(block) => {
                    record.advance(RecordState::Finalized { block });
                    self.persist(record).await;
                    return Outcome::Finalized;
                }
                TxStatus::Failed(reason) => match reason.kind {
                    FailureKind::Dropped | FailureKind::RpcRejected => {
                        if let Some(hash) = record.destination_tx_hash.take() {
                            record.abandoned_tx_hashes.push(hash);
                        }
                        // the replacement may only reuse the same nonce
                        record.nonce_in_doubt = record.nonce;
                        return Outcome::Failed(reason);
                    }
                    _ => return Outcome::Lost(reason),
                },
            }
        }

        Outcome::Lost(FailureReason::new(
            FailureKind::Transport,
            format!("status stream for {} closed", handle.tx_hash),
        ))
    }

    async fn finish(&self, record: &SubmissionRecord) {
        info!(
            "Transfer {} finalized: {} (tx {}, {} attempt(s))",
            record.source_event_id,
            record.state,
            record
                .destination_tx_hash
                .as_ref()
                .map(|h| h.to_string())
                .unwrap_or_default(),
            record.attempts
        );

        if let Err(e) = self.store.archive(&record.source_event_id).await {
            error!("Failed to archive {}: {}", record.source_event_id, e);
        }

        let mut metrics = self.metrics.write().await;
        metrics.finalized += 1;
        metrics.last_finalized_at = Some(Utc::now());
    }

    async fn fail(&self, record: &mut SubmissionRecord, reason: FailureReason) {
        error!(
            "Transfer {} failed permanently after {} attempt(s): {}. Operator attention required",
            record.source_event_id, record.attempts, reason
        );

        let signing = reason.kind == FailureKind::Signing;
        record.advance(RecordState::Failed {
            reason: reason.clone(),
            terminal: true,
        });
        self.persist(record).await;
        self.metrics.write().await.failed += 1;

        if record.nonce_in_doubt.is_some() {
            // a pinned nonce that is never filled would stall later extrinsics
            self.submitter.resync_nonce().await;
        }
        if signing && !self.submitter.signer_available() {
            self.halt.send_replace(Some(reason.message));
        }
    }

    async fn persist(&self, record: &SubmissionRecord) {
        if let Err(e) = self.store.update(record).await {
            error!(
                "Failed to persist transfer {} in state {}: {}",
                record.source_event_id, record.state, e
            );
        }
    }

    async fn drain(&self, mut tasks: JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }

        let grace = Duration::from_secs(self.processing.shutdown_grace_secs);
        info!(
            "Waiting up to {:?} for {} in-flight transfers",
            grace,
            tasks.len()
        );

        let drained = timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!("Relay task aborted: {}", e);
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "{} transfers still in flight; they resume from the store on next start",
                tasks.len()
            );
            tasks.abort_all();
        }
    }

    async fn log_metrics(&self) {
        let m = self.metrics.read().await;
        info!(
            "Relay metrics: seen={} duplicates={} rejected={} submissions={} retries={} finalized={} failed={} in_flight={}",
            m.events_seen,
            m.duplicates_discarded,
            m.rejected,
            m.submissions,
            m.retries,
            m.finalized,
            m.failed,
            m.in_flight
        );
    }
}
