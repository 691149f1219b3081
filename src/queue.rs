//! Async settlement queue
//!
//! Treasury-funded ledger writes (reward payouts, diploma reveals, forum
//! posts) are enqueued and settled by a single sequential worker, so
//! submission order is deterministic and the treasury's coin fragments are
//! never contended by parallel builders. Failed jobs retry with capped
//! exponential backoff; jobs past their attempt ceiling land in a
//! dead-letter list for operator inspection.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::store::ReservationStore;
use crate::ledger::payload::{encode, PostPayload, ProtocolPayload};
use crate::ledger::rpc::LedgerRpc;
use crate::mint::{MintReservationManager, ReservationStatus};
use crate::types::{Result, SettlementError};
use crate::utxo::{ReservationGuard, UtxoReservationManager};

/// Flat fee budgeted per settlement transaction
const FEE_SOMPI: u64 = 10_000;

/// Work the settlement worker knows how to perform
#[derive(Debug, Clone)]
pub enum SettlementJob {
    /// Pay a course completion reward from the treasury
    RewardPayout {
        recipient: String,
        amount_sompi: u64,
    },
    /// Broadcast the reveal transaction for a paid mint reservation
    DiplomaMint { reservation_id: String },
    /// Broadcast a forum post into a conversation
    ForumPost {
        author: String,
        conversation_id: String,
        content: String,
    },
}

impl SettlementJob {
    pub fn kind(&self) -> &'static str {
        match self {
            SettlementJob::RewardPayout { .. } => "reward_payout",
            SettlementJob::DiplomaMint { .. } => "diploma_mint",
            SettlementJob::ForumPost { .. } => "forum_post",
        }
    }
}

/// A job together with its retry bookkeeping
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: String,
    pub job: SettlementJob,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// A job that exhausted its attempts or failed unrecoverably
#[derive(Debug, Clone)]
pub struct FailedJob {
    pub job: QueuedJob,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Retry tunables
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(60),
        }
    }
}

/// Performs one settlement job against the ledger
#[async_trait::async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &SettlementJob) -> Result<String>;
}

/// Handle for enqueueing settlement work
pub struct SettlementQueue {
    sender: mpsc::UnboundedSender<QueuedJob>,
    dead_letter: Arc<Mutex<Vec<FailedJob>>>,
}

impl SettlementQueue {
    /// Queue a job for sequential settlement; returns its job id
    pub fn enqueue(&self, job: SettlementJob) -> Result<String> {
        let queued = QueuedJob {
            id: Uuid::new_v4().to_string(),
            job,
            attempts: 0,
            enqueued_at: Utc::now(),
        };
        let id = queued.id.clone();
        debug!(job = %id, kind = queued.job.kind(), "Enqueued settlement job");
        self.sender
            .send(queued)
            .map_err(|_| SettlementError::Inconsistent("settlement worker is gone".into()))?;
        Ok(id)
    }

    /// Snapshot of the dead-letter list
    pub fn failed_jobs(&self) -> Vec<FailedJob> {
        self.dead_letter
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

/// Spawn the settlement worker, returning the enqueue handle
///
/// One worker per process: settlement order matters, and a single
/// consumer makes the treasury's fragment locking trivially contention
/// free.
pub fn spawn_settlement_worker(
    executor: Arc<dyn JobExecutor>,
    config: QueueConfig,
) -> (SettlementQueue, JoinHandle<()>) {
    let (sender, mut receiver) = mpsc::unbounded_channel::<QueuedJob>();
    let dead_letter: Arc<Mutex<Vec<FailedJob>>> = Arc::new(Mutex::new(Vec::new()));

    let queue = SettlementQueue {
        sender: sender.clone(),
        dead_letter: Arc::clone(&dead_letter),
    };

    info!(max_attempts = config.max_attempts, "Starting settlement worker");
    let handle = tokio::spawn(async move {
        while let Some(mut queued) = receiver.recv().await {
            queued.attempts += 1;
            match executor.execute(&queued.job).await {
                Ok(tx_hash) => {
                    info!(
                        job = %queued.id,
                        kind = queued.job.kind(),
                        attempts = queued.attempts,
                        tx_hash = %tx_hash,
                        "Settlement job complete"
                    );
                }
                Err(e) if e.is_transient() && queued.attempts < config.max_attempts => {
                    let delay = backoff_delay(&config, queued.attempts);
                    warn!(
                        job = %queued.id,
                        kind = queued.job.kind(),
                        attempts = queued.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Settlement job failed, retrying"
                    );
                    let retry_sender = sender.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        // Worker gone means shutdown; drop the job
                        let _ = retry_sender.send(queued);
                    });
                }
                Err(e) => {
                    warn!(
                        job = %queued.id,
                        kind = queued.job.kind(),
                        attempts = queued.attempts,
                        error = %e,
                        "Settlement job dead-lettered"
                    );
                    dead_letter
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .push(FailedJob {
                            job: queued,
                            error: e.to_string(),
                            failed_at: Utc::now(),
                        });
                }
            }
        }
        debug!("Settlement worker shutting down");
    });

    (queue, handle)
}

/// Exponential backoff with jitter, capped
fn backoff_delay(config: &QueueConfig, attempts: u32) -> Duration {
    let exp = config
        .backoff_base
        .saturating_mul(1u32 << (attempts.saturating_sub(1)).min(16));
    let capped = exp.min(config.backoff_cap);
    let jitter_ceiling = (config.backoff_base.as_millis() as u64 / 2).max(1);
    let jitter = rand::thread_rng().gen_range(0..jitter_ceiling);
    capped + Duration::from_millis(jitter)
}

/// Production executor: settles jobs out of the treasury wallet
pub struct LedgerExecutor {
    rpc: Arc<dyn LedgerRpc>,
    utxos: Arc<UtxoReservationManager>,
    mint: Arc<MintReservationManager>,
    reservations: Arc<dyn ReservationStore>,
    /// Treasury address all queue-settled transactions spend from
    funding_address: String,
}

impl LedgerExecutor {
    pub fn new(
        rpc: Arc<dyn LedgerRpc>,
        utxos: Arc<UtxoReservationManager>,
        mint: Arc<MintReservationManager>,
        reservations: Arc<dyn ReservationStore>,
        funding_address: impl Into<String>,
    ) -> Self {
        Self {
            rpc,
            utxos,
            mint,
            reservations,
            funding_address: funding_address.into(),
        }
    }

    /// Lock treasury fragments covering `amount`, build and submit a
    /// transaction, and mark the fragments spent only after the node
    /// accepted it
    async fn submit_funded(
        &self,
        amount_sompi: u64,
        recipient: Option<&str>,
        payload: Option<&str>,
        purpose: &str,
    ) -> Result<String> {
        let available = self
            .rpc
            .fetch_spendable_fragments(&self.funding_address)
            .await?;

        let required = amount_sompi.saturating_add(FEE_SOMPI);
        let reservation = self
            .utxos
            .select_and_reserve(&available, required, purpose)
            .ok_or_else(|| {
                // Transient by design: fragments free up as earlier jobs
                // confirm, so the retry path is the right response
                SettlementError::TransientLedger(format!(
                    "treasury cannot cover {required} sompi for {purpose}"
                ))
            })?;
        let guard = ReservationGuard::new(Arc::clone(&self.utxos), reservation);

        let raw_tx = build_raw_transaction(
            guard.reservation().fragments.iter(),
            &self.funding_address,
            recipient,
            amount_sompi,
            payload,
        );

        let tx_hash = self.rpc.submit_transaction(&raw_tx).await?;
        guard.commit(&tx_hash);
        Ok(tx_hash)
    }
}

#[async_trait::async_trait]
impl JobExecutor for LedgerExecutor {
    async fn execute(&self, job: &SettlementJob) -> Result<String> {
        match job {
            SettlementJob::RewardPayout {
                recipient,
                amount_sompi,
            } => {
                self.submit_funded(*amount_sompi, Some(recipient), None, "reward_payout")
                    .await
            }

            SettlementJob::DiplomaMint { reservation_id } => {
                let reservation =
                    self.reservations.get(reservation_id).await?.ok_or_else(|| {
                        SettlementError::NotFound(format!("mint reservation {reservation_id}"))
                    })?;
                if reservation.status != ReservationStatus::Paid {
                    return Err(SettlementError::InvalidState {
                        expected: "paid",
                        actual: reservation.status.as_str().to_string(),
                    });
                }
                // A reservation can age out while waiting in the queue
                // (retry backoff, slow worker). Once the deadline passed
                // the sweep owns the record and will recycle its token
                // id, so no reveal may reach the ledger
                if reservation.is_expired(Utc::now()) {
                    return Err(SettlementError::Expired {
                        reservation_id: reservation_id.clone(),
                    });
                }

                let tx_hash = self
                    .submit_funded(
                        0,
                        Some(&reservation.recipient_address),
                        Some(&reservation.mint_payload),
                        "diploma_mint",
                    )
                    .await?;
                // The reveal is on-chain now; finalize even if the
                // deadline slipped between the check and the broadcast
                self.mint
                    .finalize_broadcast(reservation_id, &tx_hash)
                    .await?;
                Ok(tx_hash)
            }

            SettlementJob::ForumPost {
                author,
                conversation_id,
                content,
            } => {
                let payload = encode(&ProtocolPayload::Post(PostPayload {
                    conversation_id: conversation_id.clone(),
                    author: author.clone(),
                    content: content.clone(),
                    timestamp: Utc::now().timestamp(),
                }));
                self.submit_funded(0, None, Some(&payload), "forum_post")
                    .await
            }
        }
    }
}

/// Assemble the node-facing transaction body
///
/// The node signs with the treasury key it holds; the core only names
/// inputs, destination, and payload.
fn build_raw_transaction<'a>(
    inputs: impl Iterator<Item = &'a crate::ledger::types::CoinFragment>,
    change_address: &str,
    recipient: Option<&str>,
    amount_sompi: u64,
    payload: Option<&str>,
) -> String {
    let inputs: Vec<serde_json::Value> = inputs
        .map(|f| {
            serde_json::json!({
                "transaction_id": f.outpoint.transaction_id,
                "output_index": f.outpoint.output_index,
            })
        })
        .collect();

    serde_json::json!({
        "inputs": inputs,
        "recipient": recipient,
        "amount": amount_sompi,
        "change_address": change_address,
        "payload": payload,
        "fee": FEE_SOMPI,
    })
    .to_string()
}
