//! Settlement service facade
//!
//! The one surface the platform talks to. Composes the mint state
//! machine, the reconciliation engine, and the settlement queue, and
//! applies the eligibility gate in front of everything that spends from
//! the treasury.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::mint::{MintReservation, MintReservationManager};
use crate::queue::{FailedJob, SettlementJob, SettlementQueue};
use crate::reconcile::{ConversationRecord, ReconciliationEngine};
use crate::types::{Result, SettlementError};

/// Anti-abuse gate in front of treasury-funded operations
#[async_trait]
pub trait WhitelistGate: Send + Sync {
    /// Err(NotEligible) when the address may not receive rewards or mints
    async fn check(&self, address: &str) -> Result<()>;
}

/// Gate that admits everyone (dev mode)
pub struct OpenGate;

#[async_trait]
impl WhitelistGate for OpenGate {
    async fn check(&self, _address: &str) -> Result<()> {
        Ok(())
    }
}

/// Fixed-membership whitelist
pub struct StaticWhitelist {
    allowed: HashSet<String>,
}

impl StaticWhitelist {
    pub fn new(addresses: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed: addresses.into_iter().collect(),
        }
    }
}

#[async_trait]
impl WhitelistGate for StaticWhitelist {
    async fn check(&self, address: &str) -> Result<()> {
        if self.allowed.contains(address) {
            Ok(())
        } else {
            Err(SettlementError::NotEligible(format!(
                "address {address} is not whitelisted"
            )))
        }
    }
}

/// Composed settlement and reconciliation service
pub struct SettlementService {
    mint: Arc<MintReservationManager>,
    engine: Arc<ReconciliationEngine>,
    queue: SettlementQueue,
    gate: Arc<dyn WhitelistGate>,
}

impl SettlementService {
    pub fn new(
        mint: Arc<MintReservationManager>,
        engine: Arc<ReconciliationEngine>,
        queue: SettlementQueue,
        gate: Arc<dyn WhitelistGate>,
    ) -> Self {
        Self {
            mint,
            engine,
            queue,
            gate,
        }
    }

    /// Begin a diploma mint: reserve a token id and hand back the commit
    /// address the learner's wallet must fund
    pub async fn reserve_mint(
        &self,
        certificate_id: &str,
        course_id: &str,
        recipient_address: &str,
    ) -> Result<MintReservation> {
        self.gate.check(recipient_address).await?;
        self.mint
            .create_reservation(certificate_id, course_id, recipient_address)
            .await
    }

    /// Record the funded commit transaction and queue the reveal
    ///
    /// Returns the settlement job id; the reveal broadcast and the final
    /// `Minted` transition happen on the worker.
    pub async fn confirm_mint(
        &self,
        reservation_id: &str,
        commit_tx_hash: &str,
    ) -> Result<String> {
        self.mint.mark_paid(reservation_id, commit_tx_hash).await?;
        self.queue.enqueue(SettlementJob::DiplomaMint {
            reservation_id: reservation_id.to_string(),
        })
    }

    /// Abort a mint flow, releasing its token id immediately
    pub async fn cancel_mint(&self, reservation_id: &str) -> Result<()> {
        self.mint.cancel_reservation(reservation_id).await
    }

    /// The unexpired active reservation for a certificate, if any
    pub async fn get_active_reservation(
        &self,
        certificate_id: &str,
    ) -> Result<Option<MintReservation>> {
        self.mint.get_active_reservation(certificate_id).await
    }

    /// Queue a course completion reward payout
    pub async fn enqueue_reward(&self, recipient: &str, amount_sompi: u64) -> Result<String> {
        self.gate.check(recipient).await?;
        if amount_sompi == 0 {
            return Err(SettlementError::Config(
                "reward amount must be positive".into(),
            ));
        }
        let job_id = self.queue.enqueue(SettlementJob::RewardPayout {
            recipient: recipient.to_string(),
            amount_sompi,
        })?;
        info!(recipient = %recipient, amount_sompi, job = %job_id, "Queued reward payout");
        Ok(job_id)
    }

    /// Queue a forum post broadcast
    pub async fn enqueue_forum_post(
        &self,
        author: &str,
        conversation_id: &str,
        content: &str,
    ) -> Result<String> {
        if content.is_empty() {
            return Err(SettlementError::Config("post content is empty".into()));
        }
        self.queue.enqueue(SettlementJob::ForumPost {
            author: author.to_string(),
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
        })
    }

    /// Conversations for a wallet, served from the reconciled cache
    ///
    /// Registers the wallet for periodic sync and attempts one immediate
    /// pull; an indexer failure degrades to whatever the cache holds.
    pub async fn get_conversations_for_wallet(
        &self,
        address: &str,
    ) -> Result<Vec<ConversationRecord>> {
        if self.engine.register_participant(address) {
            info!(address = %address, "Registered wallet for conversation sync");
        }
        if let Err(e) = self.engine.sync_for_participant(address).await {
            warn!(
                address = %address,
                error = %e,
                "Immediate sync failed, serving cached conversations"
            );
        }
        Ok(self.engine.conversations_for(address))
    }

    /// Messages of one conversation, read through from the indexer
    pub async fn get_conversation_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<crate::ledger::indexer::IndexedMessage>> {
        self.engine.messages_for(conversation_id).await
    }

    /// Force a full reconciliation pass outside the timer
    pub async fn sync_now(&self) -> usize {
        self.engine.sync_all().await
    }

    /// Dead-lettered settlement jobs (diagnostics)
    pub fn failed_jobs(&self) -> Vec<FailedJob> {
        self.queue.failed_jobs()
    }
}
