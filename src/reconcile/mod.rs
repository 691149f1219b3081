//! Ledger reconciliation engine
//!
//! The public indexer is the sole source of truth for conversation state;
//! everything held here (and in the store) is a write-only materialized
//! view that a full sync can rebuild. Sync runs on its own timer,
//! independent of requests, and read endpoints are served from the
//! in-memory cache.

pub mod verify;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::db::store::ConversationStore;
use crate::ledger::indexer::{ConversationIndexer, ConversationStatus, IndexedConversation};
use crate::ledger::rpc::LedgerRpc;
use crate::types::Result;

/// Locally reconciled view of one conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub conversation_id: String,
    pub initiator: String,
    pub responder: String,
    pub status: ConversationStatus,
    pub handshake_tx: Option<String>,
    pub response_tx: Option<String>,
    pub alias_key: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationRecord {
    fn from_indexed(remote: IndexedConversation) -> Self {
        Self {
            conversation_id: remote.conversation_id,
            initiator: remote.initiator,
            responder: remote.responder,
            status: remote.status,
            handshake_tx: remote.handshake_tx,
            response_tx: remote.response_tx,
            alias_key: remote.alias_key,
            updated_at: remote.updated_at,
        }
    }
}

/// Reconciliation tunables
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Known relay/treasury addresses: when the indexer reports one of
    /// these as a conversation's initiator, a previously-known local
    /// initiator wins (the ledger cannot tell "who signed" from "who
    /// relayed")
    pub relay_addresses: Vec<String>,
    /// Interval between full sync passes
    pub sync_interval: Duration,
    /// When set, a handshake whose funding origin cannot be resolved or
    /// does not match the claimed sender is rejected outright
    pub strict_sender_check: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            relay_addresses: Vec::new(),
            sync_interval: Duration::from_secs(30),
            strict_sender_check: false,
        }
    }
}

/// Pulls indexer state into the local caches and validates on-chain
/// payloads
pub struct ReconciliationEngine {
    indexer: Arc<dyn ConversationIndexer>,
    rpc: Arc<dyn LedgerRpc>,
    store: Arc<dyn ConversationStore>,
    config: ReconcileConfig,
    /// Reconciled records by conversation id
    records: DashMap<String, ConversationRecord>,
    /// Rebuildable secondary index: participant address → conversation ids
    by_participant: DashMap<String, HashSet<String>>,
    /// Wallets we sync on the timer
    participants: DashSet<String>,
}

impl ReconciliationEngine {
    pub fn new(
        indexer: Arc<dyn ConversationIndexer>,
        rpc: Arc<dyn LedgerRpc>,
        store: Arc<dyn ConversationStore>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            indexer,
            rpc,
            store,
            config,
            records: DashMap::new(),
            by_participant: DashMap::new(),
            participants: DashSet::new(),
        }
    }

    pub(crate) fn rpc(&self) -> &dyn LedgerRpc {
        self.rpc.as_ref()
    }

    pub(crate) fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Load persisted records into the in-memory cache at startup
    pub async fn warm_start(&self) -> Result<usize> {
        let persisted = self.store.load_all().await?;
        let count = persisted.len();
        for record in persisted {
            self.index_participants(&record);
            self.records
                .insert(record.conversation_id.clone(), record);
        }
        if count > 0 {
            info!(records = count, "Warm-started conversation cache from store");
        }
        Ok(count)
    }

    /// Track a wallet for periodic sync; returns true when newly added
    pub fn register_participant(&self, address: &str) -> bool {
        self.participants.insert(address.to_string())
    }

    /// Pull the indexer's view for one participant and merge it in
    ///
    /// A failure leaves existing cached state untouched; the next timer
    /// tick retries.
    pub async fn sync_for_participant(&self, address: &str) -> Result<usize> {
        let fetched = self.indexer.conversations_for(address).await?;
        let mut upserted = 0;

        for remote in fetched {
            if let Some(record) = self.merge(remote) {
                self.index_participants(&record);
                self.records
                    .insert(record.conversation_id.clone(), record.clone());
                if let Err(e) = self.store.upsert(&record).await {
                    // Cache already carries the fresh view; store catches
                    // up on a later pass
                    warn!(
                        conversation = %record.conversation_id,
                        error = %e,
                        "Failed to persist reconciled conversation"
                    );
                }
                upserted += 1;
            }
        }

        debug!(address = %address, upserted, "Participant sync complete");
        Ok(upserted)
    }

    /// Sync every registered participant; per-participant errors are
    /// logged and do not stop the pass
    pub async fn sync_all(&self) -> usize {
        let addresses: Vec<String> = self.participants.iter().map(|a| a.clone()).collect();
        let mut total = 0;

        for address in addresses {
            match self.sync_for_participant(&address).await {
                Ok(count) => total += count,
                Err(e) => {
                    warn!(
                        address = %address,
                        error = %e,
                        "Participant sync failed (cache untouched, retrying next interval)"
                    );
                }
            }
        }
        total
    }

    /// Conversations for a wallet, newest first, from the cache
    pub fn conversations_for(&self, address: &str) -> Vec<ConversationRecord> {
        let Some(ids) = self.by_participant.get(address) else {
            return Vec::new();
        };
        let mut records: Vec<ConversationRecord> = ids
            .iter()
            .filter_map(|id| self.records.get(id).map(|r| r.clone()))
            .collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        records
    }

    /// Messages of a conversation, read through from the indexer
    ///
    /// Not cached: message bodies are bulky and the detail view tolerates
    /// indexer latency.
    pub async fn messages_for(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<crate::ledger::indexer::IndexedMessage>> {
        self.indexer.messages_for(conversation_id).await
    }

    /// Direct user-action status upgrade; persisted immediately so the
    /// next sync pass sees the local `Active` and will not regress it
    pub async fn mark_active(&self, conversation_id: &str) -> Result<()> {
        let record = {
            let mut entry = self.records.get_mut(conversation_id).ok_or_else(|| {
                crate::types::SettlementError::NotFound(format!(
                    "conversation {conversation_id}"
                ))
            })?;
            entry.status = ConversationStatus::Active;
            entry.updated_at = Utc::now();
            entry.clone()
        };
        self.store.upsert(&record).await?;
        info!(conversation = %conversation_id, "Conversation marked active");
        Ok(())
    }

    /// Merge one indexer record against the local view
    ///
    /// Returns the record to upsert, or `None` when the remote view must
    /// be skipped.
    fn merge(&self, remote: IndexedConversation) -> Option<ConversationRecord> {
        let local = self
            .records
            .get(&remote.conversation_id)
            .map(|r| r.clone());

        if let Some(ref local) = local {
            // The indexer may lag a confirmation by one interval; flapping
            // a confirmed conversation back to pending is user-visible and
            // wrong
            if local.status == ConversationStatus::Active
                && remote.status == ConversationStatus::Pending
            {
                debug!(
                    conversation = %remote.conversation_id,
                    "Skipping stale indexer view (local active, remote pending)"
                );
                return None;
            }
        }

        let mut record = ConversationRecord::from_indexed(remote);

        // Relay override: the true initiator is whoever we already knew,
        // not the relay that funded the handshake
        if self.config.relay_addresses.contains(&record.initiator) {
            if let Some(local) = local {
                debug!(
                    conversation = %record.conversation_id,
                    relay = %record.initiator,
                    initiator = %local.initiator,
                    "Overriding relay-reported initiator with local view"
                );
                record.initiator = local.initiator;
                record.responder = local.responder;
            }
        }

        Some(record)
    }

    fn index_participants(&self, record: &ConversationRecord) {
        for address in [&record.initiator, &record.responder] {
            self.by_participant
                .entry(address.clone())
                .or_default()
                .insert(record.conversation_id.clone());
        }
    }
}

/// Spawn the periodic sync loop
pub fn spawn_sync_task(engine: Arc<ReconciliationEngine>) -> JoinHandle<()> {
    let interval = engine.config.sync_interval;
    info!(interval_secs = interval.as_secs(), "Starting reconciliation sync task");
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let upserted = engine.sync_all().await;
            if upserted > 0 {
                debug!(upserted, "Reconciliation pass complete");
            }
        }
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::ledger::indexer::IndexedMessage;
    use crate::ledger::rpc::LedgerTransaction;
    use crate::ledger::types::CoinFragment;
    use crate::types::SettlementError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Indexer stub serving canned conversations per participant
    #[derive(Default)]
    pub struct StubIndexer {
        pub conversations: Mutex<HashMap<String, Vec<IndexedConversation>>>,
        pub fail_for: Mutex<HashSet<String>>,
    }

    impl StubIndexer {
        pub fn set(&self, address: &str, records: Vec<IndexedConversation>) {
            self.conversations
                .lock()
                .unwrap()
                .insert(address.to_string(), records);
        }

        pub fn fail_for(&self, address: &str) {
            self.fail_for.lock().unwrap().insert(address.to_string());
        }
    }

    #[async_trait]
    impl ConversationIndexer for StubIndexer {
        async fn conversations_for(&self, address: &str) -> Result<Vec<IndexedConversation>> {
            if self.fail_for.lock().unwrap().contains(address) {
                return Err(SettlementError::TransientLedger("indexer down".into()));
            }
            Ok(self
                .conversations
                .lock()
                .unwrap()
                .get(address)
                .cloned()
                .unwrap_or_default())
        }

        async fn messages_for(&self, _conversation_id: &str) -> Result<Vec<IndexedMessage>> {
            Ok(Vec::new())
        }
    }

    /// Ledger RPC stub serving canned transactions and fragments
    #[derive(Default)]
    pub struct StubRpc {
        pub transactions: Mutex<HashMap<String, LedgerTransaction>>,
        pub fragments: Mutex<Vec<CoinFragment>>,
    }

    impl StubRpc {
        pub fn put(&self, tx: LedgerTransaction) {
            self.transactions
                .lock()
                .unwrap()
                .insert(tx.hash.clone(), tx);
        }

        pub fn fund(&self, fragments: Vec<CoinFragment>) {
            *self.fragments.lock().unwrap() = fragments;
        }
    }

    #[async_trait]
    impl LedgerRpc for StubRpc {
        async fn fetch_spendable_fragments(&self, _address: &str) -> Result<Vec<CoinFragment>> {
            Ok(self.fragments.lock().unwrap().clone())
        }

        async fn submit_transaction(&self, _raw_tx: &str) -> Result<String> {
            Ok("stub-tx".to_string())
        }

        async fn get_transaction(&self, tx_hash: &str) -> Result<Option<LedgerTransaction>> {
            Ok(self.transactions.lock().unwrap().get(tx_hash).cloned())
        }
    }
}
