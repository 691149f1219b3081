//! Public ledger indexer client contract
//!
//! The indexer is the authoritative, eventually-consistent view of
//! conversation and handshake state. The reconciliation engine is its only
//! consumer; the local store is never read as authoritative.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::types::{Result, SettlementError};

/// Conversation lifecycle as reported by the indexer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    /// Handshake published, response not yet observed
    Pending,
    /// Response observed, conversation confirmed
    Active,
    /// Closed by either participant
    Archived,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Pending => "pending",
            ConversationStatus::Active => "active",
            ConversationStatus::Archived => "archived",
        }
    }
}

/// A conversation record as the indexer reports it
///
/// The indexer derives `initiator` from the funding origin of the handshake
/// transaction, which cannot distinguish "who signed" from "who relayed";
/// the reconciliation engine corrects for known relay addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedConversation {
    pub conversation_id: String,
    pub initiator: String,
    pub responder: String,
    pub status: ConversationStatus,
    pub handshake_tx: Option<String>,
    pub response_tx: Option<String>,
    pub alias_key: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A message within a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedMessage {
    pub tx_hash: String,
    pub conversation_id: String,
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Read access to the public ledger indexer
#[async_trait]
pub trait ConversationIndexer: Send + Sync {
    /// List every conversation the indexer associates with a participant
    async fn conversations_for(&self, address: &str) -> Result<Vec<IndexedConversation>>;

    /// Fetch the messages of a conversation
    async fn messages_for(&self, conversation_id: &str) -> Result<Vec<IndexedMessage>>;
}

/// REST-backed indexer client
pub struct HttpConversationIndexer {
    client: reqwest::Client,
    base_url: String,
}

impl HttpConversationIndexer {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SettlementError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn transient(e: reqwest::Error) -> SettlementError {
        SettlementError::TransientLedger(e.to_string())
    }
}

#[async_trait]
impl ConversationIndexer for HttpConversationIndexer {
    async fn conversations_for(&self, address: &str) -> Result<Vec<IndexedConversation>> {
        let url = format!("{}/participants/{}/conversations", self.base_url, address);
        let records: Vec<IndexedConversation> = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(Self::transient)?
            .error_for_status()
            .map_err(Self::transient)?
            .json()
            .await
            .map_err(Self::transient)?;

        debug!(address = %address, count = records.len(), "Fetched indexed conversations");
        Ok(records)
    }

    async fn messages_for(&self, conversation_id: &str) -> Result<Vec<IndexedMessage>> {
        let url = format!(
            "{}/conversations/{}/messages",
            self.base_url, conversation_id
        );
        self.client
            .get(&url)
            .send()
            .await
            .map_err(Self::transient)?
            .error_for_status()
            .map_err(Self::transient)?
            .json()
            .await
            .map_err(Self::transient)
    }
}
