//! Reconciled conversation document schema
//!
//! Keyed by the derived conversation id. Purely a materialized view of
//! indexer state; rebuildable at any time by a full sync.

use bson::{doc, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;
use crate::ledger::indexer::ConversationStatus;
use crate::reconcile::ConversationRecord;
use crate::types::{Result, SettlementError};

/// Collection name for conversations
pub const CONVERSATION_COLLECTION: &str = "conversations";

/// Conversation document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ConversationDoc {
    /// Derived conversation id, used as the document key
    #[serde(rename = "_id")]
    pub conversation_id: String,

    pub initiator: String,
    pub responder: String,
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub handshake_tx: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_tx: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias_key: Option<String>,

    pub updated_at: bson::DateTime,

    #[serde(default)]
    pub metadata: Metadata,
}

impl ConversationDoc {
    pub fn from_record(record: &ConversationRecord) -> Self {
        Self {
            conversation_id: record.conversation_id.clone(),
            initiator: record.initiator.clone(),
            responder: record.responder.clone(),
            status: record.status.as_str().to_string(),
            handshake_tx: record.handshake_tx.clone(),
            response_tx: record.response_tx.clone(),
            alias_key: record.alias_key.clone(),
            updated_at: bson::DateTime::from_chrono(record.updated_at),
            metadata: Metadata::default(),
        }
    }

    pub fn into_record(self) -> Result<ConversationRecord> {
        let status = match self.status.as_str() {
            "pending" => ConversationStatus::Pending,
            "active" => ConversationStatus::Active,
            "archived" => ConversationStatus::Archived,
            other => {
                return Err(SettlementError::Inconsistent(format!(
                    "unknown conversation status in store: {other}"
                )))
            }
        };
        Ok(ConversationRecord {
            conversation_id: self.conversation_id,
            initiator: self.initiator,
            responder: self.responder,
            status,
            handshake_tx: self.handshake_tx,
            response_tx: self.response_tx,
            alias_key: self.alias_key,
            updated_at: self.updated_at.to_chrono(),
        })
    }
}

impl IntoIndexes for ConversationDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            // Participant lookups (either side)
            (doc! { "initiator": 1 }, None),
            (doc! { "responder": 1 }, None),
            (
                doc! { "status": 1, "updated_at": -1 },
                Some(
                    IndexOptions::builder()
                        .name("status_recency_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for ConversationDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
