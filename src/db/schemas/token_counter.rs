//! Token counter document schema

use bson::{doc, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;
use crate::tokens::TokenCounterSnapshot;

/// Collection name for token counters
pub const TOKEN_COUNTER_COLLECTION: &str = "token_counters";

/// Token counter document stored in MongoDB, one per collection (course)
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TokenCounterDoc {
    /// Collection (course) id, used as the document key
    #[serde(rename = "_id")]
    pub collection_id: String,

    pub base_offset: u64,
    pub next_offset: u64,
    pub max_supply: u64,

    /// Recycled-and-available identifiers
    #[serde(default)]
    pub recycled: Vec<u64>,

    #[serde(default)]
    pub metadata: Metadata,
}

impl TokenCounterDoc {
    pub fn from_snapshot(snapshot: &TokenCounterSnapshot) -> Self {
        Self {
            collection_id: snapshot.collection_id.clone(),
            base_offset: snapshot.base_offset,
            next_offset: snapshot.next_offset,
            max_supply: snapshot.max_supply,
            recycled: snapshot.recycled.clone(),
            metadata: Metadata::default(),
        }
    }

    pub fn into_snapshot(self) -> TokenCounterSnapshot {
        TokenCounterSnapshot {
            collection_id: self.collection_id,
            base_offset: self.base_offset,
            next_offset: self.next_offset,
            max_supply: self.max_supply,
            recycled: self.recycled,
        }
    }
}

impl IntoIndexes for TokenCounterDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        // _id is the collection id; no secondary indexes needed
        Vec::new()
    }
}

impl MutMetadata for TokenCounterDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
