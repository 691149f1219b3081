//! Store contracts for durable settlement state
//!
//! The core writes through these traits and never treats the store as
//! authoritative for ledger-derived state (it is a materialized view).
//! Production uses the MongoDB implementations; dev mode and tests use the
//! in-memory ones.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::mint::records::MintReservation;
use crate::reconcile::ConversationRecord;
use crate::tokens::TokenCounterSnapshot;
use crate::types::Result;

/// Durable storage for mint reservations
#[async_trait]
pub trait ReservationStore: Send + Sync {
    async fn insert(&self, reservation: &MintReservation) -> Result<()>;

    async fn update(&self, reservation: &MintReservation) -> Result<()>;

    async fn get(&self, reservation_id: &str) -> Result<Option<MintReservation>>;

    /// The at-most-one `Reserved`/`Paid` record for a certificate, if any
    async fn find_active_for_certificate(
        &self,
        certificate_id: &str,
    ) -> Result<Option<MintReservation>>;

    /// All `Reserved`/`Paid` records whose expiry is in the past
    async fn find_overdue(&self, now: DateTime<Utc>) -> Result<Vec<MintReservation>>;
}

/// Durable storage for reconciled conversation records (write-through
/// cache; the indexer remains the source of truth)
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn upsert(&self, record: &ConversationRecord) -> Result<()>;

    async fn get(&self, conversation_id: &str) -> Result<Option<ConversationRecord>>;

    /// Every persisted record, for warm-starting the in-memory cache
    async fn load_all(&self) -> Result<Vec<ConversationRecord>>;
}

/// Durable storage for token counters
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn save(&self, snapshot: &TokenCounterSnapshot) -> Result<()>;

    async fn load(&self, collection_id: &str) -> Result<Option<TokenCounterSnapshot>>;

    async fn load_all(&self) -> Result<Vec<TokenCounterSnapshot>>;
}
