//! In-memory store implementations
//!
//! Used by tests and by dev mode when MongoDB is unavailable (the service
//! starts with a warning and keeps all state in-process).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::db::store::{ConversationStore, CounterStore, ReservationStore};
use crate::mint::records::MintReservation;
use crate::reconcile::ConversationRecord;
use crate::tokens::TokenCounterSnapshot;
use crate::types::Result;

/// In-memory mint reservation store
#[derive(Default)]
pub struct MemoryReservationStore {
    records: DashMap<String, MintReservation>,
}

impl MemoryReservationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReservationStore for MemoryReservationStore {
    async fn insert(&self, reservation: &MintReservation) -> Result<()> {
        self.records
            .insert(reservation.id.clone(), reservation.clone());
        Ok(())
    }

    async fn update(&self, reservation: &MintReservation) -> Result<()> {
        self.records
            .insert(reservation.id.clone(), reservation.clone());
        Ok(())
    }

    async fn get(&self, reservation_id: &str) -> Result<Option<MintReservation>> {
        Ok(self.records.get(reservation_id).map(|r| r.clone()))
    }

    async fn find_active_for_certificate(
        &self,
        certificate_id: &str,
    ) -> Result<Option<MintReservation>> {
        Ok(self
            .records
            .iter()
            .find(|r| r.certificate_id == certificate_id && r.status.is_active())
            .map(|r| r.clone()))
    }

    async fn find_overdue(&self, now: DateTime<Utc>) -> Result<Vec<MintReservation>> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.status.is_active() && r.is_expired(now))
            .map(|r| r.clone())
            .collect())
    }
}

/// In-memory conversation store
#[derive(Default)]
pub struct MemoryConversationStore {
    records: DashMap<String, ConversationRecord>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn upsert(&self, record: &ConversationRecord) -> Result<()> {
        self.records
            .insert(record.conversation_id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, conversation_id: &str) -> Result<Option<ConversationRecord>> {
        Ok(self.records.get(conversation_id).map(|r| r.clone()))
    }

    async fn load_all(&self) -> Result<Vec<ConversationRecord>> {
        Ok(self.records.iter().map(|r| r.clone()).collect())
    }
}

/// In-memory token counter store
#[derive(Default)]
pub struct MemoryCounterStore {
    counters: DashMap<String, TokenCounterSnapshot>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn save(&self, snapshot: &TokenCounterSnapshot) -> Result<()> {
        self.counters
            .insert(snapshot.collection_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn load(&self, collection_id: &str) -> Result<Option<TokenCounterSnapshot>> {
        Ok(self.counters.get(collection_id).map(|c| c.clone()))
    }

    async fn load_all(&self) -> Result<Vec<TokenCounterSnapshot>> {
        Ok(self.counters.iter().map(|c| c.clone()).collect())
    }
}
