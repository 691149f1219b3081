//! MongoDB-backed store implementations

use async_trait::async_trait;
use bson::doc;
use chrono::{DateTime, Utc};

use crate::db::mongo::{MongoClient, MongoCollection};
use crate::db::schemas::{
    mint_reservation, ConversationDoc, MintReservationDoc, TokenCounterDoc,
    CONVERSATION_COLLECTION, MINT_RESERVATION_COLLECTION, TOKEN_COUNTER_COLLECTION,
};
use crate::db::store::{ConversationStore, CounterStore, ReservationStore};
use crate::mint::records::MintReservation;
use crate::reconcile::ConversationRecord;
use crate::tokens::TokenCounterSnapshot;
use crate::types::Result;

/// Mint reservation store over the `mint_reservations` collection
pub struct MongoReservationStore {
    collection: MongoCollection<MintReservationDoc>,
}

impl MongoReservationStore {
    pub async fn new(client: &MongoClient) -> Result<Self> {
        Ok(Self {
            collection: client.collection(MINT_RESERVATION_COLLECTION).await?,
        })
    }
}

#[async_trait]
impl ReservationStore for MongoReservationStore {
    async fn insert(&self, reservation: &MintReservation) -> Result<()> {
        self.collection
            .insert_one(MintReservationDoc::from_record(reservation))
            .await
    }

    async fn update(&self, reservation: &MintReservation) -> Result<()> {
        self.collection
            .upsert_one(
                doc! { "_id": &reservation.id },
                MintReservationDoc::from_record(reservation),
            )
            .await
    }

    async fn get(&self, reservation_id: &str) -> Result<Option<MintReservation>> {
        match self.collection.find_one(doc! { "_id": reservation_id }).await? {
            Some(doc) => Ok(Some(doc.into_record()?)),
            None => Ok(None),
        }
    }

    async fn find_active_for_certificate(
        &self,
        certificate_id: &str,
    ) -> Result<Option<MintReservation>> {
        let mut filter = mint_reservation::active_status_filter();
        filter.insert("certificate_id", certificate_id);
        match self.collection.find_one(filter).await? {
            Some(doc) => Ok(Some(doc.into_record()?)),
            None => Ok(None),
        }
    }

    async fn find_overdue(&self, now: DateTime<Utc>) -> Result<Vec<MintReservation>> {
        let docs = self
            .collection
            .find_many(mint_reservation::overdue_filter(now))
            .await?;
        docs.into_iter().map(|d| d.into_record()).collect()
    }
}

/// Conversation store over the `conversations` collection
pub struct MongoConversationStore {
    collection: MongoCollection<ConversationDoc>,
}

impl MongoConversationStore {
    pub async fn new(client: &MongoClient) -> Result<Self> {
        Ok(Self {
            collection: client.collection(CONVERSATION_COLLECTION).await?,
        })
    }
}

#[async_trait]
impl ConversationStore for MongoConversationStore {
    async fn upsert(&self, record: &ConversationRecord) -> Result<()> {
        self.collection
            .upsert_one(
                doc! { "_id": &record.conversation_id },
                ConversationDoc::from_record(record),
            )
            .await
    }

    async fn get(&self, conversation_id: &str) -> Result<Option<ConversationRecord>> {
        match self
            .collection
            .find_one(doc! { "_id": conversation_id })
            .await?
        {
            Some(doc) => Ok(Some(doc.into_record()?)),
            None => Ok(None),
        }
    }

    async fn load_all(&self) -> Result<Vec<ConversationRecord>> {
        let docs = self.collection.find_many(doc! {}).await?;
        docs.into_iter().map(|d| d.into_record()).collect()
    }
}

/// Token counter store over the `token_counters` collection
pub struct MongoCounterStore {
    collection: MongoCollection<TokenCounterDoc>,
}

impl MongoCounterStore {
    pub async fn new(client: &MongoClient) -> Result<Self> {
        Ok(Self {
            collection: client.collection(TOKEN_COUNTER_COLLECTION).await?,
        })
    }
}

#[async_trait]
impl CounterStore for MongoCounterStore {
    async fn save(&self, snapshot: &TokenCounterSnapshot) -> Result<()> {
        self.collection
            .upsert_one(
                doc! { "_id": &snapshot.collection_id },
                TokenCounterDoc::from_snapshot(snapshot),
            )
            .await
    }

    async fn load(&self, collection_id: &str) -> Result<Option<TokenCounterSnapshot>> {
        Ok(self
            .collection
            .find_one(doc! { "_id": collection_id })
            .await?
            .map(|d| d.into_snapshot()))
    }

    async fn load_all(&self) -> Result<Vec<TokenCounterSnapshot>> {
        Ok(self
            .collection
            .find_many(doc! {})
            .await?
            .into_iter()
            .map(|d| d.into_snapshot())
            .collect())
    }
}
