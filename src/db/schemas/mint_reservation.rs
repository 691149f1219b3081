//! Mint reservation document schema
//!
//! One document per reservation; a partial unique index on
//! `(certificate_id)` over active statuses enforces at most one
//! non-terminal reservation per certificate at the store level, backing up
//! the in-process guard.

use bson::{doc, Document};
use chrono::Utc;
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;
use crate::mint::records::{MintReservation, ReservationStatus};
use crate::types::{Result, SettlementError};

/// Collection name for mint reservations
pub const MINT_RESERVATION_COLLECTION: &str = "mint_reservations";

/// Mint reservation document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MintReservationDoc {
    /// Reservation id (uuid), used as the document key
    #[serde(rename = "_id")]
    pub id: String,

    pub certificate_id: String,
    pub course_id: String,
    pub recipient_address: String,
    pub token_id: u64,
    pub commit_address: String,
    pub script_payload: String,
    pub mint_payload: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mint_tx_hash: Option<String>,

    /// Lifecycle status as a string (reserved, paid, minted, ...)
    pub status: String,

    /// Stored as BSON dates so the overdue sweep can range-query
    pub created_at: bson::DateTime,
    pub expires_at: bson::DateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<bson::DateTime>,

    #[serde(default)]
    pub metadata: Metadata,
}

impl MintReservationDoc {
    pub fn from_record(record: &MintReservation) -> Self {
        Self {
            id: record.id.clone(),
            certificate_id: record.certificate_id.clone(),
            course_id: record.course_id.clone(),
            recipient_address: record.recipient_address.clone(),
            token_id: record.token_id,
            commit_address: record.commit_address.clone(),
            script_payload: record.script_payload.clone(),
            mint_payload: record.mint_payload.clone(),
            commit_tx_hash: record.commit_tx_hash.clone(),
            mint_tx_hash: record.mint_tx_hash.clone(),
            status: record.status.as_str().to_string(),
            created_at: bson::DateTime::from_chrono(record.created_at),
            expires_at: bson::DateTime::from_chrono(record.expires_at),
            finalized_at: record.finalized_at.map(bson::DateTime::from_chrono),
            metadata: Metadata::default(),
        }
    }

    pub fn into_record(self) -> Result<MintReservation> {
        let status = parse_status(&self.status)?;
        Ok(MintReservation {
            id: self.id,
            certificate_id: self.certificate_id,
            course_id: self.course_id,
            recipient_address: self.recipient_address,
            token_id: self.token_id,
            commit_address: self.commit_address,
            script_payload: self.script_payload,
            mint_payload: self.mint_payload,
            commit_tx_hash: self.commit_tx_hash,
            mint_tx_hash: self.mint_tx_hash,
            status,
            created_at: self.created_at.to_chrono(),
            expires_at: self.expires_at.to_chrono(),
            finalized_at: self.finalized_at.map(|d| d.to_chrono()),
        })
    }
}

fn parse_status(raw: &str) -> Result<ReservationStatus> {
    match raw {
        "reserved" => Ok(ReservationStatus::Reserved),
        "paid" => Ok(ReservationStatus::Paid),
        "minted" => Ok(ReservationStatus::Minted),
        "cancelled" => Ok(ReservationStatus::Cancelled),
        "expired" => Ok(ReservationStatus::Expired),
        "failed" => Ok(ReservationStatus::Failed),
        other => Err(SettlementError::Inconsistent(format!(
            "unknown reservation status in store: {other}"
        ))),
    }
}

/// Filter matching active (Reserved/Paid) statuses
pub fn active_status_filter() -> Document {
    doc! { "status": { "$in": ["reserved", "paid"] } }
}

/// Filter matching active statuses past their expiry
pub fn overdue_filter(now: chrono::DateTime<Utc>) -> Document {
    doc! {
        "status": { "$in": ["reserved", "paid"] },
        "expires_at": { "$lt": bson::DateTime::from_chrono(now) },
    }
}

impl IntoIndexes for MintReservationDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            // One active reservation per certificate, enforced in the store
            (
                doc! { "certificate_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .partial_filter_expression(active_status_filter())
                        .name("certificate_active_unique".to_string())
                        .build(),
                ),
            ),
            // Sweep query: active + expires_at range
            (
                doc! { "status": 1, "expires_at": 1 },
                Some(
                    IndexOptions::builder()
                        .name("status_expiry_index".to_string())
                        .build(),
                ),
            ),
            // Recipient lookups for support tooling
            (doc! { "recipient_address": 1 }, None),
        ]
    }
}

impl MutMetadata for MintReservationDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_round_trip() {
        let record = MintReservation::new(
            "cert-1", "course-1", "laurel:alice", 7, "laurel:p2sh", "51", "payload", 15,
        );
        let doc = MintReservationDoc::from_record(&record);
        let back = doc.into_record().unwrap();
        assert_eq!(back.id, record.id);
        assert_eq!(back.token_id, 7);
        assert_eq!(back.status, ReservationStatus::Reserved);
    }

    #[test]
    fn test_unknown_status_is_inconsistent() {
        let record = MintReservation::new(
            "cert-1", "course-1", "laurel:alice", 7, "laurel:p2sh", "51", "payload", 15,
        );
        let mut doc = MintReservationDoc::from_record(&record);
        doc.status = "limbo".to_string();
        assert!(matches!(
            doc.into_record(),
            Err(SettlementError::Inconsistent(_))
        ));
    }
}
