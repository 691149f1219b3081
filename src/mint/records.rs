//! Mint reservation record and lifecycle states

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a mint reservation
///
/// `Reserved → {Paid → Minted, Cancelled, Expired, Failed}`; the three
/// non-`Minted` terminals all release the held token id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    /// Token id held, commit address issued, waiting for the wallet
    Reserved,
    /// Commit transaction observed, waiting for the reveal
    Paid,
    /// Reveal confirmed; the token is minted
    Minted,
    /// Explicit user abort
    Cancelled,
    /// Aged out by the expiry sweep
    Expired,
    /// Unrecoverable error during the flow
    Failed,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Reserved => "reserved",
            ReservationStatus::Paid => "paid",
            ReservationStatus::Minted => "minted",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Expired => "expired",
            ReservationStatus::Failed => "failed",
        }
    }

    /// Reserved/Paid hold the token id; everything else is terminal
    pub fn is_active(&self) -> bool {
        matches!(self, ReservationStatus::Reserved | ReservationStatus::Paid)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

/// Durable record of one non-custodial mint flow
///
/// The token id is not safe to reuse until this record reaches a
/// terminal, released state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MintReservation {
    pub id: String,
    pub certificate_id: String,
    pub course_id: String,
    pub recipient_address: String,
    pub token_id: u64,
    pub commit_address: String,
    pub script_payload: String,
    pub mint_payload: String,
    pub commit_tx_hash: Option<String>,
    pub mint_tx_hash: Option<String>,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl MintReservation {
    /// Create a fresh `Reserved` record with a bounded expiry
    pub fn new(
        certificate_id: impl Into<String>,
        course_id: impl Into<String>,
        recipient_address: impl Into<String>,
        token_id: u64,
        commit_address: impl Into<String>,
        script_payload: impl Into<String>,
        mint_payload: impl Into<String>,
        expiry_minutes: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            certificate_id: certificate_id.into(),
            course_id: course_id.into(),
            recipient_address: recipient_address.into(),
            token_id,
            commit_address: commit_address.into(),
            script_payload: script_payload.into(),
            mint_payload: mint_payload.into(),
            commit_tx_hash: None,
            mint_tx_hash: None,
            status: ReservationStatus::Reserved,
            created_at: now,
            expires_at: now + Duration::minutes(expiry_minutes),
            finalized_at: None,
        }
    }

    /// Whether the reservation has aged past its expiry
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Whether this record still holds its token id at `now`
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status.is_active() && !self.is_expired(now)
    }
}
