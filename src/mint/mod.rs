//! Mint reservation state machine
//!
//! Orchestrates the non-custodial diploma mint: reserve a token id and a
//! commit address, let the user's wallet sign externally, then confirm or
//! cancel. The token id is the scarce resource (fixed-supply collection):
//! it is taken early so a second learner cannot race for the same slot,
//! and mandatory expiry plus idempotent recycling stop abandoned flows
//! from starving the collection.

pub mod records;

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use records::{MintReservation, ReservationStatus};

use crate::db::store::ReservationStore;
use crate::ledger::script::ScriptBuilder;
use crate::tokens::TokenIdAllocator;
use crate::types::{Result, SettlementError};

/// Tunables for the mint flow
#[derive(Debug, Clone)]
pub struct MintConfig {
    /// Reservation lifetime in minutes (bounded: minutes, not hours)
    pub expiry_minutes: i64,
    /// First token id issued for a new collection
    pub default_base_offset: u64,
    /// Supply cap applied when a collection is first seen
    pub default_max_supply: u64,
}

impl Default for MintConfig {
    fn default() -> Self {
        Self {
            expiry_minutes: 15,
            default_base_offset: 1,
            default_max_supply: 1000,
        }
    }
}

/// Drives the reservation lifecycle and owns each record until it reaches
/// a terminal state
pub struct MintReservationManager {
    store: Arc<dyn ReservationStore>,
    allocator: Arc<TokenIdAllocator>,
    scripts: Arc<dyn ScriptBuilder>,
    config: MintConfig,
    /// Per-certificate claim taken before any I/O, so two interleaved
    /// create calls for the same certificate cannot both pass the store
    /// check
    in_flight: DashMap<String, ()>,
}

/// Removes the per-certificate claim on every exit path
struct InFlightClaim<'a> {
    map: &'a DashMap<String, ()>,
    key: String,
}

impl Drop for InFlightClaim<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

impl MintReservationManager {
    pub fn new(
        store: Arc<dyn ReservationStore>,
        allocator: Arc<TokenIdAllocator>,
        scripts: Arc<dyn ScriptBuilder>,
        config: MintConfig,
    ) -> Self {
        Self {
            store,
            allocator,
            scripts,
            config,
            in_flight: DashMap::new(),
        }
    }

    /// Reserve a token id and commit address for a certificate
    ///
    /// Fails with `AlreadyReserved` when an unexpired reservation exists.
    /// A stale active record past its expiry is swept inline so it cannot
    /// act as a permanent lock.
    pub async fn create_reservation(
        &self,
        certificate_id: &str,
        course_id: &str,
        recipient_address: &str,
    ) -> Result<MintReservation> {
        let _claim = self.claim(certificate_id)?;
        let now = Utc::now();

        if let Some(existing) = self.store.find_active_for_certificate(certificate_id).await? {
            if !existing.is_expired(now) {
                return Err(SettlementError::AlreadyReserved {
                    certificate_id: certificate_id.to_string(),
                });
            }
            // Stale lock: the sweep has not caught it yet
            self.expire_record(existing).await?;
        }

        self.allocator
            .initialize(
                course_id,
                self.config.default_base_offset,
                self.config.default_max_supply,
            )
            .await?;

        let token_id = self.allocator.reserve(course_id).await.ok_or_else(|| {
            SettlementError::SupplyExhausted {
                course_id: course_id.to_string(),
            }
        })?;

        // From here on the token id must be recycled before any error
        // escapes
        let script = match self
            .scripts
            .build_mint_commit(certificate_id, course_id, recipient_address, token_id)
        {
            Ok(s) => s,
            Err(e) => {
                self.allocator.recycle(course_id, token_id).await;
                return Err(e);
            }
        };

        let reservation = MintReservation::new(
            certificate_id,
            course_id,
            recipient_address,
            token_id,
            script.commit_address,
            script.script_hex,
            script.mint_payload,
            self.config.expiry_minutes,
        );

        if let Err(e) = self.store.insert(&reservation).await {
            self.allocator.recycle(course_id, token_id).await;
            return Err(e);
        }

        info!(
            reservation = %reservation.id,
            certificate = %certificate_id,
            course = %course_id,
            token_id,
            expires_at = %reservation.expires_at,
            "Created mint reservation"
        );
        Ok(reservation)
    }

    /// Attach the commit transaction hash once the wallet funded the
    /// commit address
    pub async fn mark_paid(&self, reservation_id: &str, commit_tx_hash: &str) -> Result<()> {
        let mut reservation = self.load(reservation_id).await?;
        let now = Utc::now();

        if !reservation.status.is_active() {
            return Err(SettlementError::InvalidState {
                expected: "reserved or paid",
                actual: reservation.status.as_str().to_string(),
            });
        }
        if reservation.is_expired(now) {
            return Err(SettlementError::Expired {
                reservation_id: reservation_id.to_string(),
            });
        }

        reservation.commit_tx_hash = Some(commit_tx_hash.to_string());
        reservation.status = ReservationStatus::Paid;
        self.store.update(&reservation).await?;

        debug!(reservation = %reservation_id, commit_tx = %commit_tx_hash, "Reservation paid");
        Ok(())
    }

    /// Finalize a reservation after the reveal transaction confirmed
    ///
    /// Fails with `Expired` past the deadline and does *not* recycle: the
    /// caller must cancel explicitly (or the sweep will) so the release is
    /// always a deliberate transition.
    pub async fn confirm_reservation(
        &self,
        reservation_id: &str,
        mint_tx_hash: &str,
    ) -> Result<u64> {
        let reservation = self.load(reservation_id).await?;

        if !reservation.status.is_active() {
            return Err(SettlementError::InvalidState {
                expected: "reserved or paid",
                actual: reservation.status.as_str().to_string(),
            });
        }
        if reservation.is_expired(Utc::now()) {
            return Err(SettlementError::Expired {
                reservation_id: reservation_id.to_string(),
            });
        }

        self.finalize(reservation, mint_tx_hash).await
    }

    /// Finalize a reservation whose reveal is already on-chain
    ///
    /// Unlike [`Self::confirm_reservation`] the deadline is not
    /// re-checked: once the reveal transaction has been broadcast the
    /// token id is consumed on the ledger no matter what the local clock
    /// says, and letting the sweep recycle it would issue the same id
    /// twice.
    pub async fn finalize_broadcast(
        &self,
        reservation_id: &str,
        mint_tx_hash: &str,
    ) -> Result<u64> {
        let reservation = self.load(reservation_id).await?;

        if !reservation.status.is_active() {
            return Err(SettlementError::InvalidState {
                expected: "reserved or paid",
                actual: reservation.status.as_str().to_string(),
            });
        }

        self.finalize(reservation, mint_tx_hash).await
    }

    async fn finalize(
        &self,
        mut reservation: MintReservation,
        mint_tx_hash: &str,
    ) -> Result<u64> {
        reservation.status = ReservationStatus::Minted;
        reservation.mint_tx_hash = Some(mint_tx_hash.to_string());
        reservation.finalized_at = Some(Utc::now());
        self.store.update(&reservation).await?;

        info!(
            reservation = %reservation.id,
            token_id = reservation.token_id,
            mint_tx = %mint_tx_hash,
            "Mint confirmed"
        );
        Ok(reservation.token_id)
    }

    /// Abort a reservation and synchronously recycle its token id so a
    /// retry (by the same or another learner) can reuse it immediately
    pub async fn cancel_reservation(&self, reservation_id: &str) -> Result<()> {
        let mut reservation = self.load(reservation_id).await?;

        if !reservation.status.is_active() {
            return Err(SettlementError::InvalidState {
                expected: "reserved or paid",
                actual: reservation.status.as_str().to_string(),
            });
        }

        reservation.status = ReservationStatus::Cancelled;
        reservation.finalized_at = Some(Utc::now());
        self.store.update(&reservation).await?;
        self.allocator
            .recycle(&reservation.course_id, reservation.token_id)
            .await;

        info!(
            reservation = %reservation_id,
            token_id = reservation.token_id,
            "Reservation cancelled, token id recycled"
        );
        Ok(())
    }

    /// Mark an unrecoverable failure, releasing the token id
    pub async fn fail_reservation(&self, reservation_id: &str, reason: &str) -> Result<()> {
        let mut reservation = self.load(reservation_id).await?;
        if !reservation.status.is_active() {
            return Ok(());
        }

        reservation.status = ReservationStatus::Failed;
        reservation.finalized_at = Some(Utc::now());
        self.store.update(&reservation).await?;
        self.allocator
            .recycle(&reservation.course_id, reservation.token_id)
            .await;

        warn!(reservation = %reservation_id, reason = %reason, "Reservation failed");
        Ok(())
    }

    /// Backstop for abandoned flows: expire overdue reservations and
    /// recycle their token ids. Returns the number processed.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let overdue = self.store.find_overdue(Utc::now()).await?;
        let mut swept = 0;

        for reservation in overdue {
            let id = reservation.id.clone();
            match self.expire_record(reservation).await {
                Ok(()) => swept += 1,
                Err(e) => {
                    warn!(reservation = %id, error = %e, "Failed to expire reservation")
                }
            }
        }

        if swept > 0 {
            info!(count = swept, "Expired overdue mint reservations");
        }
        Ok(swept)
    }

    /// The unexpired active reservation for a certificate, if any
    pub async fn get_active_reservation(
        &self,
        certificate_id: &str,
    ) -> Result<Option<MintReservation>> {
        let now = Utc::now();
        Ok(self
            .store
            .find_active_for_certificate(certificate_id)
            .await?
            .filter(|r| !r.is_expired(now)))
    }

    async fn expire_record(&self, mut reservation: MintReservation) -> Result<()> {
        reservation.status = ReservationStatus::Expired;
        reservation.finalized_at = Some(Utc::now());
        self.store.update(&reservation).await?;
        self.allocator
            .recycle(&reservation.course_id, reservation.token_id)
            .await;
        debug!(
            reservation = %reservation.id,
            token_id = reservation.token_id,
            "Reservation expired, token id recycled"
        );
        Ok(())
    }

    async fn load(&self, reservation_id: &str) -> Result<MintReservation> {
        self.store.get(reservation_id).await?.ok_or_else(|| {
            SettlementError::NotFound(format!("mint reservation {reservation_id}"))
        })
    }

    fn claim(&self, certificate_id: &str) -> Result<InFlightClaim<'_>> {
        use dashmap::mapref::entry::Entry;
        match self.in_flight.entry(certificate_id.to_string()) {
            Entry::Occupied(_) => Err(SettlementError::AlreadyReserved {
                certificate_id: certificate_id.to_string(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(());
                Ok(InFlightClaim {
                    map: &self.in_flight,
                    key: certificate_id.to_string(),
                })
            }
        }
    }
}

/// Spawn the periodic expiry sweep
pub fn spawn_sweep_task(manager: Arc<MintReservationManager>, interval: Duration) -> JoinHandle<()> {
    info!(interval_secs = interval.as_secs(), "Starting expiry sweep task");
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = manager.sweep_expired().await {
                warn!(error = %e, "Expiry sweep failed (will retry next interval)");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::{MemoryCounterStore, MemoryReservationStore};
    use crate::ledger::script::P2shScriptBuilder;
    use chrono::Duration as ChronoDuration;

    fn manager() -> (MintReservationManager, Arc<MemoryReservationStore>) {
        let store = Arc::new(MemoryReservationStore::new());
        let allocator = Arc::new(TokenIdAllocator::new(Arc::new(MemoryCounterStore::new())));
        let scripts = Arc::new(P2shScriptBuilder::new("laureltest"));
        (
            MintReservationManager::new(
                Arc::clone(&store) as Arc<dyn ReservationStore>,
                allocator,
                scripts,
                MintConfig::default(),
            ),
            store,
        )
    }

    #[tokio::test]
    async fn test_create_allocates_first_token() {
        let (manager, _) = manager();
        let reservation = manager
            .create_reservation("cert-1", "course-1", "laurel:alice")
            .await
            .unwrap();
        assert_eq!(reservation.token_id, 1);
        assert_eq!(reservation.status, ReservationStatus::Reserved);
        assert!(reservation.commit_address.starts_with("laureltest:"));
    }

    #[tokio::test]
    async fn test_duplicate_reservation_rejected() {
        let (manager, _) = manager();
        manager
            .create_reservation("cert-1", "course-1", "laurel:alice")
            .await
            .unwrap();

        let err = manager
            .create_reservation("cert-1", "course-1", "laurel:alice")
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::AlreadyReserved { .. }));
    }

    #[tokio::test]
    async fn test_cancel_recycles_token_immediately() {
        let (manager, _) = manager();
        let first = manager
            .create_reservation("cert-1", "course-1", "laurel:alice")
            .await
            .unwrap();
        manager.cancel_reservation(&first.id).await.unwrap();

        // Another learner picks up the released id
        let second = manager
            .create_reservation("cert-2", "course-1", "laurel:bob")
            .await
            .unwrap();
        assert_eq!(second.token_id, first.token_id);
    }

    #[tokio::test]
    async fn test_confirm_expired_fails_without_recycle() {
        let (manager, store) = manager();
        let mut reservation = manager
            .create_reservation("cert-1", "course-1", "laurel:alice")
            .await
            .unwrap();

        reservation.expires_at = Utc::now() - ChronoDuration::minutes(1);
        store.update(&reservation).await.unwrap();

        let err = manager
            .confirm_reservation(&reservation.id, "deadbeef")
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::Expired { .. }));

        // No silent recycle: the record still holds its token id until the
        // sweep or an explicit cancel
        let stored = store.get(&reservation.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReservationStatus::Reserved);
    }

    #[tokio::test]
    async fn test_sweep_expires_and_recycles() {
        let (manager, store) = manager();
        let mut reservation = manager
            .create_reservation("cert-1", "course-1", "laurel:alice")
            .await
            .unwrap();
        reservation.expires_at = Utc::now() - ChronoDuration::minutes(1);
        store.update(&reservation).await.unwrap();

        assert_eq!(manager.sweep_expired().await.unwrap(), 1);

        let stored = store.get(&reservation.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReservationStatus::Expired);

        // The token id is immediately reservable again
        let next = manager
            .create_reservation("cert-2", "course-1", "laurel:bob")
            .await
            .unwrap();
        assert_eq!(next.token_id, reservation.token_id);
    }

    #[tokio::test]
    async fn test_stale_expired_record_does_not_block_new_reservation() {
        let (manager, store) = manager();
        let mut reservation = manager
            .create_reservation("cert-1", "course-1", "laurel:alice")
            .await
            .unwrap();
        reservation.expires_at = Utc::now() - ChronoDuration::minutes(1);
        store.update(&reservation).await.unwrap();

        // Sweep has not run; create must clear the stale lock inline
        let fresh = manager
            .create_reservation("cert-1", "course-1", "laurel:alice")
            .await
            .unwrap();
        assert_eq!(fresh.status, ReservationStatus::Reserved);

        let old = store.get(&reservation.id).await.unwrap().unwrap();
        assert_eq!(old.status, ReservationStatus::Expired);
    }

    #[tokio::test]
    async fn test_confirm_returns_token_and_finalizes() {
        let (manager, store) = manager();
        let reservation = manager
            .create_reservation("cert-1", "course-1", "laurel:alice")
            .await
            .unwrap();
        manager.mark_paid(&reservation.id, "commit-tx").await.unwrap();

        let token_id = manager
            .confirm_reservation(&reservation.id, "reveal-tx")
            .await
            .unwrap();
        assert_eq!(token_id, reservation.token_id);

        let stored = store.get(&reservation.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReservationStatus::Minted);
        assert!(stored.finalized_at.is_some());
        assert_eq!(stored.mint_tx_hash.as_deref(), Some("reveal-tx"));
    }

    #[tokio::test]
    async fn test_finalize_broadcast_past_deadline_keeps_token() {
        let (manager, store) = manager();
        let reservation = manager
            .create_reservation("cert-1", "course-1", "laurel:alice")
            .await
            .unwrap();
        manager.mark_paid(&reservation.id, "commit-tx").await.unwrap();

        let mut stale = store.get(&reservation.id).await.unwrap().unwrap();
        stale.expires_at = Utc::now() - ChronoDuration::minutes(1);
        store.update(&stale).await.unwrap();

        // The reveal was broadcast before the deadline check could run;
        // the id is consumed on-chain and must not be recycled
        let token_id = manager
            .finalize_broadcast(&reservation.id, "reveal-tx")
            .await
            .unwrap();
        assert_eq!(token_id, reservation.token_id);

        let stored = store.get(&reservation.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReservationStatus::Minted);

        // Nothing left for the sweep; the next learner gets a fresh id
        assert_eq!(manager.sweep_expired().await.unwrap(), 0);
        let next = manager
            .create_reservation("cert-2", "course-1", "laurel:bob")
            .await
            .unwrap();
        assert_eq!(next.token_id, reservation.token_id + 1);
    }

    #[tokio::test]
    async fn test_cancel_from_terminal_state_rejected() {
        let (manager, _) = manager();
        let reservation = manager
            .create_reservation("cert-1", "course-1", "laurel:alice")
            .await
            .unwrap();
        manager
            .confirm_reservation(&reservation.id, "reveal-tx")
            .await
            .unwrap();

        let err = manager.cancel_reservation(&reservation.id).await.unwrap_err();
        assert!(matches!(err, SettlementError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_supply_exhaustion_surfaces() {
        let store = Arc::new(MemoryReservationStore::new());
        let allocator = Arc::new(TokenIdAllocator::new(Arc::new(MemoryCounterStore::new())));
        let scripts = Arc::new(P2shScriptBuilder::new("laureltest"));
        let manager = MintReservationManager::new(
            store,
            allocator,
            scripts,
            MintConfig {
                default_max_supply: 1,
                ..MintConfig::default()
            },
        );

        manager
            .create_reservation("cert-1", "course-1", "laurel:alice")
            .await
            .unwrap();
        let err = manager
            .create_reservation("cert-2", "course-1", "laurel:bob")
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::SupplyExhausted { .. }));
    }
}
