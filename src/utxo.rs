//! UTXO reservation manager
//!
//! Exclusively locks coin fragments for the lifetime of a broadcast
//! attempt so no fragment is ever referenced by two concurrently-built
//! transactions. Every operation is a synchronous, atomic decision under a
//! single lock; callers do their own I/O after the decision, never between
//! check and act.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use crate::ledger::types::{total_sompi, CoinFragment, UtxoRef};

/// An exclusive hold on a set of coin fragments
///
/// Owned by the caller that created it until released or marked spent.
#[derive(Debug, Clone)]
pub struct UtxoReservation {
    pub id: String,
    pub fragments: Vec<CoinFragment>,
    pub total_sompi: u64,
    pub purpose: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct ManagerState {
    /// Fragments held by live reservations; always disjoint across them
    reserved: HashSet<UtxoRef>,
    /// Fragments consumed by confirmed transactions, never eligible again
    spent: HashSet<UtxoRef>,
}

/// Process-wide allocator for spendable coin fragments
#[derive(Default)]
pub struct UtxoReservationManager {
    state: Mutex<ManagerState>,
}

impl UtxoReservationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select and exclusively lock fragments covering `required_sompi`
    ///
    /// Greedy smallest-first selection over the fragments not already
    /// reserved or spent. Returns `None` when no unreserved subset
    /// suffices; that is an expected outcome ("insufficient funds right
    /// now"), not an error, and the manager never retries on its own.
    pub fn select_and_reserve(
        &self,
        available: &[CoinFragment],
        required_sompi: u64,
        purpose: &str,
    ) -> Option<UtxoReservation> {
        let mut state = self.lock();

        let mut candidates: Vec<&CoinFragment> = available
            .iter()
            .filter(|f| !state.reserved.contains(&f.outpoint) && !state.spent.contains(&f.outpoint))
            .collect();
        candidates.sort_by_key(|f| f.amount_sompi);

        let mut selected: Vec<CoinFragment> = Vec::new();
        let mut total = 0u64;
        for fragment in candidates {
            if total >= required_sompi {
                break;
            }
            total = total.saturating_add(fragment.amount_sompi);
            selected.push(fragment.clone());
        }

        if total < required_sompi {
            debug!(
                required = required_sompi,
                covered = total,
                purpose = %purpose,
                "No unreserved fragment subset covers the requested amount"
            );
            return None;
        }

        for fragment in &selected {
            state.reserved.insert(fragment.outpoint.clone());
        }

        let reservation = UtxoReservation {
            id: Uuid::new_v4().to_string(),
            total_sompi: total_sompi(&selected),
            fragments: selected,
            purpose: purpose.to_string(),
            created_at: Utc::now(),
        };

        debug!(
            reservation = %reservation.id,
            fragments = reservation.fragments.len(),
            total = reservation.total_sompi,
            purpose = %purpose,
            "Reserved coin fragments"
        );
        Some(reservation)
    }

    /// Permanently remove a reservation's fragments from eligibility after
    /// the spending transaction confirmed
    pub fn mark_spent(&self, reservation: UtxoReservation, tx_hash: &str) {
        let mut state = self.lock();
        for fragment in &reservation.fragments {
            state.reserved.remove(&fragment.outpoint);
            state.spent.insert(fragment.outpoint.clone());
        }
        info!(
            reservation = %reservation.id,
            tx_hash = %tx_hash,
            fragments = reservation.fragments.len(),
            "Marked reserved fragments as spent"
        );
    }

    /// Return a reservation's fragments to the eligible pool
    pub fn release(&self, reservation: UtxoReservation) {
        let mut state = self.lock();
        for fragment in &reservation.fragments {
            state.reserved.remove(&fragment.outpoint);
        }
        debug!(
            reservation = %reservation.id,
            fragments = reservation.fragments.len(),
            "Released reservation"
        );
    }

    /// Whether an outpoint is currently held by a live reservation
    pub fn is_reserved(&self, outpoint: &UtxoRef) -> bool {
        self.lock().reserved.contains(outpoint)
    }

    /// Number of fragments currently reserved (diagnostics)
    pub fn reserved_count(&self) -> usize {
        self.lock().reserved.len()
    }

    /// Number of fragments permanently spent (diagnostics)
    pub fn spent_count(&self) -> usize {
        self.lock().spent.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManagerState> {
        // A poisoned lock means a panic while holding it; the sets are
        // still structurally valid, so continue with the inner state
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Scoped hold on a reservation: released on drop unless committed
///
/// Guarantees release on every exit path, including cancellation and
/// errors, per the scoped-acquisition discipline.
pub struct ReservationGuard {
    manager: Arc<UtxoReservationManager>,
    reservation: Option<UtxoReservation>,
}

impl ReservationGuard {
    pub fn new(manager: Arc<UtxoReservationManager>, reservation: UtxoReservation) -> Self {
        Self {
            manager,
            reservation: Some(reservation),
        }
    }

    /// The held reservation
    pub fn reservation(&self) -> &UtxoReservation {
        // Only None after commit(), which consumes self
        self.reservation
            .as_ref()
            .unwrap_or_else(|| unreachable!("guard accessed after commit"))
    }

    /// Consume the guard, marking the fragments spent
    pub fn commit(mut self, tx_hash: &str) {
        if let Some(reservation) = self.reservation.take() {
            self.manager.mark_spent(reservation, tx_hash);
        }
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if let Some(reservation) = self.reservation.take() {
            self.manager.release(reservation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(txid: &str, index: u32, amount: u64) -> CoinFragment {
        CoinFragment::new(UtxoRef::new(txid, index), amount, "51")
    }

    fn pool() -> Vec<CoinFragment> {
        vec![
            fragment("a", 0, 500),
            fragment("b", 0, 1_000),
            fragment("c", 0, 2_000),
        ]
    }

    #[test]
    fn test_insufficient_funds_returns_none() {
        let manager = UtxoReservationManager::new();
        assert!(manager
            .select_and_reserve(&pool(), 10_000, "payout")
            .is_none());
        // Nothing may be left locked after a failed selection
        assert_eq!(manager.reserved_count(), 0);
    }

    #[test]
    fn test_selection_covers_amount_smallest_first() {
        let manager = UtxoReservationManager::new();
        let reservation = manager
            .select_and_reserve(&pool(), 1_200, "payout")
            .expect("pool covers 1200");
        assert!(reservation.total_sompi >= 1_200);
        // Smallest-first: 500 + 1000
        assert_eq!(reservation.fragments.len(), 2);
        assert_eq!(reservation.total_sompi, 1_500);
    }

    #[test]
    fn test_concurrent_reservations_are_disjoint() {
        let manager = UtxoReservationManager::new();
        let first = manager
            .select_and_reserve(&pool(), 1_200, "payout")
            .expect("first reservation");

        // Remaining unreserved value is 2000; a second request for more
        // must fail rather than double-count
        assert!(manager.select_and_reserve(&pool(), 2_500, "mint").is_none());

        let second = manager
            .select_and_reserve(&pool(), 1_500, "mint")
            .expect("second reservation from remaining fragments");
        for fragment in &second.fragments {
            assert!(!first
                .fragments
                .iter()
                .any(|f| f.outpoint == fragment.outpoint));
        }
    }

    #[test]
    fn test_release_restores_eligibility() {
        let manager = UtxoReservationManager::new();
        let reservation = manager
            .select_and_reserve(&pool(), 3_000, "payout")
            .expect("full pool");
        assert!(manager.select_and_reserve(&pool(), 500, "mint").is_none());

        manager.release(reservation);
        assert!(manager.select_and_reserve(&pool(), 500, "mint").is_some());
    }

    #[test]
    fn test_spent_fragments_never_return() {
        let manager = UtxoReservationManager::new();
        let reservation = manager
            .select_and_reserve(&pool(), 3_000, "payout")
            .expect("full pool");
        manager.mark_spent(reservation, "deadbeef");

        assert_eq!(manager.reserved_count(), 0);
        assert_eq!(manager.spent_count(), 3);
        assert!(manager.select_and_reserve(&pool(), 1, "payout").is_none());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let manager = Arc::new(UtxoReservationManager::new());
        {
            let reservation = manager
                .select_and_reserve(&pool(), 1_000, "payout")
                .expect("reserve");
            let _guard = ReservationGuard::new(Arc::clone(&manager), reservation);
            assert!(manager.reserved_count() > 0);
        }
        assert_eq!(manager.reserved_count(), 0);
    }

    #[test]
    fn test_guard_commit_marks_spent() {
        let manager = Arc::new(UtxoReservationManager::new());
        let reservation = manager
            .select_and_reserve(&pool(), 1_000, "payout")
            .expect("reserve");
        let held = reservation.fragments.len();
        let guard = ReservationGuard::new(Arc::clone(&manager), reservation);
        guard.commit("deadbeef");

        assert_eq!(manager.reserved_count(), 0);
        assert_eq!(manager.spent_count(), held);
    }
}
