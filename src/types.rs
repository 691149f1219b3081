//! Error types shared across the settlement core
//!
//! Resource exhaustion (no spendable fragments, no token identifiers) is
//! deliberately *not* an error: the allocators return `None` and callers
//! branch. Everything here is either a recoverable user-facing condition
//! (`AlreadyReserved`, `Expired`, `NotEligible`) or an operational failure.

use thiserror::Error;

/// Errors produced by the settlement and reconciliation core
#[derive(Debug, Error)]
pub enum SettlementError {
    /// An unexpired mint reservation already exists for this certificate.
    /// The caller should resume the existing flow, not retry.
    #[error("an active mint reservation already exists for certificate {certificate_id}")]
    AlreadyReserved { certificate_id: String },

    /// The reservation aged out before confirmation. The user must restart
    /// the mint flow; the token id is reclaimed by the expiry sweep.
    #[error("mint reservation {reservation_id} has expired")]
    Expired { reservation_id: String },

    /// The collection has no token identifiers left (cursor at supply cap
    /// and recycled pool empty). Recoverable if an id is later recycled.
    #[error("collection {course_id} has no token identifiers available")]
    SupplyExhausted { course_id: String },

    /// A state transition was requested from the wrong state
    #[error("invalid reservation state: expected {expected}, got {actual}")]
    InvalidState {
        expected: &'static str,
        actual: String,
    },

    /// Referenced record does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// On-chain payload missing, malformed, or binding mismatch.
    /// Treated as a security event and logged with forensic context.
    #[error("on-chain verification failed: {0}")]
    VerificationFailed(String),

    /// RPC/indexer timeout or connection failure. Retried with backoff by
    /// the settlement queue, or on the next timer by the sync engine.
    #[error("transient ledger error: {0}")]
    TransientLedger(String),

    /// Local vs. ledger state conflict the reconciliation rules cannot
    /// resolve automatically. Local state is preserved; next sync retries.
    #[error("inconsistent state: {0}")]
    Inconsistent(String),

    /// MongoDB / store failure
    #[error("database error: {0}")]
    Database(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// The recipient failed the whitelist/anti-abuse gate
    #[error("not eligible: {0}")]
    NotEligible(String),
}

/// Convenience result type for settlement operations
pub type Result<T> = std::result::Result<T, SettlementError>;

impl SettlementError {
    /// Whether the caller can recover by branching (as opposed to an
    /// operational failure that should be surfaced or retried)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SettlementError::AlreadyReserved { .. }
                | SettlementError::Expired { .. }
                | SettlementError::SupplyExhausted { .. }
                | SettlementError::NotEligible(_)
        )
    }

    /// Whether a retry with backoff may succeed. Drives the settlement
    /// queue's retry-vs-dead-letter decision.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SettlementError::TransientLedger(_) | SettlementError::Database(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        let err = SettlementError::AlreadyReserved {
            certificate_id: "cert-1".into(),
        };
        assert!(err.is_recoverable());

        let err = SettlementError::VerificationFailed("binding mismatch".into());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_transient_classification() {
        assert!(SettlementError::TransientLedger("timeout".into()).is_transient());
        assert!(SettlementError::Database("no primary".into()).is_transient());
        assert!(!SettlementError::VerificationFailed("bad payload".into()).is_transient());
    }
}
