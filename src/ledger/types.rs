//! Shared ledger value objects
//!
//! Amounts are in sompi (1 coin = 100,000,000 sompi) and always `u64`;
//! arithmetic on them goes through checked/saturating operations.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sompi per whole coin
pub const SOMPI_PER_COIN: u64 = 100_000_000;

/// Reference to a single spendable output: `(transaction id, output index)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UtxoRef {
    /// Transaction id that created the output (hex)
    pub transaction_id: String,
    /// Index of the output within that transaction
    pub output_index: u32,
}

impl UtxoRef {
    pub fn new(transaction_id: impl Into<String>, output_index: u32) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            output_index,
        }
    }
}

impl fmt::Display for UtxoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transaction_id, self.output_index)
    }
}

/// A spendable coin fragment (UTXO) as observed on the ledger
///
/// Immutable once observed; consumed exactly once by a confirmed
/// transaction. The reservation manager guarantees no fragment is
/// referenced by two concurrently-broadcast transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinFragment {
    /// Outpoint identifying this fragment
    pub outpoint: UtxoRef,
    /// Value in sompi
    pub amount_sompi: u64,
    /// Locking script (hex)
    pub script_pubkey: String,
}

impl CoinFragment {
    pub fn new(outpoint: UtxoRef, amount_sompi: u64, script_pubkey: impl Into<String>) -> Self {
        Self {
            outpoint,
            amount_sompi,
            script_pubkey: script_pubkey.into(),
        }
    }
}

/// Sum fragment amounts without overflow
pub fn total_sompi(fragments: &[CoinFragment]) -> u64 {
    fragments
        .iter()
        .fold(0u64, |acc, f| acc.saturating_add(f.amount_sompi))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utxo_ref_display() {
        let outpoint = UtxoRef::new("ab12", 3);
        assert_eq!(outpoint.to_string(), "ab12:3");
    }

    #[test]
    fn test_total_sompi_saturates() {
        let fragments = vec![
            CoinFragment::new(UtxoRef::new("a", 0), u64::MAX, ""),
            CoinFragment::new(UtxoRef::new("b", 0), 100, ""),
        ];
        assert_eq!(total_sompi(&fragments), u64::MAX);
    }
}
