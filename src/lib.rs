//! Laurel - settlement and reconciliation core for on-chain learning rewards
//!
//! Laurel sits between an e-learning platform and a high-throughput UTXO
//! ledger. It never holds user keys: learners sign from their own
//! wallets, while Laurel manages the treasury-funded side of settlement
//! and keeps a rebuildable local view of on-chain conversation state.
//!
//! ## Services
//!
//! - **Utxo**: exclusive coin fragment reservation for concurrent builders
//! - **Tokens**: race-free token identifier allocation with recycling
//! - **Mint**: the non-custodial diploma mint state machine
//! - **Reconcile**: indexer-authoritative conversation sync and on-chain
//!   payload verification
//! - **Queue**: sequential settlement worker with retry and dead-letter
//! - **Service**: the facade the platform calls

pub mod config;
pub mod db;
pub mod ledger;
pub mod mint;
pub mod queue;
pub mod reconcile;
pub mod service;
pub mod tokens;
pub mod types;
pub mod utxo;

pub use config::Args;
pub use service::SettlementService;
pub use types::{Result, SettlementError};
