//! Ledger-facing types and external client contracts
//!
//! The public ledger is consumed, never defined: these modules hold the
//! value objects shared across the core plus the trait contracts for the
//! ledger RPC node, the conversation indexer, and the script builder.

pub mod indexer;
pub mod payload;
pub mod rpc;
pub mod script;
pub mod types;

pub use indexer::{ConversationIndexer, ConversationStatus, IndexedConversation};
pub use payload::{derive_conversation_id, ProtocolPayload};
pub use rpc::{LedgerRpc, LedgerTransaction};
pub use script::{MintScript, ScriptBuilder};
pub use types::{CoinFragment, UtxoRef};
