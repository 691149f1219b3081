//! Document schemas for the settlement store

pub mod conversation;
pub mod metadata;
pub mod mint_reservation;
pub mod token_counter;

pub use conversation::{ConversationDoc, CONVERSATION_COLLECTION};
pub use metadata::Metadata;
pub use mint_reservation::{MintReservationDoc, MINT_RESERVATION_COLLECTION};
pub use token_counter::{TokenCounterDoc, TOKEN_COUNTER_COLLECTION};
