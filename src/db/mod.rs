//! Durable storage layer
//!
//! MongoDB in production, in-memory in dev mode and tests, behind the
//! store traits in [`store`].

pub mod memory;
pub mod mongo;
pub mod mongo_stores;
pub mod schemas;
pub mod store;

pub use memory::{MemoryConversationStore, MemoryCounterStore, MemoryReservationStore};
pub use mongo::MongoClient;
pub use mongo_stores::{MongoConversationStore, MongoCounterStore, MongoReservationStore};
pub use store::{ConversationStore, CounterStore, ReservationStore};
