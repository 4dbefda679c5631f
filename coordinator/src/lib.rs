pub mod api_handlers;
pub mod app_state;
pub mod config;
pub mod coordinator;
pub mod peer;
pub mod postgres;
pub mod registry;
pub mod store;
pub mod transaction;

pub use crate::coordinator::{Coordinator, CoordinatorOptions};
pub use peer::HttpParticipantClient;
pub use store::{MemoryTransactionStore, TransactionStore};
