//! Write side: validated mutations committed to the ledger and outbox together.

pub mod in_memory;
pub mod postgres;
pub mod service;
pub mod store;

pub use in_memory::InMemoryWriteStore;
pub use postgres::PostgresWriteStore;
pub use service::{WriteConfig, WriteSide};
pub use store::{WriteError, WriteStore};
