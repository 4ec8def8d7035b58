//! Command ledger: append-only write-side history and state reconstruction.

pub mod in_memory;
pub mod postgres;
pub mod reconstructor;
pub mod store;

pub use in_memory::InMemoryCommandLedger;
pub use postgres::PostgresCommandLedger;
pub use reconstructor::{OrderReconstructor, ReconstructError};
pub use store::{CommandLedger, LedgerError};
