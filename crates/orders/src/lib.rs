//! `orderflow-orders` — the order domain.
//!
//! Pure domain types for the two-sided order service: the tagged event union,
//! the payload codec registry, immutable command records, and the lineage fold
//! that derives current state. No storage or transport concerns live here.

pub mod codec;
pub mod command;
pub mod event;
pub mod view;

pub use codec::{CodecError, CodecRegistry};
pub use command::{CommandRecord, CommandType};
pub use event::{OrderEvent, OrderEventKind, OrderPatch};
pub use view::{CANCELLED_STATUS, FoldStep, LoggingTrace, OrderView, TraceSink, fold_lineage};

/// Wire envelope specialized to order events.
pub type OrderEnvelope = orderflow_events::Envelope<OrderEvent>;
