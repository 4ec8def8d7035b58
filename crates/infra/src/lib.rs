//! `orderflow-infra` — storage, publishing, and processing infrastructure.
//!
//! This crate hosts the two durable halves of the pipeline and the workers
//! that drive them:
//!
//! - **Write side** ([`write`], [`ledger`], [`outbox`]): validated mutations
//!   append immutable command records to the ledger and stage wire envelopes
//!   in the outbox in one transaction; the publisher sweep drains the outbox
//!   to the message channel.
//! - **Read side** ([`inbox`]): the listener stages deliveries (dedup on event
//!   identity), and the processor sweep decodes, projects, and commits each
//!   record with retry/backoff and an EXPIRED dead-letter ceiling.
//!
//! Every store has an in-memory backend for tests/dev and a Postgres backend
//! for production.

pub mod inbox;
pub mod ledger;
pub mod outbox;
pub mod retry;
pub mod sweeper;
pub mod telemetry;
pub mod write;

pub use retry::{BackoffStrategy, RetryPolicy};
pub use sweeper::{Sweeper, SweeperConfig};

#[cfg(test)]
mod integration_tests;
