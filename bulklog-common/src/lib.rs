//! Shared building blocks for the bulklog delivery engine.
//!
//! This crate holds the pieces that are independent of the buffering and
//! delivery semantics: a [`Clock`] abstraction so time-driven code stays
//! testable, and the [`Store`] adapter over the key/value backends the
//! engine can persist to (in-memory for a single process, Redis for a
//! shared deployment).

pub mod clock;
pub mod store;

pub use clock::{Clock, MockClock, SystemClock, TokioClock};
pub use store::factory::create_store;
pub use store::{Store, StoreConfig, StoreError, StoreResult, StoreTx};
