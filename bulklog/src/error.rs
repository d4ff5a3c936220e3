//! Engine error types.
//!
//! Producers only ever see errors from [`Document::new`](crate::Document::new),
//! [`Engine::register`](crate::Engine::register) and
//! [`Engine::append`](crate::Engine::append). Background failures (flush
//! conflicts, consumer errors, store outages) are logged and retried, never
//! propagated.

use bulklog_common::StoreError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The document body did not parse as a JSON object.
    #[error("document body is not a JSON object")]
    UnparsableBody,

    /// The collection descriptor violates `0 < flush period <= retention
    /// period` or is otherwise malformed.
    #[error("invalid collection {0}")]
    InvalidCollection(String),

    /// Append or registration targeted a collection the engine does not
    /// know about.
    #[error("unknown collection {0}")]
    UnknownCollection(String),

    /// A collection with this name is already registered.
    #[error("collection {0} is already registered")]
    DuplicateCollection(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The flush transaction kept conflicting or failing past its retry
    /// bound.
    #[error("flush failed for collection {collection} after {attempts} attempts")]
    FlushFailed { collection: String, attempts: u32 },

    /// A stored record failed to decode.
    #[error("encoding error: {0}")]
    Encoding(String),
}
