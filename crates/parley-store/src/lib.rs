//! # parley-store
//!
//! In-memory entity cache for the Parley client.
//!
//! The cache holds the conversation list and one thread per conversation,
//! each under a structured [`CacheKey`]. It knows nothing about the network:
//! callers claim a [`FetchTicket`] before fetching and hand the result back,
//! and optimistic edits arrive as [`Projection`]s that can be undone from a
//! [`Snapshot`]. All operations are synchronous; the owner serializes access.

pub mod cache;
pub mod key;
pub mod projection;
pub mod slot;

mod error;

pub use cache::{EntityCache, Snapshot};
pub use error::{Result, StoreError};
pub use key::{CacheKey, CacheValue};
pub use projection::Projection;
pub use slot::{FetchTicket, ReadStatus};
