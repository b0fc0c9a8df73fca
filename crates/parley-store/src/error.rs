use thiserror::Error;

use parley_shared::{ConversationId, MessageId};

use crate::key::CacheKey;

/// Errors produced by the cache layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The conversation an optimistic write targets is no longer cached
    /// (deleted, or the list has not loaded).
    #[error("Conversation not in cache: {0}")]
    ConversationMissing(ConversationId),

    /// A message with this id is already in the thread.
    #[error("Duplicate message id: {0}")]
    DuplicateMessage(MessageId),

    /// A value of the wrong collection was written under a key.
    #[error("Value does not match key {0}")]
    KeyMismatch(CacheKey),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
