use std::time::Duration;

use thiserror::Error;

use parley_gateway::{ErrorKind, GatewayError};
use parley_shared::{ConversationId, ValidationError};
use parley_store::StoreError;

/// Errors surfaced to the view layer by session reads and mutations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("No active conversation")]
    NoActiveConversation,

    #[error("Unknown conversation: {0}")]
    UnknownConversation(ConversationId),

    /// The optimistic write was refused by the cache.
    #[error("Cache rejected the change: {0}")]
    Store(#[from] StoreError),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Session closed")]
    SessionClosed,
}

impl ClientError {
    /// Where this error sits in the not-found / transport / validation
    /// taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Gateway(e) => e.kind(),
            Self::Timeout(_) | Self::SessionClosed => ErrorKind::Transport,
            Self::Validation(_)
            | Self::NoActiveConversation
            | Self::UnknownConversation(_)
            | Self::Store(_) => ErrorKind::Validation,
        }
    }

    /// Retriable by user action only; nothing retries automatically.
    pub fn is_retriable(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClientError>;
