//! Cache keys and the values stored under them.

use std::fmt;

use serde::Serialize;

use parley_shared::{Conversation, ConversationId, Message};

/// Structured cache key. One list of conversations, and one thread per
/// conversation id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "collection", content = "conversation_id", rename_all = "snake_case")]
pub enum CacheKey {
    Conversations,
    Messages(ConversationId),
}

impl CacheKey {
    pub fn messages(id: impl Into<ConversationId>) -> Self {
        Self::Messages(id.into())
    }

    /// The conversation a per-conversation key belongs to.
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::Conversations => None,
            Self::Messages(id) => Some(id),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conversations => f.write_str("conversations"),
            Self::Messages(id) => write!(f, "messages({id})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Conversations(Vec<Conversation>),
    Messages(Vec<Message>),
}

impl CacheValue {
    pub fn len(&self) -> usize {
        match self {
            Self::Conversations(list) => list.len(),
            Self::Messages(list) => list.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn matches(&self, key: &CacheKey) -> bool {
        matches!(
            (self, key),
            (Self::Conversations(_), CacheKey::Conversations)
                | (Self::Messages(_), CacheKey::Messages(_))
        )
    }
}
