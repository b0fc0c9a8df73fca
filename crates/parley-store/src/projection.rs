//! Edits applied to cached collections ahead of (or on behalf of) the
//! server.
//!
//! A projection is data, not a closure, so the same edit can be replayed
//! onto the live value or onto a snapshot taken earlier.

use parley_shared::{Conversation, ConversationId, ConversationUpdate, Message};

use crate::error::{Result, StoreError};
use crate::key::CacheKey;

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// Append a (transient) message to its conversation's thread.
    AppendMessage(Message),
    /// Replace a conversation's name and params in the list.
    UpdateConversation(ConversationUpdate),
    /// Add a conversation to the end of the list, or replace it in place.
    InsertConversation(Conversation),
    /// Drop a conversation from the list.
    RemoveConversation(ConversationId),
}

impl Projection {
    /// The key this projection writes to.
    pub fn key(&self) -> CacheKey {
        match self {
            Self::AppendMessage(message) => CacheKey::Messages(message.conversation_id.clone()),
            Self::UpdateConversation(_)
            | Self::InsertConversation(_)
            | Self::RemoveConversation(_) => CacheKey::Conversations,
        }
    }

    /// Apply to a conversation list.
    ///
    /// An absent list is left absent except by `InsertConversation`, which
    /// starts one.
    pub(crate) fn apply_to_conversations(
        &self,
        list: &mut Option<Vec<Conversation>>,
    ) -> Result<()> {
        match self {
            Self::UpdateConversation(update) => {
                let conv = list
                    .as_mut()
                    .and_then(|l| l.iter_mut().find(|c| c.id == update.id))
                    .ok_or_else(|| StoreError::ConversationMissing(update.id.clone()))?;
                update.apply_to(conv);
                Ok(())
            }
            Self::InsertConversation(conversation) => {
                let list = list.get_or_insert_with(Vec::new);
                match list.iter_mut().find(|c| c.id == conversation.id) {
                    Some(existing) => *existing = conversation.clone(),
                    None => list.push(conversation.clone()),
                }
                Ok(())
            }
            Self::RemoveConversation(id) => {
                if let Some(list) = list.as_mut() {
                    list.retain(|c| &c.id != id);
                }
                Ok(())
            }
            Self::AppendMessage(_) => Err(StoreError::KeyMismatch(CacheKey::Conversations)),
        }
    }

    /// Apply to a thread. A missing thread starts with this message.
    pub(crate) fn apply_to_messages(&self, thread: &mut Option<Vec<Message>>) -> Result<()> {
        match self {
            Self::AppendMessage(message) => {
                let thread = thread.get_or_insert_with(Vec::new);
                if thread.iter().any(|m| m.id == message.id) {
                    return Err(StoreError::DuplicateMessage(message.id.clone()));
                }
                thread.push(message.clone());
                Ok(())
            }
            _ => Err(StoreError::KeyMismatch(self.key())),
        }
    }
}
