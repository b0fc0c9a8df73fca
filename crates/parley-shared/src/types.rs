use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{
    DEFAULT_MAX_COMPLETION_TOKENS, DEFAULT_TEMPERATURE, MAX_COMPLETION_TOKENS_LIMIT,
};
use crate::error::ValidationError;

// Conversation identity is assigned by the server and treated as opaque.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identity of a message in a thread.
///
/// A message submitted by the user lives under a transient local id until
/// the thread is reloaded from the server, at which point the whole list is
/// replaced by confirmed entries. The two never mix inside the server's
/// list, so reconciliation can match on the variant instead of guessing from
/// the id's shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageId {
    Optimistic { local_id: Uuid },
    Confirmed { server_id: String },
}

impl MessageId {
    /// A fresh transient id. Never reused within the process.
    pub fn transient() -> Self {
        Self::Optimistic {
            local_id: Uuid::new_v4(),
        }
    }

    pub fn confirmed(server_id: impl Into<String>) -> Self {
        Self::Confirmed {
            server_id: server_id.into(),
        }
    }

    pub fn is_optimistic(&self) -> bool {
        matches!(self, Self::Optimistic { .. })
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Optimistic { local_id } => write!(f, "local:{local_id}"),
            Self::Confirmed { server_id } => f.write_str(server_id),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Completion models the assistant backend accepts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum Model {
    #[default]
    #[serde(rename = "gpt-4o-mini")]
    Gpt4oMini,
    #[serde(rename = "gpt-3.5-turbo")]
    Gpt35Turbo,
}

impl Model {
    pub const ALL: [Model; 2] = [Model::Gpt4oMini, Model::Gpt35Turbo];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gpt4oMini => "gpt-4o-mini",
            Self::Gpt35Turbo => "gpt-3.5-turbo",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == s)
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-conversation completion settings. Always replaced as a whole.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationParams {
    pub system_prompt: String,
    pub temperature: f64,
    pub max_completion_tokens: u32,
    pub model: Model,
}

impl Default for ConversationParams {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            temperature: DEFAULT_TEMPERATURE,
            max_completion_tokens: DEFAULT_MAX_COMPLETION_TOKENS,
            model: Model::default(),
        }
    }
}

impl ConversationParams {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(0.0..=1.0).contains(&self.temperature) {
            return Err(ValidationError::TemperatureOutOfRange(self.temperature));
        }
        if self.max_completion_tokens == 0
            || self.max_completion_tokens > MAX_COMPLETION_TOKENS_LIMIT
        {
            return Err(ValidationError::MaxTokensOutOfRange(
                self.max_completion_tokens,
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: ConversationId,
    pub name: String,
    pub params: ConversationParams,
    /// Usage counter reported by the server.
    pub tokens: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: Role,
    pub content: String,
    /// Client clock for optimistic messages; advisory only.
    pub created_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Build the transient user message shown while a submit is in flight.
    pub fn optimistic(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::transient(),
            conversation_id,
            role: Role::User,
            content: content.into(),
            created_at: Some(Utc::now()),
        }
    }
}

/// A conversation together with its full thread.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationDetail {
    pub conversation: Conversation,
    pub messages: Vec<Message>,
}

/// Input for creating a conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct NewConversation {
    pub name: String,
    pub params: Option<ConversationParams>,
}

impl NewConversation {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        match &self.params {
            Some(params) => params.validate(),
            None => Ok(()),
        }
    }
}

/// Full replacement of a conversation's mutable fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationUpdate {
    pub id: ConversationId,
    pub name: String,
    pub params: ConversationParams,
}

impl ConversationUpdate {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        self.params.validate()
    }

    /// Apply this update to a cached conversation, leaving server-owned
    /// fields untouched.
    pub fn apply_to(&self, conversation: &mut Conversation) {
        conversation.name = self.name.clone();
        conversation.params = self.params.clone();
    }
}

/// A user message bound for a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitMessage {
    pub conversation_id: ConversationId,
    pub content: String,
}

impl SubmitMessage {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.content.trim().is_empty() {
            return Err(ValidationError::EmptyContent);
        }
        Ok(())
    }
}
