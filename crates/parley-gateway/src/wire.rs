//! JSON shapes spoken by the conversation backend, and their translation
//! into domain types.
//!
//! The backend stores `params` as a free-form object and may omit message
//! ids, timestamps, or the timezone on timestamps. Everything here is lenient
//! on input: unknown or out-of-range params fall back to defaults and
//! missing message ids are synthesised from the conversation id and the
//! message's position.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use parley_shared::{
    Conversation, ConversationDetail, ConversationId, ConversationParams, Message, MessageId,
    Model, Role,
};

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct WireConversation {
    #[serde(alias = "_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub messages: Option<Vec<WireMessage>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireMessage {
    #[serde(default)]
    pub id: Option<String>,
    pub role: Role,
    pub content: String,
    #[serde(default, alias = "timestamp")]
    pub created_at: Option<String>,
}

/// FastAPI-style error body: `{"detail": ...}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    pub detail: Value,
}

impl ErrorBody {
    pub fn message(&self) -> String {
        match &self.detail {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl WireConversation {
    pub fn into_conversation(self) -> Conversation {
        Conversation {
            params: params_from_wire(&self.params),
            created_at: self.created_at.as_deref().and_then(parse_timestamp),
            updated_at: self.updated_at.as_deref().and_then(parse_timestamp),
            id: ConversationId(self.id),
            name: self.name,
            tokens: self.tokens,
        }
    }

    pub fn into_detail(mut self) -> ConversationDetail {
        let wire_messages = self.messages.take().unwrap_or_default();
        let conversation = self.into_conversation();
        let messages = messages_from_wire(&conversation.id, wire_messages);
        ConversationDetail {
            conversation,
            messages,
        }
    }
}

pub fn messages_from_wire(conversation_id: &ConversationId, wire: Vec<WireMessage>) -> Vec<Message> {
    wire.into_iter()
        .enumerate()
        .map(|(index, m)| {
            let server_id = match m.id {
                Some(id) if !id.is_empty() => id,
                _ => format!("{conversation_id}:{index}"),
            };
            Message {
                id: MessageId::confirmed(server_id),
                conversation_id: conversation_id.clone(),
                role: m.role,
                content: m.content,
                created_at: m.created_at.as_deref().and_then(parse_timestamp),
            }
        })
        .collect()
}

/// Read a params bag, substituting defaults for anything missing or invalid.
pub fn params_from_wire(value: &Value) -> ConversationParams {
    let defaults = ConversationParams::default();
    let Some(obj) = value.as_object() else {
        return defaults;
    };

    let system_prompt = obj
        .get("system_prompt")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or(defaults.system_prompt);

    let temperature = obj
        .get("temperature")
        .and_then(Value::as_f64)
        .filter(|t| (0.0..=1.0).contains(t))
        .unwrap_or(defaults.temperature);

    let max_completion_tokens = obj
        .get("max_completion_tokens")
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .filter(|n| {
            *n >= 1 && *n <= parley_shared::constants::MAX_COMPLETION_TOKENS_LIMIT
        })
        .unwrap_or(defaults.max_completion_tokens);

    let model = obj
        .get("model")
        .and_then(Value::as_str)
        .and_then(Model::parse)
        .unwrap_or(defaults.model);

    ConversationParams {
        system_prompt,
        temperature,
        max_completion_tokens,
        model,
    }
}

/// Parse RFC 3339, or a naive ISO timestamp which is taken to be UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ConversationBody<'a> {
    pub name: &'a str,
    pub params: ParamsBody<'a>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ParamsBody<'a> {
    Set(&'a ConversationParams),
    Empty(EmptyObject),
}

#[derive(Debug, Serialize)]
pub struct EmptyObject {}

impl<'a> From<Option<&'a ConversationParams>> for ParamsBody<'a> {
    fn from(params: Option<&'a ConversationParams>) -> Self {
        match params {
            Some(p) => Self::Set(p),
            None => Self::Empty(EmptyObject {}),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct QueryBody<'a> {
    pub id: &'a str,
    pub message: QueryMessage<'a>,
}

#[derive(Debug, Serialize)]
pub struct QueryMessage<'a> {
    pub role: Role,
    pub content: &'a str,
}
