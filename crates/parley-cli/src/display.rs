//! Terminal rendering of conversations and messages.

use std::fmt::Display;

use chrono::{DateTime, Duration, TimeZone};

use parley_client::{Conversation, ConversationId, Message, MessageId, ReadStatus, Role};

/// Short relative timestamp: the time for today, weekday and time within
/// the last week, the full date otherwise.
pub fn format_timestamp<Tz>(at: &DateTime<Tz>, now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    if at.date_naive() == now.date_naive() {
        at.format("%H:%M").to_string()
    } else if *at > now.clone() - Duration::days(7) {
        at.format("%a %H:%M").to_string()
    } else {
        at.format("%b %-d, %Y").to_string()
    }
}

pub fn conversation_line<Tz>(
    index: usize,
    conversation: &Conversation,
    active: Option<&ConversationId>,
    now: &DateTime<Tz>,
) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let marker = if active == Some(&conversation.id) { '*' } else { ' ' };
    let updated = conversation
        .updated_at
        .map(|at| format_timestamp(&at.with_timezone(&now.timezone()), now))
        .unwrap_or_default();
    format!(
        "{marker} {index:>2}. {name}  [{updated}] {tokens} tokens",
        name = conversation.name,
        tokens = conversation.tokens,
    )
}

pub fn message_line(message: &Message) -> String {
    let who = match message.role {
        Role::User => "you",
        Role::Assistant => "assistant",
        Role::System => "system",
    };
    let pending = match message.id {
        MessageId::Optimistic { .. } => " (sending)",
        MessageId::Confirmed { .. } => "",
    };
    format!("{who}{pending}: {}", message.content)
}

pub fn status_line(status: &ReadStatus) -> Option<String> {
    match status {
        ReadStatus::Loading => Some("loading...".to_string()),
        ReadStatus::Failed(error) => Some(format!("could not load: {error}")),
        ReadStatus::Missing | ReadStatus::Ready | ReadStatus::Refreshing => None,
    }
}
