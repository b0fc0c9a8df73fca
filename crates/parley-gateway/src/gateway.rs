//! The remote collaborator as seen by the client.

use async_trait::async_trait;

use parley_shared::{
    Conversation, ConversationDetail, ConversationId, ConversationUpdate, Message,
    NewConversation, SubmitMessage,
};

use crate::error::GatewayResult;

/// CRUD operations against the conversation backend.
///
/// Every failure comes back as a [`GatewayError`](crate::GatewayError);
/// implementations never panic past this boundary. Implementations are
/// stateless apart from their transport, so one instance is shared by every
/// in-flight call.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// All conversations, in server order.
    async fn list_conversations(&self) -> GatewayResult<Vec<Conversation>>;

    /// One conversation and its full thread.
    async fn get_conversation(&self, id: &ConversationId) -> GatewayResult<ConversationDetail>;

    /// Create a conversation. The server assigns the id.
    async fn create_conversation(&self, input: &NewConversation) -> GatewayResult<Conversation>;

    /// Replace a conversation's name and params.
    async fn update_conversation(&self, update: &ConversationUpdate)
        -> GatewayResult<Conversation>;

    async fn delete_conversation(&self, id: &ConversationId) -> GatewayResult<()>;

    /// Send a user message and wait for the assistant's reply. Returns the
    /// conversation's thread as the server holds it afterwards.
    async fn submit_message(&self, submit: &SubmitMessage) -> GatewayResult<Vec<Message>>;
}
