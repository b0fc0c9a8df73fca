//! A gateway whose calls are answered by the test, one at a time.
//!
//! [`scripted`] returns a [`ScriptedGateway`] to hand to the code under test
//! and a [`ScriptedRemote`] the test holds. Every call the gateway receives
//! shows up as a [`PendingCall`] on the remote; the test decides when and how
//! it resolves, which makes response ordering fully deterministic.
//! [`FakeBackend`] gives the server-side semantics when the test just wants
//! realistic answers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};

use parley_shared::{
    Conversation, ConversationDetail, ConversationId, ConversationParams, ConversationUpdate,
    Message, MessageId, NewConversation, Role, SubmitMessage,
};

use crate::error::{GatewayError, GatewayResult};
use crate::gateway::RemoteGateway;

const NEXT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    ListConversations,
    GetConversation(ConversationId),
    CreateConversation(NewConversation),
    UpdateConversation(ConversationUpdate),
    DeleteConversation(ConversationId),
    SubmitMessage(SubmitMessage),
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayReply {
    Conversations(Vec<Conversation>),
    Detail(ConversationDetail),
    Conversation(Conversation),
    Deleted,
    Messages(Vec<Message>),
}

/// A call waiting for the test to answer it. Dropping it unanswered fails
/// the call with a transport error.
#[derive(Debug)]
pub struct PendingCall {
    pub call: GatewayCall,
    reply: oneshot::Sender<GatewayResult<GatewayReply>>,
}

impl PendingCall {
    pub fn reply(self, result: GatewayResult<GatewayReply>) {
        // The caller may have been aborted; nothing to do then.
        let _ = self.reply.send(result);
    }

    pub fn succeed(self, reply: GatewayReply) {
        self.reply(Ok(reply));
    }

    pub fn fail(self, error: GatewayError) {
        self.reply(Err(error));
    }

    /// Answer from the fake backend's state.
    pub fn serve(self, backend: &mut FakeBackend) {
        let result = backend.handle(&self.call);
        self.reply(result);
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedGateway {
    tx: mpsc::UnboundedSender<PendingCall>,
    calls: Arc<AtomicUsize>,
}

#[derive(Debug)]
pub struct ScriptedRemote {
    rx: mpsc::UnboundedReceiver<PendingCall>,
    calls: Arc<AtomicUsize>,
}

pub fn scripted() -> (ScriptedGateway, ScriptedRemote) {
    let (tx, rx) = mpsc::unbounded_channel();
    let calls = Arc::new(AtomicUsize::new(0));
    (
        ScriptedGateway {
            tx,
            calls: calls.clone(),
        },
        ScriptedRemote { rx, calls },
    )
}

impl ScriptedRemote {
    /// Wait for the next call. Panics if none arrives within a few seconds.
    pub async fn next_call(&mut self) -> PendingCall {
        match tokio::time::timeout(NEXT_CALL_TIMEOUT, self.rx.recv()).await {
            Ok(Some(call)) => call,
            Ok(None) => panic!("gateway dropped while waiting for a call"),
            Err(_) => panic!("no gateway call within {NEXT_CALL_TIMEOUT:?}"),
        }
    }

    /// A call that has already been issued, if any.
    pub fn try_next_call(&mut self) -> Option<PendingCall> {
        self.rx.try_recv().ok()
    }

    /// Total calls issued so far, answered or not.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Answer every call from `backend` on a background task.
    pub fn auto_serve(mut self, mut backend: FakeBackend) -> tokio::task::JoinHandle<FakeBackend> {
        tokio::spawn(async move {
            while let Some(pending) = self.rx.recv().await {
                pending.serve(&mut backend);
            }
            backend
        })
    }
}

impl ScriptedGateway {
    async fn call(&self, call: GatewayCall) -> GatewayResult<GatewayReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PendingCall { call, reply })
            .map_err(|_| GatewayError::transport("scripted remote closed"))?;
        rx.await
            .map_err(|_| GatewayError::transport("call dropped without a reply"))?
    }
}

fn unexpected(reply: GatewayReply) -> GatewayError {
    GatewayError::transport(format!("unexpected reply: {reply:?}"))
}

#[async_trait]
impl RemoteGateway for ScriptedGateway {
    async fn list_conversations(&self) -> GatewayResult<Vec<Conversation>> {
        match self.call(GatewayCall::ListConversations).await? {
            GatewayReply::Conversations(list) => Ok(list),
            other => Err(unexpected(other)),
        }
    }

    async fn get_conversation(&self, id: &ConversationId) -> GatewayResult<ConversationDetail> {
        match self.call(GatewayCall::GetConversation(id.clone())).await? {
            GatewayReply::Detail(detail) => Ok(detail),
            other => Err(unexpected(other)),
        }
    }

    async fn create_conversation(&self, input: &NewConversation) -> GatewayResult<Conversation> {
        match self.call(GatewayCall::CreateConversation(input.clone())).await? {
            GatewayReply::Conversation(conv) => Ok(conv),
            other => Err(unexpected(other)),
        }
    }

    async fn update_conversation(
        &self,
        update: &ConversationUpdate,
    ) -> GatewayResult<Conversation> {
        match self.call(GatewayCall::UpdateConversation(update.clone())).await? {
            GatewayReply::Conversation(conv) => Ok(conv),
            other => Err(unexpected(other)),
        }
    }

    async fn delete_conversation(&self, id: &ConversationId) -> GatewayResult<()> {
        match self.call(GatewayCall::DeleteConversation(id.clone())).await? {
            GatewayReply::Deleted => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn submit_message(&self, submit: &SubmitMessage) -> GatewayResult<Vec<Message>> {
        match self.call(GatewayCall::SubmitMessage(submit.clone())).await? {
            GatewayReply::Messages(messages) => Ok(messages),
            other => Err(unexpected(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Fake backend
// ---------------------------------------------------------------------------

/// In-memory stand-in for the conversation server.
///
/// The assistant echoes the user's message back, and each exchange costs
/// ten tokens.
#[derive(Debug, Default, Clone)]
pub struct FakeBackend {
    conversations: Vec<Conversation>,
    threads: HashMap<ConversationId, Vec<Message>>,
    next_conversation: u64,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend already holding conversations with the given names. Ids are
    /// the lowercased names.
    pub fn with_conversations(names: &[&str]) -> Self {
        let mut backend = Self::new();
        for name in names {
            let id = ConversationId::new(name.to_lowercase());
            backend.conversations.push(conversation(id.clone(), name));
            backend.threads.insert(id, Vec::new());
        }
        backend
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn thread(&self, id: &ConversationId) -> Option<&[Message]> {
        self.threads.get(id).map(Vec::as_slice)
    }

    /// Add a message directly to a stored thread.
    pub fn push_message(&mut self, id: &ConversationId, role: Role, content: &str) {
        if let Some(thread) = self.threads.get_mut(id) {
            let index = thread.len();
            thread.push(Message {
                id: MessageId::confirmed(format!("{id}:{index}")),
                conversation_id: id.clone(),
                role,
                content: content.to_string(),
                created_at: Some(Utc::now()),
            });
        }
    }

    pub fn handle(&mut self, call: &GatewayCall) -> GatewayResult<GatewayReply> {
        match call {
            GatewayCall::ListConversations => {
                Ok(GatewayReply::Conversations(self.conversations.clone()))
            }
            GatewayCall::GetConversation(id) => self.detail(id).map(GatewayReply::Detail),
            GatewayCall::CreateConversation(input) => {
                self.next_conversation += 1;
                let id = ConversationId::new(format!("conv-{}", self.next_conversation));
                let mut conv = conversation(id.clone(), &input.name);
                if let Some(params) = &input.params {
                    conv.params = params.clone();
                }
                self.conversations.push(conv.clone());
                self.threads.insert(id, Vec::new());
                Ok(GatewayReply::Conversation(conv))
            }
            GatewayCall::UpdateConversation(update) => {
                let conv = self.find_mut(&update.id)?;
                update.apply_to(conv);
                conv.updated_at = Some(Utc::now());
                Ok(GatewayReply::Conversation(conv.clone()))
            }
            GatewayCall::DeleteConversation(id) => {
                let before = self.conversations.len();
                self.conversations.retain(|c| &c.id != id);
                if self.conversations.len() == before {
                    return Err(not_found(id));
                }
                self.threads.remove(id);
                Ok(GatewayReply::Deleted)
            }
            GatewayCall::SubmitMessage(submit) => {
                let id = submit.conversation_id.clone();
                self.find_mut(&id)?.tokens += 10;
                self.push_message(&id, Role::User, &submit.content);
                self.push_message(&id, Role::Assistant, &format!("echo: {}", submit.content));
                Ok(GatewayReply::Messages(self.detail(&id)?.messages))
            }
        }
    }

    fn find_mut(&mut self, id: &ConversationId) -> GatewayResult<&mut Conversation> {
        self.conversations
            .iter_mut()
            .find(|c| &c.id == id)
            .ok_or_else(|| not_found(id))
    }

    fn detail(&self, id: &ConversationId) -> GatewayResult<ConversationDetail> {
        let conversation = self
            .conversations
            .iter()
            .find(|c| &c.id == id)
            .cloned()
            .ok_or_else(|| not_found(id))?;
        let messages = self.threads.get(id).cloned().unwrap_or_default();
        Ok(ConversationDetail {
            conversation,
            messages,
        })
    }
}

fn conversation(id: ConversationId, name: &str) -> Conversation {
    let now = Utc::now();
    Conversation {
        id,
        name: name.to_string(),
        params: ConversationParams::default(),
        tokens: 0,
        created_at: Some(now),
        updated_at: Some(now),
    }
}

fn not_found(id: &ConversationId) -> GatewayError {
    GatewayError::not_found(format!("Conversation with ID {id} not found"))
}
