use std::sync::Arc;

use tracing::{debug, info, warn};

use parley_gateway::ErrorKind;
use parley_shared::{Message, SubmitMessage};
use parley_store::{CacheKey, Projection};

use crate::error::{ClientError, Result};
use crate::events::{settled, MutationOutcome, SessionEvent};
use crate::pipeline::{MutationHandle, MutationId, MutationKind};
use crate::session::{Session, Shared};

impl Session {
    /// Send `content` to the active conversation.
    ///
    /// The user's message shows up in the thread before this returns, under
    /// a transient id. The assistant's reply arrives with the refetch that
    /// follows a successful submit.
    pub fn submit_message(&self, content: impl Into<String>) -> Result<MutationHandle> {
        let shared = &self.shared;
        shared.ensure_open()?;

        let (handle, submit) = {
            let mut guard = shared.lock();
            let state = &mut *guard;
            let conversation_id = state
                .selection
                .active()
                .cloned()
                .ok_or(ClientError::NoActiveConversation)?;
            let submit = SubmitMessage {
                conversation_id,
                content: content.into(),
            };
            submit.validate()?;

            let message = Message::optimistic(submit.conversation_id.clone(), submit.content.clone());
            let local_id = message.id.clone();
            let handle = state.pipeline.begin(
                MutationKind::SubmitMessage,
                &mut state.cache,
                Some(Projection::AppendMessage(message)),
            )?;
            state.pipeline.mark_in_flight(handle.id());
            info!(
                mutation = %handle.id(),
                conversation = %submit.conversation_id,
                message = %local_id,
                "Message staged"
            );

            let key = CacheKey::Messages(submit.conversation_id.clone());
            shared.publish(state, vec![SessionEvent::CacheUpdated { key }]);
            (handle, submit)
        };

        let id = handle.id();
        let task = Arc::clone(shared);
        shared.spawn(async move {
            let result = task.call(task.gateway.submit_message(&submit)).await;
            task.settle_submit(id, &submit, result.map(drop));
        });
        Ok(handle)
    }
}

impl Shared {
    fn settle_submit(self: &Arc<Self>, id: MutationId, submit: &SubmitMessage, result: Result<()>) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let conversation = &submit.conversation_id;
        let key = CacheKey::Messages(conversation.clone());
        let kind = MutationKind::SubmitMessage;
        let mut events = Vec::new();

        match result {
            Ok(()) => {
                if state.pipeline.commit(id) {
                    info!(mutation = %id, %conversation, "Message committed");
                    events.push(settled(id, kind, MutationOutcome::Committed));
                    self.refetch_written(state, [key, CacheKey::Conversations]);
                } else {
                    debug!(mutation = %id, %conversation, "Server accepted a settled message");
                    events.push(SessionEvent::StaleSuccess { id, kind });
                }
            }
            Err(error) => {
                if !state.pipeline.rollback(id, &mut state.cache, error.clone()) {
                    debug!(mutation = %id, error = %error, "Late failure ignored");
                    return;
                }
                warn!(mutation = %id, %conversation, error = %error, "Message rolled back");
                if error.kind() == ErrorKind::NotFound {
                    state.cache.evict(conversation);
                    self.invalidate_and_refetch(state, [CacheKey::Conversations]);
                }
                events.push(SessionEvent::CacheUpdated { key });
                events.push(settled(id, kind, MutationOutcome::RolledBack(error)));
            }
        }

        self.publish(state, events);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parley_gateway::scripted::{scripted, FakeBackend, GatewayCall, GatewayReply};
    use parley_gateway::GatewayError;
    use parley_shared::{Conversation, ConversationDetail, ConversationParams, ValidationError};

    use crate::config::ClientConfig;
    use crate::pipeline::MutationStatus;
    use crate::session::test_support::*;

    use super::*;

    fn conv(id: &str) -> Conversation {
        Conversation {
            id: id.into(),
            name: id.to_uppercase(),
            params: ConversationParams::default(),
            tokens: 0,
            created_at: None,
            updated_at: None,
        }
    }

    /// Session with `[a]` loaded and an empty thread for `a`, driven by hand.
    async fn loaded_by_hand() -> (Session, parley_gateway::scripted::ScriptedRemote) {
        let (session, mut remote) = scripted_session();
        remote
            .next_call()
            .await
            .succeed(GatewayReply::Conversations(vec![conv("a")]));
        remote.next_call().await.succeed(GatewayReply::Detail(ConversationDetail {
            conversation: conv("a"),
            messages: Vec::new(),
        }));
        eventually(|| session.messages_for(&"a".into()).is_some()).await;
        (session, remote)
    }

    fn contents(session: &Session) -> Vec<String> {
        session
            .messages_for(&"a".into())
            .unwrap_or_default()
            .into_iter()
            .map(|m| m.content)
            .collect()
    }

    #[tokio::test]
    async fn test_optimistic_message_visible_immediately() {
        let session = served_session(&["A"]).await;
        let handle = session.submit_message("hello").unwrap();

        let thread = session.messages_for(&"a".into()).unwrap();
        assert_eq!(thread.len(), 1);
        assert!(thread[0].id.is_optimistic());
        assert_eq!(thread[0].content, "hello");
        assert!(handle.is_pending());
    }

    #[tokio::test]
    async fn test_submit_success_reconciles_with_server() {
        let session = served_session(&["A"]).await;
        let handle = session.submit_message("hello").unwrap();
        handle.settled().await.unwrap();

        eventually(|| {
            let thread = session.messages_for(&"a".into()).unwrap_or_default();
            thread.len() == 2 && thread.iter().all(|m| !m.id.is_optimistic())
        })
        .await;
        assert_eq!(contents(&session), ["hello", "echo: hello"]);
        eventually(|| session.active_conversation().is_some_and(|c| c.tokens == 10)).await;
    }

    #[tokio::test]
    async fn test_submit_failure_restores_thread_exactly() {
        let (session, mut remote) = loaded_by_hand().await;
        let before = session.messages_for(&"a".into());

        let handle = session.submit_message("hello").unwrap();
        let call = remote.next_call().await;
        assert!(matches!(call.call, GatewayCall::SubmitMessage(_)));
        call.fail(GatewayError::transport("connection reset"));

        let err = handle.settled().await.unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(session.messages_for(&"a".into()), before);
        assert!(matches!(handle.status(), MutationStatus::RolledBack(_)));
    }

    #[tokio::test]
    async fn test_first_failure_does_not_resurrect_or_drop_second() {
        let (session, mut remote) = loaded_by_hand().await;
        let mut backend = FakeBackend::with_conversations(&["A"]);

        let first = session.submit_message("one").unwrap();
        let second = session.submit_message("two").unwrap();
        assert_eq!(contents(&session), ["one", "two"]);

        let call_one = remote.next_call().await;
        let call_two = remote.next_call().await;
        call_one.fail(GatewayError::transport("connection reset"));
        assert!(first.settled().await.is_err());
        assert_eq!(contents(&session), ["two"]);

        call_two.serve(&mut backend);
        second.settled().await.unwrap();

        // Commit refetches both the thread and the list.
        for _ in 0..2 {
            remote.next_call().await.serve(&mut backend);
        }
        eventually(|| contents(&session) == ["two", "echo: two"]).await;
        let thread = session.messages_for(&"a".into()).unwrap();
        assert!(thread.iter().all(|m| !m.id.is_optimistic()));
    }

    #[tokio::test]
    async fn test_submit_validation() {
        let session = served_session(&["A"]).await;
        assert_eq!(
            session.submit_message("   ").unwrap_err(),
            ClientError::Validation(ValidationError::EmptyContent)
        );
        assert_eq!(session.pending_mutations(), 0);
        assert!(contents(&session).is_empty());
    }

    #[tokio::test]
    async fn test_submit_without_active_conversation() {
        let session = served_session(&[]).await;
        assert_eq!(
            session.submit_message("hi").unwrap_err(),
            ClientError::NoActiveConversation
        );
    }

    #[tokio::test]
    async fn test_submit_timeout_rolls_back() {
        let (gateway, mut remote) = scripted();
        let config = ClientConfig {
            request_timeout: Duration::from_millis(50),
            ..ClientConfig::default()
        };
        let session = Session::init(Arc::new(gateway), config);
        remote
            .next_call()
            .await
            .succeed(GatewayReply::Conversations(vec![conv("a")]));
        remote.next_call().await.succeed(GatewayReply::Detail(ConversationDetail {
            conversation: conv("a"),
            messages: Vec::new(),
        }));
        eventually(|| session.messages_for(&"a".into()).is_some()).await;

        let handle = session.submit_message("hello").unwrap();
        let _unanswered = remote.next_call().await;
        assert!(matches!(
            handle.settled().await,
            Err(ClientError::Timeout(_))
        ));
        assert!(contents(&session).is_empty());
    }

    #[tokio::test]
    async fn test_teardown_settles_pending_submit() {
        let (session, mut remote) = loaded_by_hand().await;
        let mut events = session.subscribe();

        let handle = session.submit_message("hello").unwrap();
        let call = remote.next_call().await;
        session.teardown();
        assert_eq!(handle.settled().await, Err(ClientError::SessionClosed));
        call.succeed(GatewayReply::Messages(Vec::new()));

        // Teardown aborted the task, so the reply is never applied.
        tokio::task::yield_now().await;
        assert_eq!(contents(&session), ["hello"]);
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, SessionEvent::StaleSuccess { .. }));
        }
    }
}
