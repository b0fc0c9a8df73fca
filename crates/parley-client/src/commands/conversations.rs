use std::sync::Arc;

use tracing::{debug, info, warn};

use parley_gateway::{ErrorKind, GatewayError};
use parley_shared::{
    Conversation, ConversationId, ConversationParams, ConversationUpdate, NewConversation,
};
use parley_store::{CacheKey, Projection};

use crate::error::{ClientError, Result};
use crate::events::{settled, MutationOutcome, SessionEvent};
use crate::pipeline::{MutationHandle, MutationId, MutationKind};
use crate::session::{Session, Shared};

impl Session {
    /// Make `id` the active conversation. It must be in the cached list.
    pub fn select_conversation(&self, id: &ConversationId) -> Result<()> {
        let shared = &self.shared;
        let mut guard = shared.lock();
        let state = &mut *guard;
        let live = state.cache.conversations().unwrap_or(&[]);
        if state.selection.select(id, live)? {
            let event = shared.selection_changed(state);
            shared.publish(state, vec![event]);
        }
        Ok(())
    }

    pub fn create_conversation(&self, name: impl Into<String>) -> Result<MutationHandle> {
        self.create_conversation_with(NewConversation::named(name))
    }

    /// Create a conversation. The server assigns its id, so nothing is shown
    /// until it answers; on success the conversation joins the list and
    /// becomes active in one step.
    pub fn create_conversation_with(&self, input: NewConversation) -> Result<MutationHandle> {
        let shared = &self.shared;
        shared.ensure_open()?;
        input.validate()?;

        let handle = {
            let mut guard = shared.lock();
            let state = &mut *guard;
            let handle =
                state
                    .pipeline
                    .begin(MutationKind::CreateConversation, &mut state.cache, None)?;
            state.pipeline.mark_in_flight(handle.id());
            handle
        };
        info!(mutation = %handle.id(), name = %input.name, "Creating conversation");

        let id = handle.id();
        let task = Arc::clone(shared);
        shared.spawn(async move {
            let result = task.call(task.gateway.create_conversation(&input)).await;
            task.settle_create(id, result);
        });
        Ok(handle)
    }

    /// Delete a conversation.
    ///
    /// The list keeps showing it until the server confirms. If it was
    /// active, the selection then moves to its neighbour in the list as it
    /// stood when the delete was issued.
    pub fn delete_conversation(&self, id: &ConversationId) -> Result<MutationHandle> {
        let shared = &self.shared;
        shared.ensure_open()?;

        let (handle, before) = {
            let mut guard = shared.lock();
            let state = &mut *guard;
            let before = state.cache.conversations().unwrap_or(&[]).to_vec();
            if !before.iter().any(|c| &c.id == id) {
                return Err(ClientError::UnknownConversation(id.clone()));
            }
            let handle =
                state
                    .pipeline
                    .begin(MutationKind::DeleteConversation, &mut state.cache, None)?;
            state.pipeline.mark_in_flight(handle.id());
            (handle, before)
        };
        info!(mutation = %handle.id(), conversation = %id, "Deleting conversation");

        let mutation = handle.id();
        let conversation = id.clone();
        let task = Arc::clone(shared);
        shared.spawn(async move {
            let result = task.call(task.gateway.delete_conversation(&conversation)).await;
            task.settle_delete(mutation, &conversation, &before, result);
        });
        Ok(handle)
    }

    /// Save a conversation's name and params together. The list shows the
    /// new values at once and reverts if the server refuses them.
    pub fn update_conversation(&self, update: ConversationUpdate) -> Result<MutationHandle> {
        let shared = &self.shared;
        shared.ensure_open()?;
        update.validate()?;

        let handle = {
            let mut guard = shared.lock();
            let state = &mut *guard;
            if !state.cache.contains_conversation(&update.id) {
                return Err(ClientError::UnknownConversation(update.id.clone()));
            }
            let handle = state.pipeline.begin(
                MutationKind::UpdateConversation,
                &mut state.cache,
                Some(Projection::UpdateConversation(update.clone())),
            )?;
            state.pipeline.mark_in_flight(handle.id());
            shared.publish(
                state,
                vec![SessionEvent::CacheUpdated {
                    key: CacheKey::Conversations,
                }],
            );
            handle
        };
        info!(mutation = %handle.id(), conversation = %update.id, "Updating conversation");

        let id = handle.id();
        let task = Arc::clone(shared);
        shared.spawn(async move {
            let result = task.call(task.gateway.update_conversation(&update)).await;
            task.settle_update(id, &update.id, result.map(drop));
        });
        Ok(handle)
    }

    /// Replace a conversation's params, keeping its name.
    pub fn update_conversation_config(
        &self,
        id: &ConversationId,
        params: ConversationParams,
    ) -> Result<MutationHandle> {
        let name = self.current(id)?.name;
        self.update_conversation(ConversationUpdate {
            id: id.clone(),
            name,
            params,
        })
    }

    /// Rename a conversation, keeping its params.
    pub fn rename_conversation(
        &self,
        id: &ConversationId,
        name: impl Into<String>,
    ) -> Result<MutationHandle> {
        let params = self.current(id)?.params;
        self.update_conversation(ConversationUpdate {
            id: id.clone(),
            name: name.into(),
            params,
        })
    }

    fn current(&self, id: &ConversationId) -> Result<Conversation> {
        self.shared
            .lock()
            .cache
            .conversation(id)
            .cloned()
            .ok_or_else(|| ClientError::UnknownConversation(id.clone()))
    }
}

// ---------------------------------------------------------------------------
// Settle steps
// ---------------------------------------------------------------------------

impl Shared {
    fn settle_create(self: &Arc<Self>, id: MutationId, result: Result<Conversation>) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let kind = MutationKind::CreateConversation;
        let mut events = Vec::new();

        match result {
            Ok(conversation) => {
                if !state.pipeline.commit(id) {
                    debug!(mutation = %id, "Server created a conversation after settle");
                    events.push(SessionEvent::StaleSuccess { id, kind });
                    self.refetch_written(state, [CacheKey::Conversations]);
                    self.publish(state, events);
                    return;
                }
                let created = conversation.id.clone();
                let insert = Projection::InsertConversation(conversation);
                if let Err(e) = state.cache.apply_committed(&insert) {
                    warn!(mutation = %id, error = %e, "Created conversation not cached");
                }
                state.pipeline.rebase_pending(&CacheKey::Conversations, &insert);
                info!(mutation = %id, conversation = %created, "Conversation created");

                events.push(SessionEvent::CacheUpdated {
                    key: CacheKey::Conversations,
                });
                events.push(settled(id, kind, MutationOutcome::Committed));
                if state.selection.on_created(created) {
                    events.push(self.selection_changed(state));
                }
                self.refetch_written(state, [CacheKey::Conversations]);
            }
            Err(error) => {
                if !state.pipeline.rollback(id, &mut state.cache, error.clone()) {
                    return;
                }
                warn!(mutation = %id, error = %error, "Create failed");
                events.push(settled(id, kind, MutationOutcome::RolledBack(error)));
            }
        }

        self.publish(state, events);
    }

    fn settle_delete(
        self: &Arc<Self>,
        id: MutationId,
        conversation: &ConversationId,
        before: &[Conversation],
        result: Result<()>,
    ) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let kind = MutationKind::DeleteConversation;
        let mut events = Vec::new();

        match result {
            Ok(()) => {
                if !state.pipeline.commit(id) {
                    debug!(mutation = %id, %conversation, "Server deleted a conversation after settle");
                    events.push(SessionEvent::StaleSuccess { id, kind });
                    self.refetch_written(state, [CacheKey::Conversations]);
                    self.publish(state, events);
                    return;
                }
                let remove = Projection::RemoveConversation(conversation.clone());
                if let Err(e) = state.cache.apply_committed(&remove) {
                    warn!(mutation = %id, error = %e, "Deleted conversation not removed from cache");
                }
                state.pipeline.rebase_pending(&CacheKey::Conversations, &remove);

                let gone = ClientError::Gateway(GatewayError::not_found(format!(
                    "Conversation {conversation} was deleted"
                )));
                let thread = CacheKey::Messages(conversation.clone());
                for (orphan, orphan_kind) in state.pipeline.force_settle(&thread, &gone) {
                    events.push(settled(
                        orphan,
                        orphan_kind,
                        MutationOutcome::RolledBack(gone.clone()),
                    ));
                }
                state.cache.evict(conversation);
                info!(mutation = %id, %conversation, "Conversation deleted");

                events.push(SessionEvent::CacheUpdated {
                    key: CacheKey::Conversations,
                });
                events.push(settled(id, kind, MutationOutcome::Committed));

                let live = state.cache.conversations().unwrap_or(&[]);
                if state.selection.on_deleted(conversation, before, live) {
                    events.push(self.selection_changed(state));
                }
                self.refetch_written(state, [CacheKey::Conversations]);
            }
            Err(error) => {
                if !state.pipeline.rollback(id, &mut state.cache, error.clone()) {
                    return;
                }
                warn!(mutation = %id, %conversation, error = %error, "Delete failed");
                if error.kind() == ErrorKind::NotFound {
                    state.cache.evict(conversation);
                    self.invalidate_and_refetch(state, [CacheKey::Conversations]);
                }
                events.push(settled(id, kind, MutationOutcome::RolledBack(error)));
            }
        }

        self.publish(state, events);
    }

    fn settle_update(self: &Arc<Self>, id: MutationId, conversation: &ConversationId, result: Result<()>) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let kind = MutationKind::UpdateConversation;
        let mut events = Vec::new();

        match result {
            Ok(()) => {
                if state.pipeline.commit(id) {
                    info!(mutation = %id, %conversation, "Conversation updated");
                    events.push(settled(id, kind, MutationOutcome::Committed));
                } else {
                    events.push(SessionEvent::StaleSuccess { id, kind });
                }
                self.refetch_written(
                    state,
                    [
                        CacheKey::Conversations,
                        CacheKey::Messages(conversation.clone()),
                    ],
                );
            }
            Err(error) => {
                if !state.pipeline.rollback(id, &mut state.cache, error.clone()) {
                    return;
                }
                warn!(mutation = %id, %conversation, error = %error, "Update rolled back");
                if error.kind() == ErrorKind::NotFound {
                    state.cache.evict(conversation);
                    self.invalidate_and_refetch(state, [CacheKey::Conversations]);
                }
                events.push(SessionEvent::CacheUpdated {
                    key: CacheKey::Conversations,
                });
                events.push(settled(id, kind, MutationOutcome::RolledBack(error)));
            }
        }

        self.publish(state, events);
    }
}
