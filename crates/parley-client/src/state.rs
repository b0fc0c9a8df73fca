//! Session state guarded by the session lock.
//!
//! [`SessionState`] is wrapped in a `Mutex` inside the session and every
//! logical step (optimistic write, commit, rollback, fetch result) runs as
//! one critical section over it. The lock is never held across an await.

use std::time::Duration;

use parley_shared::{Conversation, Message};
use parley_store::EntityCache;

use crate::pipeline::Pipeline;
use crate::selection::Selection;

pub struct SessionState {
    /// Conversation list and threads, as last fetched plus any optimistic
    /// layers.
    pub cache: EntityCache,

    /// Which conversation the view is showing.
    pub selection: Selection,

    /// Unsettled mutations and their optimistic layers.
    pub pipeline: Pipeline,
}

impl SessionState {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            cache: EntityCache::new(stale_after),
            selection: Selection::default(),
            pipeline: Pipeline::new(),
        }
    }

    pub fn active_conversation(&self) -> Option<&Conversation> {
        self.cache.conversation(self.selection.active()?)
    }

    /// The active conversation's thread, empty when none is selected or it
    /// has not loaded yet.
    pub fn active_thread(&self) -> Vec<Message> {
        self.selection
            .active()
            .and_then(|id| self.cache.messages(id))
            .map(<[_]>::to_vec)
            .unwrap_or_default()
    }
}
