//! Active-conversation pointer.
//!
//! Pure bookkeeping: the session calls into it from the same critical
//! section that changes the conversation list, so the pointer never names a
//! conversation the cache no longer holds.

use parley_shared::{Conversation, ConversationId};

use crate::error::{ClientError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    active: Option<ConversationId>,
}

impl Selection {
    pub fn active(&self) -> Option<&ConversationId> {
        self.active.as_ref()
    }

    /// Explicit user choice. The conversation must be in `live`.
    pub fn select(&mut self, id: &ConversationId, live: &[Conversation]) -> Result<bool> {
        if !contains(live, id) {
            return Err(ClientError::UnknownConversation(id.clone()));
        }
        Ok(self.set(Some(id.clone())))
    }

    /// A conversation was created; it becomes active unconditionally.
    pub fn on_created(&mut self, id: ConversationId) -> bool {
        self.set(Some(id))
    }

    /// A conversation was deleted. `before` is the list as it was when the
    /// delete was issued, `live` the list after removal.
    pub fn on_deleted(
        &mut self,
        deleted: &ConversationId,
        before: &[Conversation],
        live: &[Conversation],
    ) -> bool {
        if self.active.as_ref() != Some(deleted) {
            return false;
        }
        self.set(successor(deleted, before, live))
    }

    /// The list was replaced by a fetch. Repairs a pointer to a conversation
    /// that disappeared, and picks the first conversation when nothing is
    /// selected.
    pub fn reconcile(&mut self, previous: Option<&[Conversation]>, live: &[Conversation]) -> bool {
        match &self.active {
            Some(active) if contains(live, active) => false,
            Some(active) => {
                let next = successor(active, previous.unwrap_or(&[]), live);
                self.set(next)
            }
            None => self.set(live.first().map(|c| c.id.clone())),
        }
    }

    fn set(&mut self, next: Option<ConversationId>) -> bool {
        if self.active == next {
            return false;
        }
        self.active = next;
        true
    }
}

/// Neighbour of `removed` in `before`: the next entry when it was first,
/// otherwise the previous one. Falls back to the head of `live` when that
/// neighbour is gone too.
fn successor(
    removed: &ConversationId,
    before: &[Conversation],
    live: &[Conversation],
) -> Option<ConversationId> {
    let neighbour = match before.iter().position(|c| &c.id == removed) {
        Some(0) => before.get(1),
        Some(i) => before.get(i - 1),
        None => None,
    };
    neighbour
        .filter(|c| contains(live, &c.id))
        .or_else(|| live.first())
        .map(|c| c.id.clone())
}

fn contains(list: &[Conversation], id: &ConversationId) -> bool {
    list.iter().any(|c| &c.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_shared::ConversationParams;

    fn list(ids: &[&str]) -> Vec<Conversation> {
        ids.iter()
            .map(|id| Conversation {
                id: (*id).into(),
                name: id.to_uppercase(),
                params: ConversationParams::default(),
                tokens: 0,
                created_at: None,
                updated_at: None,
            })
            .collect()
    }

    fn selected(id: &str) -> Selection {
        Selection {
            active: Some(id.into()),
        }
    }

    fn delete(selection: &mut Selection, id: &str, before: &[&str]) -> Option<String> {
        let before = list(before);
        let live: Vec<_> = before.iter().filter(|c| c.id.as_str() != id).cloned().collect();
        selection.on_deleted(&id.into(), &before, &live);
        selection.active().map(|a| a.as_str().to_string())
    }

    #[test]
    fn test_first_load_selects_head() {
        let mut selection = Selection::default();
        assert!(selection.reconcile(None, &list(&["a", "b"])));
        assert_eq!(selection.active(), Some(&"a".into()));
        assert!(!selection.reconcile(None, &list(&["a", "b"])));
    }

    #[test]
    fn test_empty_load_selects_nothing() {
        let mut selection = Selection::default();
        assert!(!selection.reconcile(None, &[]));
        assert_eq!(selection.active(), None);
    }

    #[test]
    fn test_delete_first_selects_second() {
        let mut selection = selected("a");
        assert_eq!(delete(&mut selection, "a", &["a", "b", "c"]).as_deref(), Some("b"));
    }

    #[test]
    fn test_delete_last_selects_previous() {
        let mut selection = selected("c");
        assert_eq!(delete(&mut selection, "c", &["a", "b", "c"]).as_deref(), Some("b"));
    }

    #[test]
    fn test_delete_sole_clears() {
        let mut selection = selected("a");
        assert_eq!(delete(&mut selection, "a", &["a"]), None);
    }

    #[test]
    fn test_delete_other_keeps_active() {
        let mut selection = selected("b");
        assert_eq!(delete(&mut selection, "c", &["a", "b", "c"]).as_deref(), Some("b"));
    }

    #[test]
    fn test_delete_falls_back_when_neighbour_gone() {
        let mut selection = selected("b");
        let before = list(&["a", "b", "c"]);
        let live = list(&["c"]);
        selection.on_deleted(&"b".into(), &before, &live);
        assert_eq!(selection.active(), Some(&"c".into()));
    }

    #[test]
    fn test_select_requires_cached_conversation() {
        let mut selection = Selection::default();
        let live = list(&["a"]);
        assert_eq!(
            selection.select(&"zz".into(), &live),
            Err(ClientError::UnknownConversation("zz".into()))
        );
        assert_eq!(selection.select(&"a".into(), &live), Ok(true));
        assert_eq!(selection.select(&"a".into(), &live), Ok(false));
    }

    #[test]
    fn test_refresh_repairs_vanished_active() {
        let mut selection = selected("b");
        let previous = list(&["a", "b", "c"]);
        assert!(selection.reconcile(Some(&previous), &list(&["a", "c"])));
        assert_eq!(selection.active(), Some(&"a".into()));
    }
}
