//! The keyed entity cache.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use parley_shared::{Conversation, ConversationId, Message};

use crate::error::{Result, StoreError};
use crate::key::{CacheKey, CacheValue};
use crate::projection::Projection;
use crate::slot::{FetchTicket, ReadStatus, Slot};

/// Point-in-time copy of one key, taken before an optimistic write so the
/// write can be undone verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    key: CacheKey,
    generation: u64,
    value: Option<CacheValue>,
}

impl Snapshot {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Generation of the entry when the snapshot was taken.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn value(&self) -> Option<&CacheValue> {
        self.value.as_ref()
    }

    pub fn conversations(&self) -> Option<&[Conversation]> {
        match &self.value {
            Some(CacheValue::Conversations(list)) => Some(list),
            _ => None,
        }
    }

    /// Fold a committed change into the snapshot, so restoring it later
    /// keeps that change.
    pub fn rebase(&mut self, projection: &Projection) -> Result<()> {
        if projection.key() != self.key {
            return Err(StoreError::KeyMismatch(self.key.clone()));
        }
        match &self.key {
            CacheKey::Conversations => {
                let mut list = match self.value.take() {
                    Some(CacheValue::Conversations(list)) => Some(list),
                    _ => None,
                };
                let result = projection.apply_to_conversations(&mut list);
                self.value = list.map(CacheValue::Conversations);
                result
            }
            CacheKey::Messages(_) => {
                let mut thread = match self.value.take() {
                    Some(CacheValue::Messages(thread)) => Some(thread),
                    _ => None,
                };
                let result = projection.apply_to_messages(&mut thread);
                self.value = thread.map(CacheValue::Messages);
                result
            }
        }
    }
}

/// In-memory store for the conversation list and one thread per
/// conversation.
///
/// Reads never block: they return the last known value. Fetching is driven
/// from outside through tickets: [`begin_fetch`](Self::begin_fetch) refuses
/// a second ticket for a key while one is in flight, so concurrent refresh
/// requests collapse onto one network call, and
/// [`complete_fetch`](Self::complete_fetch) swaps the whole value in one
/// step.
#[derive(Debug)]
pub struct EntityCache {
    conversations: Slot<Vec<Conversation>>,
    messages: HashMap<ConversationId, Slot<Vec<Message>>>,
    stale_after: Duration,
    next_serial: u64,
}

impl EntityCache {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            conversations: Slot::default(),
            messages: HashMap::new(),
            stale_after,
            next_serial: 0,
        }
    }

    // -- Reads -------------------------------------------------------------

    pub fn conversations(&self) -> Option<&[Conversation]> {
        self.conversations.value.as_deref()
    }

    pub fn conversation(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations()?.iter().find(|c| &c.id == id)
    }

    pub fn contains_conversation(&self, id: &ConversationId) -> bool {
        self.conversation(id).is_some()
    }

    pub fn messages(&self, id: &ConversationId) -> Option<&[Message]> {
        self.messages.get(id)?.value.as_deref()
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheValue> {
        match key {
            CacheKey::Conversations => self
                .conversations()
                .map(|l| CacheValue::Conversations(l.to_vec())),
            CacheKey::Messages(id) => self.messages(id).map(|l| CacheValue::Messages(l.to_vec())),
        }
    }

    pub fn read_status(&self, key: &CacheKey) -> ReadStatus {
        match key {
            CacheKey::Conversations => self.conversations.status(),
            CacheKey::Messages(id) => self
                .messages
                .get(id)
                .map(Slot::status)
                .unwrap_or(ReadStatus::Missing),
        }
    }

    /// Last fetch error for a key, kept while an older value is still shown.
    pub fn last_error(&self, key: &CacheKey) -> Option<&str> {
        match key {
            CacheKey::Conversations => self.conversations.last_error.as_deref(),
            CacheKey::Messages(id) => self.messages.get(id)?.last_error.as_deref(),
        }
    }

    pub fn generation(&self, key: &CacheKey) -> u64 {
        match key {
            CacheKey::Conversations => self.conversations.generation,
            CacheKey::Messages(id) => self.messages.get(id).map_or(0, |s| s.generation),
        }
    }

    /// Whether a read of `key` at `now` should start a background fetch.
    pub fn needs_fetch(&self, key: &CacheKey, now: Instant) -> bool {
        match key {
            CacheKey::Conversations => self.conversations.needs_fetch(now, self.stale_after),
            CacheKey::Messages(id) => self
                .messages
                .get(id)
                .map_or(true, |s| s.needs_fetch(now, self.stale_after)),
        }
    }

    // -- Writes ------------------------------------------------------------

    /// Overwrite a key's value. Does not count as a fetch.
    pub fn set(&mut self, key: CacheKey, value: CacheValue) -> Result<()> {
        match (key, value) {
            (CacheKey::Conversations, CacheValue::Conversations(list)) => {
                self.conversations.value = Some(list);
            }
            (CacheKey::Messages(id), CacheValue::Messages(thread)) => {
                self.messages.entry(id).or_default().value = Some(thread);
            }
            (key, _) => return Err(StoreError::KeyMismatch(key)),
        }
        Ok(())
    }

    /// Mark a key stale. Returns whether the key has a refetch policy: the
    /// conversation list always does, a thread only once it is cached.
    ///
    /// While a fetch of the key is in flight the invalidation rides it.
    pub fn invalidate(&mut self, key: &CacheKey) -> bool {
        self.mark_stale(key, false)
    }

    /// Like [`invalidate`](Self::invalidate), for a key the server was just
    /// written through. A fetch already in flight may have been answered
    /// before the write, so the key stays stale after it lands.
    pub fn invalidate_written(&mut self, key: &CacheKey) -> bool {
        self.mark_stale(key, true)
    }

    fn mark_stale(&mut self, key: &CacheKey, written: bool) -> bool {
        let attached = match key {
            CacheKey::Conversations => {
                self.conversations.invalidate(written);
                true
            }
            CacheKey::Messages(id) => match self.messages.get_mut(id) {
                Some(slot) => {
                    slot.invalidate(written);
                    true
                }
                None => false,
            },
        };
        trace!(%key, attached, written, "Invalidated cache key");
        attached
    }

    /// Drop a conversation's thread entirely.
    pub fn evict(&mut self, id: &ConversationId) {
        if self.messages.remove(id).is_some() {
            debug!(conversation = %id, "Evicted thread from cache");
        }
    }

    pub fn snapshot(&self, key: &CacheKey) -> Snapshot {
        Snapshot {
            key: key.clone(),
            generation: self.generation(key),
            value: self.get(key),
        }
    }

    /// Put a snapshot's value back. The entry's fetch state is untouched.
    /// Returns false if the thread was evicted since the snapshot.
    pub fn restore(&mut self, snapshot: Snapshot) -> bool {
        match (snapshot.key, snapshot.value) {
            (CacheKey::Conversations, value) => {
                self.conversations.value = match value {
                    Some(CacheValue::Conversations(list)) => Some(list),
                    _ => None,
                };
                true
            }
            (CacheKey::Messages(id), value) => match self.messages.get_mut(&id) {
                Some(slot) => {
                    slot.value = match value {
                        Some(CacheValue::Messages(thread)) => Some(thread),
                        _ => None,
                    };
                    true
                }
                None => false,
            },
        }
    }

    /// Apply an optimistic edit.
    ///
    /// A new message is only accepted while its conversation is still in the
    /// cached list; this is the re-check that guards against writing into a
    /// conversation deleted in the meantime.
    pub fn project(&mut self, projection: &Projection) -> Result<()> {
        match projection.key() {
            CacheKey::Conversations => {
                projection.apply_to_conversations(&mut self.conversations.value)
            }
            CacheKey::Messages(id) => {
                if !self.contains_conversation(&id) {
                    return Err(StoreError::ConversationMissing(id));
                }
                let slot = self.messages.entry(id).or_default();
                projection.apply_to_messages(&mut slot.value)
            }
        }
    }

    /// Apply a change the server has confirmed.
    ///
    /// If a fetch of the key is in flight, the change is also replayed onto
    /// its result when it lands, so an answer sent before the change cannot
    /// undo it.
    pub fn apply_committed(&mut self, projection: &Projection) -> Result<()> {
        self.project(projection)?;
        let held = match projection.key() {
            CacheKey::Conversations => self.conversations.hold(projection),
            CacheKey::Messages(id) => self
                .messages
                .get_mut(&id)
                .is_some_and(|slot| slot.hold(projection)),
        };
        if held {
            trace!(key = %projection.key(), "Committed change held for in-flight fetch");
        }
        Ok(())
    }

    // -- Fetch bookkeeping -------------------------------------------------

    /// Claim the right to fetch `key`. `None` if a fetch is already in
    /// flight; the caller should ride that one.
    pub fn begin_fetch(&mut self, key: &CacheKey) -> Option<FetchTicket> {
        let serial = self.next_serial + 1;
        let started = match key {
            CacheKey::Conversations => self.conversations.begin(serial),
            CacheKey::Messages(id) => self.messages.entry(id.clone()).or_default().begin(serial),
        };
        if !started {
            trace!(%key, "Fetch already in flight");
            return None;
        }
        self.next_serial = serial;
        Some(FetchTicket {
            key: key.clone(),
            serial,
        })
    }

    /// Replace the value with a fetch result. Returns false if the ticket is
    /// no longer current (key evicted, or superseded).
    pub fn complete_fetch(&mut self, ticket: &FetchTicket, value: CacheValue, now: Instant) -> bool {
        let accepted = match (&ticket.key, value) {
            (CacheKey::Conversations, CacheValue::Conversations(list)) => {
                let slot = &mut self.conversations;
                let list = replay(&*slot, ticket, list, Projection::apply_to_conversations);
                slot.complete(ticket.serial, list, now)
            }
            (CacheKey::Messages(id), CacheValue::Messages(thread)) => {
                self.messages.get_mut(id).is_some_and(|slot| {
                    let thread = replay(&*slot, ticket, thread, Projection::apply_to_messages);
                    slot.complete(ticket.serial, thread, now)
                })
            }
            (key, _) => {
                warn!(%key, "Fetch result does not match its key, dropped");
                self.abandon(ticket);
                false
            }
        };
        if !accepted {
            debug!(key = %ticket.key, "Discarded outdated fetch result");
        }
        accepted
    }

    /// Record a failed fetch. The previous value, if any, stays readable.
    pub fn fail_fetch(&mut self, ticket: &FetchTicket, error: impl Into<String>) -> bool {
        let error = error.into();
        match &ticket.key {
            CacheKey::Conversations => self.conversations.fail(ticket.serial, error),
            CacheKey::Messages(id) => self
                .messages
                .get_mut(id)
                .is_some_and(|slot| slot.fail(ticket.serial, error)),
        }
    }

    fn abandon(&mut self, ticket: &FetchTicket) {
        match &ticket.key {
            CacheKey::Conversations => self.conversations.release(ticket.serial),
            CacheKey::Messages(id) => {
                if let Some(slot) = self.messages.get_mut(id) {
                    slot.release(ticket.serial);
                }
            }
        }
    }
}

/// Replay the changes committed while `ticket` was in flight onto its
/// result. Stale tickets get nothing; their result is dropped anyway.
fn replay<T>(
    slot: &Slot<Vec<T>>,
    ticket: &FetchTicket,
    fetched: Vec<T>,
    apply: fn(&Projection, &mut Option<Vec<T>>) -> Result<()>,
) -> Vec<T> {
    if slot.in_flight != Some(ticket.serial) || slot.committed.is_empty() {
        return fetched;
    }
    let mut value = Some(fetched);
    for projection in &slot.committed {
        if let Err(e) = apply(projection, &mut value) {
            debug!(key = %ticket.key, error = %e, "Committed change not replayed");
        }
    }
    value.unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_shared::{ConversationParams, ConversationUpdate, MessageId, Role};

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

    fn confirmed(conversation: &str, server_id: &str, content: &str) -> Message {
        Message {
            id: MessageId::confirmed(server_id),
            conversation_id: conversation.into(),
            role: Role::Assistant,
            content: content.into(),
            created_at: None,
        }
    }

    fn cache_with(ids: &[&str]) -> EntityCache {
        let mut cache = EntityCache::new(Duration::from_secs(60));
        let ticket = cache.begin_fetch(&CacheKey::Conversations).unwrap();
        let list = ids.iter().map(|id| conv(id)).collect();
        assert!(cache.complete_fetch(&ticket, CacheValue::Conversations(list), Instant::now()));
        cache
    }

    #[test]
    fn test_second_fetch_rides_the_first() {
        let mut cache = EntityCache::new(Duration::from_secs(60));
        let key = CacheKey::messages("a");
        let first = cache.begin_fetch(&key);
        assert!(first.is_some());
        cache.invalidate(&key);
        assert!(cache.begin_fetch(&key).is_none());
        assert_eq!(cache.read_status(&key), ReadStatus::Loading);
    }

    #[test]
    fn test_complete_fetch_replaces_whole_value() {
        let mut cache = cache_with(&["a"]);
        let key = CacheKey::messages("a");
        cache
            .project(&Projection::AppendMessage(Message::optimistic("a".into(), "hi")))
            .unwrap();

        let ticket = cache.begin_fetch(&key).unwrap();
        let server = vec![confirmed("a", "a:0", "hi"), confirmed("a", "a:1", "hello")];
        assert!(cache.complete_fetch(&ticket, CacheValue::Messages(server.clone()), Instant::now()));

        assert_eq!(cache.messages(&"a".into()), Some(server.as_slice()));
        assert_eq!(cache.generation(&key), 1);
        assert!(!cache.needs_fetch(&key, Instant::now()));
    }

    #[test]
    fn test_fetch_for_evicted_thread_is_dropped() {
        let mut cache = cache_with(&["a"]);
        let key = CacheKey::messages("a");
        let ticket = cache.begin_fetch(&key).unwrap();
        cache.evict(&"a".into());
        assert!(!cache.complete_fetch(&ticket, CacheValue::Messages(Vec::new()), Instant::now()));
        assert_eq!(cache.read_status(&key), ReadStatus::Missing);
    }

    #[test]
    fn test_snapshot_restore_is_verbatim() {
        let mut cache = cache_with(&["a"]);
        let key = CacheKey::messages("a");
        cache
            .set(key.clone(), CacheValue::Messages(vec![confirmed("a", "a:0", "x")]))
            .unwrap();

        let before = cache.snapshot(&key);
        cache
            .project(&Projection::AppendMessage(Message::optimistic("a".into(), "y")))
            .unwrap();
        assert_eq!(cache.messages(&"a".into()).unwrap().len(), 2);

        assert!(cache.restore(before.clone()));
        assert_eq!(cache.get(&key).as_ref(), before.value());
    }

    #[test]
    fn test_restore_absent_thread() {
        let mut cache = cache_with(&["a"]);
        let key = CacheKey::messages("a");
        let before = cache.snapshot(&key);
        cache
            .project(&Projection::AppendMessage(Message::optimistic("a".into(), "y")))
            .unwrap();
        cache.restore(before);
        assert_eq!(cache.messages(&"a".into()), None);
    }

    #[test]
    fn test_project_requires_cached_conversation() {
        let mut cache = cache_with(&["a"]);
        let err = cache
            .project(&Projection::AppendMessage(Message::optimistic("gone".into(), "hi")))
            .unwrap_err();
        assert_eq!(err, StoreError::ConversationMissing("gone".into()));
        assert_eq!(cache.read_status(&CacheKey::messages("gone")), ReadStatus::Missing);
    }

    #[test]
    fn test_invalidate_policy() {
        let mut cache = cache_with(&["a"]);
        assert!(cache.invalidate(&CacheKey::Conversations));
        assert!(cache.needs_fetch(&CacheKey::Conversations, Instant::now()));
        assert!(!cache.invalidate(&CacheKey::messages("never-loaded")));
    }

    #[test]
    fn test_refresh_during_fetch_leaves_key_fresh() {
        let mut cache = cache_with(&["a"]);
        let key = CacheKey::Conversations;
        cache.invalidate(&key);
        let ticket = cache.begin_fetch(&key).unwrap();
        assert!(cache.invalidate(&key));
        assert!(cache.begin_fetch(&key).is_none());

        assert!(cache.complete_fetch(&ticket, CacheValue::Conversations(vec![conv("a")]), Instant::now()));
        assert!(!cache.needs_fetch(&key, Instant::now()));
    }

    #[test]
    fn test_write_during_fetch_needs_another() {
        let mut cache = cache_with(&["a"]);
        let key = CacheKey::Conversations;
        cache.invalidate(&key);
        let ticket = cache.begin_fetch(&key).unwrap();
        assert!(cache.invalidate_written(&key));

        assert!(cache.complete_fetch(&ticket, CacheValue::Conversations(vec![conv("a")]), Instant::now()));
        assert!(cache.needs_fetch(&key, Instant::now()));
    }

    #[test]
    fn test_committed_change_replayed_onto_older_fetch() {
        let mut cache = cache_with(&["a", "b"]);
        let key = CacheKey::Conversations;
        cache.invalidate(&key);
        let ticket = cache.begin_fetch(&key).unwrap();

        cache
            .apply_committed(&Projection::InsertConversation(conv("new")))
            .unwrap();
        cache
            .apply_committed(&Projection::RemoveConversation("b".into()))
            .unwrap();

        let answered_before = vec![conv("a"), conv("b")];
        assert!(cache.complete_fetch(&ticket, CacheValue::Conversations(answered_before), Instant::now()));
        let ids: Vec<_> = cache.conversations().unwrap().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["a", "new"]);

        // Held changes are spent once that fetch lands.
        let ticket = cache.begin_fetch(&key).unwrap();
        assert!(cache.complete_fetch(&ticket, CacheValue::Conversations(vec![conv("a")]), Instant::now()));
        assert_eq!(cache.conversations().map(<[_]>::len), Some(1));
    }

    #[test]
    fn test_committed_change_without_fetch_is_not_held() {
        let mut cache = cache_with(&["a"]);
        cache
            .apply_committed(&Projection::InsertConversation(conv("new")))
            .unwrap();
        let ticket = cache.begin_fetch(&CacheKey::Conversations).unwrap();
        assert!(cache.complete_fetch(&ticket, CacheValue::Conversations(vec![conv("a")]), Instant::now()));
        assert_eq!(cache.conversations().map(<[_]>::len), Some(1));
    }

    #[test]
    fn test_failed_refresh_keeps_stale_value() {
        let mut cache = cache_with(&["a", "b"]);
        cache.invalidate(&CacheKey::Conversations);
        let ticket = cache.begin_fetch(&CacheKey::Conversations).unwrap();
        assert!(cache.fail_fetch(&ticket, "connection refused"));

        assert_eq!(cache.conversations().map(<[_]>::len), Some(2));
        assert_eq!(cache.read_status(&CacheKey::Conversations), ReadStatus::Ready);
        assert_eq!(
            cache.last_error(&CacheKey::Conversations),
            Some("connection refused")
        );
    }

    #[test]
    fn test_mismatched_fetch_result_releases_ticket() {
        let mut cache = EntityCache::new(Duration::from_secs(60));
        let ticket = cache.begin_fetch(&CacheKey::Conversations).unwrap();
        assert!(!cache.complete_fetch(&ticket, CacheValue::Messages(Vec::new()), Instant::now()));
        assert!(cache.begin_fetch(&CacheKey::Conversations).is_some());
    }

    #[test]
    fn test_snapshot_rebase_keeps_committed_insert() {
        let cache = cache_with(&["a"]);
        let mut snapshot = cache.snapshot(&CacheKey::Conversations);
        snapshot
            .rebase(&Projection::InsertConversation(conv("new")))
            .unwrap();
        let ids: Vec<_> = snapshot
            .conversations()
            .unwrap()
            .iter()
            .map(|c| c.id.as_str())
            .collect();
        assert_eq!(ids, ["a", "new"]);

        let update = ConversationUpdate {
            id: "a".into(),
            name: "x".into(),
            params: ConversationParams::default(),
        };
        let mut thread_snapshot = cache.snapshot(&CacheKey::messages("a"));
        assert!(thread_snapshot
            .rebase(&Projection::UpdateConversation(update))
            .is_err());
    }
}
