//! The client session.
//!
//! A [`Session`] owns the entity cache, the active-conversation pointer and
//! the mutation ledger, all inside one [`SessionState`] behind a mutex.
//! Reads are synchronous and return whatever is cached, starting a
//! background fetch when the entry is missing or stale. Remote calls run on
//! tokio tasks owned by the session and are aborted by
//! [`teardown`](Session::teardown).
//!
//! Every method that spawns work must be called from within a tokio
//! runtime.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use parley_gateway::{ErrorKind, GatewayResult, HttpGateway, RemoteGateway};
use parley_shared::{Conversation, ConversationId, Message};
use parley_store::{CacheKey, CacheValue, FetchTicket, ReadStatus};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::events::{emit_event, SessionEvent};
use crate::state::SessionState;

/// Handle to a running session. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Session {
    pub(crate) shared: Arc<Shared>,
}

pub(crate) struct Shared {
    state: Mutex<SessionState>,
    pub(crate) gateway: Arc<dyn RemoteGateway>,
    pub(crate) config: ClientConfig,
    events: broadcast::Sender<SessionEvent>,
    active_thread: watch::Sender<Vec<Message>>,
    tasks: Mutex<JoinSet<()>>,
    closed: AtomicBool,
}

impl Session {
    /// Start a session over `gateway` and begin loading the conversation
    /// list.
    pub fn init(gateway: Arc<dyn RemoteGateway>, config: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (active_thread, _) = watch::channel(Vec::new());
        info!(
            api_url = %config.api_url,
            stale_secs = config.stale_after.as_secs(),
            "Starting session"
        );

        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState::new(config.stale_after)),
            gateway,
            config,
            events,
            active_thread,
            tasks: Mutex::new(JoinSet::new()),
            closed: AtomicBool::new(false),
        });

        {
            let mut state = shared.lock();
            shared.schedule_fetch(&mut state, CacheKey::Conversations);
        }

        Self { shared }
    }

    /// Start a session against the HTTP backend named in `config`.
    pub fn connect(config: ClientConfig) -> Result<Self> {
        let gateway = HttpGateway::new(config.api_url.clone(), config.request_timeout)?;
        Ok(Self::init(Arc::new(gateway), config))
    }

    /// Abort every background task. Unsettled mutations resolve to
    /// [`ClientError::SessionClosed`]; their optimistic writes are left in
    /// the cache as they are.
    pub fn teardown(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let running = {
            let mut tasks = self.shared.lock_tasks();
            tasks.abort_all();
            tasks.len()
        };
        let abandoned = self.shared.lock().pipeline.close(&ClientError::SessionClosed);
        info!(running, abandoned, "Session torn down");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    // -- Reads -------------------------------------------------------------

    pub fn active_conversation_id(&self) -> Option<ConversationId> {
        self.shared.lock().selection.active().cloned()
    }

    pub fn active_conversation(&self) -> Option<Conversation> {
        self.shared.lock().active_conversation().cloned()
    }

    /// The cached conversation list, `None` until the first load lands.
    pub fn conversation_list(&self) -> Option<Vec<Conversation>> {
        let mut state = self.shared.lock();
        self.shared.ensure_fresh(&mut state, CacheKey::Conversations);
        state.cache.conversations().map(<[_]>::to_vec)
    }

    /// The cached thread of `id`, `None` until it loads.
    pub fn messages_for(&self, id: &ConversationId) -> Option<Vec<Message>> {
        let mut state = self.shared.lock();
        self.shared.ensure_fresh(&mut state, CacheKey::Messages(id.clone()));
        state.cache.messages(id).map(<[_]>::to_vec)
    }

    /// Watch the active conversation's thread. The receiver follows the
    /// selection: switching conversations retargets it.
    pub fn active_messages(&self) -> watch::Receiver<Vec<Message>> {
        let mut state = self.shared.lock();
        if let Some(id) = state.selection.active().cloned() {
            self.shared.ensure_fresh(&mut state, CacheKey::Messages(id));
        }
        self.shared.active_thread.subscribe()
    }

    pub fn read_status(&self, key: &CacheKey) -> ReadStatus {
        self.shared.lock().cache.read_status(key)
    }

    /// Error of the last failed fetch of `key`, kept until a fetch succeeds.
    pub fn last_error(&self, key: &CacheKey) -> Option<String> {
        self.shared.lock().cache.last_error(key).map(str::to_string)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Mark `key` stale and refetch it now. This is the user-driven retry;
    /// nothing is retried automatically.
    pub fn refresh(&self, key: CacheKey) {
        let mut state = self.shared.lock();
        self.shared.invalidate_and_refetch(&mut state, [key]);
    }

    /// Mutations still waiting on the server.
    pub fn pending_mutations(&self) -> usize {
        self.shared.lock().pipeline.pending()
    }
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::SessionClosed);
        }
        Ok(())
    }

    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.lock_tasks();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    /// Run a gateway call under the configured timeout.
    pub(crate) async fn call<T>(&self, request: impl Future<Output = GatewayResult<T>>) -> Result<T> {
        match tokio::time::timeout(self.config.request_timeout, request).await {
            Ok(result) => result.map_err(ClientError::from),
            Err(_) => Err(ClientError::Timeout(self.config.request_timeout)),
        }
    }

    /// Send `events` and push the active thread to its watchers. Called with
    /// the state lock held so observers see changes in order.
    pub(crate) fn publish(&self, state: &SessionState, events: Vec<SessionEvent>) {
        for event in events {
            emit_event(&self.events, event);
        }
        let thread = state.active_thread();
        self.active_thread.send_if_modified(|current| {
            if *current == thread {
                return false;
            }
            *current = thread;
            true
        });
    }

    /// Fetch `key` if a read of it should. Threads of conversations the
    /// loaded list does not hold are left alone.
    pub(crate) fn ensure_fresh(self: &Arc<Self>, state: &mut SessionState, key: CacheKey) {
        if let CacheKey::Messages(id) = &key {
            if let Some(list) = state.cache.conversations() {
                if !list.iter().any(|c| &c.id == id) {
                    return;
                }
            }
        }
        if state.cache.needs_fetch(&key, Instant::now()) {
            self.schedule_fetch(state, key);
        }
    }

    /// Invalidate `keys` and refetch those with a refetch policy. A key
    /// already being fetched rides that fetch.
    pub(crate) fn invalidate_and_refetch(
        self: &Arc<Self>,
        state: &mut SessionState,
        keys: impl IntoIterator<Item = CacheKey>,
    ) {
        for key in keys {
            if state.cache.invalidate(&key) {
                self.ensure_fresh(state, key);
            }
        }
    }

    /// Refetch `keys` after the server committed a write to them. A fetch
    /// already in flight may predate the write, so another follows it.
    pub(crate) fn refetch_written(
        self: &Arc<Self>,
        state: &mut SessionState,
        keys: impl IntoIterator<Item = CacheKey>,
    ) {
        for key in keys {
            if state.cache.invalidate_written(&key) {
                self.ensure_fresh(state, key);
            }
        }
    }

    /// The selection moved: log it, load the new thread, and build the
    /// event.
    pub(crate) fn selection_changed(self: &Arc<Self>, state: &mut SessionState) -> SessionEvent {
        let active = state.selection.active().cloned();
        info!(conversation = ?active, "Active conversation changed");
        if let Some(id) = &active {
            self.ensure_fresh(state, CacheKey::Messages(id.clone()));
        }
        SessionEvent::SelectionChanged { active }
    }

    fn schedule_fetch(self: &Arc<Self>, state: &mut SessionState, key: CacheKey) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let Some(ticket) = state.cache.begin_fetch(&key) else {
            return;
        };
        debug!(%key, "Fetching");
        let shared = Arc::clone(self);
        self.spawn(async move { shared.run_fetch(ticket).await });
    }

    async fn run_fetch(self: Arc<Self>, ticket: FetchTicket) {
        let result = match &ticket.key {
            CacheKey::Conversations => self
                .call(self.gateway.list_conversations())
                .await
                .map(CacheValue::Conversations),
            CacheKey::Messages(id) => self
                .call(self.gateway.get_conversation(id))
                .await
                .map(|detail| CacheValue::Messages(detail.messages)),
        };
        self.finish_fetch(ticket, result);
    }

    fn finish_fetch(self: &Arc<Self>, ticket: FetchTicket, result: Result<CacheValue>) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let key = ticket.key.clone();
        let mut events = Vec::new();

        match result {
            Ok(value) => {
                let previous = match key {
                    CacheKey::Conversations => state.cache.conversations().map(<[_]>::to_vec),
                    CacheKey::Messages(_) => None,
                };
                if state.cache.complete_fetch(&ticket, value, Instant::now()) {
                    debug!(%key, generation = state.cache.generation(&key), "Fetch complete");
                    events.push(SessionEvent::CacheUpdated { key: key.clone() });
                    if key == CacheKey::Conversations {
                        let live = state.cache.conversations().unwrap_or(&[]);
                        if state.selection.reconcile(previous.as_deref(), live) {
                            events.push(self.selection_changed(state));
                        }
                    }
                    // Written to while this fetch was out: fetch again.
                    self.ensure_fresh(state, key.clone());
                }
            }
            Err(error) => {
                warn!(%key, error = %error, "Fetch failed");
                state.cache.fail_fetch(&ticket, error.to_string());
                if let (ErrorKind::NotFound, CacheKey::Messages(id)) = (error.kind(), &key) {
                    state.cache.evict(id);
                    self.invalidate_and_refetch(state, [CacheKey::Conversations]);
                }
                events.push(SessionEvent::ReadFailed { key, error });
            }
        }

        self.publish(state, events);
    }
}


#[cfg(test)]
mod tests {
    use parley_gateway::scripted::{GatewayCall, GatewayReply};
    use parley_gateway::GatewayError;
    use parley_shared::{ConversationDetail, ConversationParams};

    use super::test_support::*;
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

    #[tokio::test]
    async fn test_first_load_selects_first_conversation() {
        let (session, mut remote) = scripted_session();
        assert_eq!(session.read_status(&CacheKey::Conversations), ReadStatus::Loading);

        let call = remote.next_call().await;
        assert_eq!(call.call, GatewayCall::ListConversations);
        call.succeed(GatewayReply::Conversations(vec![conv("a"), conv("b")]));

        let call = remote.next_call().await;
        assert_eq!(call.call, GatewayCall::GetConversation("a".into()));
        assert_eq!(session.active_conversation_id(), Some("a".into()));
        assert_eq!(ids(&session.conversation_list().unwrap()), ["a", "b"]);
    }

    #[tokio::test]
    async fn test_invalidation_collapses_onto_pending_fetch() {
        let (session, mut remote) = scripted_session();
        let pending = remote.next_call().await;

        session.refresh(CacheKey::Conversations);
        session.refresh(CacheKey::Conversations);
        assert!(session.conversation_list().is_none());
        tokio::task::yield_now().await;

        assert!(remote.try_next_call().is_none());
        assert_eq!(remote.call_count(), 1);
        pending.succeed(GatewayReply::Conversations(Vec::new()));
        eventually(|| session.read_status(&CacheKey::Conversations) == ReadStatus::Ready).await;

        // Reading after the fetch lands must not start another.
        assert_eq!(session.conversation_list(), Some(Vec::new()));
        tokio::task::yield_now().await;
        assert!(remote.try_next_call().is_none());
        assert_eq!(remote.call_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_list() {
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

        let mut events = session.subscribe();
        session.refresh(CacheKey::Conversations);
        remote
            .next_call()
            .await
            .fail(GatewayError::transport("connection refused"));

        loop {
            if let SessionEvent::ReadFailed { key, error } = events.recv().await.unwrap() {
                assert_eq!(key, CacheKey::Conversations);
                assert!(error.is_retriable());
                break;
            }
        }
        assert_eq!(ids(&session.conversation_list().unwrap()), ["a"]);
        assert_eq!(session.read_status(&CacheKey::Conversations), ReadStatus::Ready);
        assert!(session.last_error(&CacheKey::Conversations).is_some());
    }

    #[tokio::test]
    async fn test_first_load_failure_is_reported() {
        let (session, mut remote) = scripted_session();
        remote
            .next_call()
            .await
            .fail(GatewayError::transport("connection refused"));
        eventually(|| {
            matches!(
                session.read_status(&CacheKey::Conversations),
                ReadStatus::Failed(_)
            )
        })
        .await;
        assert_eq!(session.active_conversation_id(), None);
    }

    #[tokio::test]
    async fn test_thread_not_found_drops_conversation() {
        let (session, mut remote) = scripted_session();
        remote
            .next_call()
            .await
            .succeed(GatewayReply::Conversations(vec![conv("a"), conv("b")]));

        let call = remote.next_call().await;
        assert_eq!(call.call, GatewayCall::GetConversation("a".into()));
        call.fail(GatewayError::not_found("Conversation with ID a not found"));

        let call = remote.next_call().await;
        assert_eq!(call.call, GatewayCall::ListConversations);
        call.succeed(GatewayReply::Conversations(vec![conv("b")]));

        eventually(|| session.active_conversation_id() == Some("b".into())).await;
        assert_eq!(ids(&session.conversation_list().unwrap()), ["b"]);
    }

    #[tokio::test]
    async fn test_active_messages_follow_selection() {
        let (session, mut remote) = scripted_session();
        remote
            .next_call()
            .await
            .succeed(GatewayReply::Conversations(vec![conv("a"), conv("b")]));
        let thread_a = remote.next_call().await;
        let mut active = session.active_messages();

        let mut backend = parley_gateway::scripted::FakeBackend::with_conversations(&["A", "B"]);
        backend.push_message(&"a".into(), parley_shared::Role::User, "in a");
        backend.push_message(&"b".into(), parley_shared::Role::User, "in b");

        let first_is = |content: &'static str| {
            move |thread: &Vec<Message>| thread.first().is_some_and(|m| m.content == content)
        };

        thread_a.serve(&mut backend);
        active.wait_for(first_is("in a")).await.unwrap();

        session.select_conversation(&"b".into()).unwrap();
        remote.next_call().await.serve(&mut backend);
        active.wait_for(first_is("in b")).await.unwrap();
    }

    #[tokio::test]
    async fn test_request_timeout_fails_fetch() {
        let (gateway, mut remote) = parley_gateway::scripted::scripted();
        let config = ClientConfig {
            request_timeout: std::time::Duration::from_millis(20),
            ..ClientConfig::default()
        };
        let session = Session::init(Arc::new(gateway), config);
        let _unanswered = remote.next_call().await;
        eventually(|| {
            matches!(
                session.read_status(&CacheKey::Conversations),
                ReadStatus::Failed(_)
            )
        })
        .await;
    }

    #[tokio::test]
    async fn test_teardown_refuses_new_work() {
        let session = served_session(&["A"]).await;
        session.teardown();
        assert!(session.is_closed());
        assert_eq!(
            session.submit_message("hello").unwrap_err(),
            ClientError::SessionClosed
        );
    }
}
