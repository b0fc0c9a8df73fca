use tokio::sync::broadcast;

use parley_shared::ConversationId;
use parley_store::CacheKey;

use crate::error::ClientError;
use crate::pipeline::{MutationId, MutationKind};

/// Notifications pushed to the view layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The value under `key` changed: fetched, written optimistically, or
    /// restored by a rollback.
    CacheUpdated { key: CacheKey },

    SelectionChanged { active: Option<ConversationId> },

    MutationSettled {
        id: MutationId,
        kind: MutationKind,
        outcome: MutationOutcome,
    },

    /// The server accepted a mutation that had already been rolled back
    /// locally. The cache was not touched.
    StaleSuccess { id: MutationId, kind: MutationKind },

    ReadFailed { key: CacheKey, error: ClientError },
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    Committed,
    RolledBack(ClientError),
}

pub(crate) fn settled(id: MutationId, kind: MutationKind, outcome: MutationOutcome) -> SessionEvent {
    SessionEvent::MutationSettled { id, kind, outcome }
}

pub(crate) fn emit_event(tx: &broadcast::Sender<SessionEvent>, event: SessionEvent) {
    tracing::trace!(?event, "Session event");
    // No subscribers is the normal case for a headless session.
    let _ = tx.send(event);
}
