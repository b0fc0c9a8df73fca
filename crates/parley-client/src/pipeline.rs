//! Optimistic mutation ledger.
//!
//! Every user mutation gets a record here and moves through
//! `Idle -> Staged -> InFlight -> {Committed | RolledBack}`. A mutation that
//! writes to the cache ahead of the server leaves a layer on the key it
//! touched: the snapshot taken just before the write, and the write itself.
//!
//! Layers on one key stack in staging order. Rolling back a layer in the
//! middle of the stack unwinds everything above it, restores its snapshot,
//! and replays the still-pending layers on top, so unrelated optimistic
//! writes survive a neighbour's failure. A layer whose snapshot predates the
//! last authoritative fetch of its key is superseded: the fetched value
//! already excludes it and its rollback leaves the cache alone.
//!
//! The ledger is synchronous and lives inside the session lock next to the
//! cache it edits.

use std::collections::HashMap;
use std::fmt;

use tokio::sync::watch;
use tracing::{debug, trace, warn};

use parley_store::{CacheKey, EntityCache, Projection, Snapshot, StoreError};

use crate::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutationId(u64);

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    SubmitMessage,
    CreateConversation,
    UpdateConversation,
    DeleteConversation,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SubmitMessage => "submit_message",
            Self::CreateConversation => "create_conversation",
            Self::UpdateConversation => "update_conversation",
            Self::DeleteConversation => "delete_conversation",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationStatus {
    Idle,
    Staged,
    InFlight,
    Committed,
    RolledBack(ClientError),
}

impl MutationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Staged | Self::InFlight)
    }
}

/// The caller's view of one mutation.
#[derive(Debug, Clone)]
pub struct MutationHandle {
    id: MutationId,
    kind: MutationKind,
    status: watch::Receiver<MutationStatus>,
}

impl MutationHandle {
    pub fn id(&self) -> MutationId {
        self.id
    }

    pub fn kind(&self) -> MutationKind {
        self.kind
    }

    pub fn status(&self) -> MutationStatus {
        self.status.borrow().clone()
    }

    /// True while the remote call is outstanding.
    pub fn is_pending(&self) -> bool {
        self.status.borrow().is_pending()
    }

    /// Wait for the mutation to commit or roll back.
    pub async fn settled(&self) -> Result<(), ClientError> {
        let mut rx = self.status.clone();
        let waited = rx
            .wait_for(MutationStatus::is_terminal)
            .await
            .map(|status| status.clone());
        let status = match waited {
            Ok(status) => status,
            Err(_) => rx.borrow().clone(),
        };
        match status {
            MutationStatus::Committed => Ok(()),
            MutationStatus::RolledBack(error) => Err(error),
            _ => Err(ClientError::SessionClosed),
        }
    }
}

#[derive(Debug)]
struct Layer {
    mutation: MutationId,
    snapshot: Snapshot,
    projection: Projection,
}

#[derive(Debug)]
struct Record {
    kind: MutationKind,
    status: watch::Sender<MutationStatus>,
    keys: Vec<CacheKey>,
}

/// Ledger of unsettled mutations and the optimistic layers they own.
///
/// A record is dropped as soon as its mutation settles, so "no record"
/// means "already settled" and every later settle attempt is a no-op.
#[derive(Debug, Default)]
pub struct Pipeline {
    next_id: u64,
    records: HashMap<MutationId, Record>,
    layers: HashMap<CacheKey, Vec<Layer>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mutation and apply its optimistic write, if it has one.
    ///
    /// The write goes through [`EntityCache::project`], which re-checks that
    /// its target still exists. On refusal nothing is recorded.
    pub fn begin(
        &mut self,
        kind: MutationKind,
        cache: &mut EntityCache,
        projection: Option<Projection>,
    ) -> Result<MutationHandle, StoreError> {
        let id = MutationId(self.next_id + 1);
        let mut keys = Vec::new();

        if let Some(projection) = projection {
            let key = projection.key();
            let snapshot = cache.snapshot(&key);
            cache.project(&projection)?;
            self.layers.entry(key.clone()).or_default().push(Layer {
                mutation: id,
                snapshot,
                projection,
            });
            keys.push(key);
        }

        self.next_id = id.0;
        let (status, rx) = watch::channel(MutationStatus::Idle);
        status.send_replace(MutationStatus::Staged);
        self.records.insert(id, Record { kind, status, keys });
        trace!(mutation = %id, %kind, "Mutation staged");

        Ok(MutationHandle {
            id,
            kind,
            status: rx,
        })
    }

    pub fn mark_in_flight(&mut self, id: MutationId) {
        if let Some(record) = self.records.get(&id) {
            record.status.send_if_modified(|status| {
                if *status != MutationStatus::Staged {
                    return false;
                }
                *status = MutationStatus::InFlight;
                true
            });
        }
    }

    pub fn is_pending(&self, id: MutationId) -> bool {
        self.records.contains_key(&id)
    }

    /// Unsettled mutations.
    pub fn pending(&self) -> usize {
        self.records.len()
    }

    /// Optimistic layers currently stacked on `key`.
    pub fn layers_on(&self, key: &CacheKey) -> usize {
        self.layers.get(key).map_or(0, Vec::len)
    }

    /// Settle a mutation as committed. Its optimistic writes stay in the
    /// cache until the authoritative refetch replaces them, and are folded
    /// into the snapshots of older pending layers so their rollback keeps
    /// them. Returns false if the mutation had already settled.
    pub fn commit(&mut self, id: MutationId) -> bool {
        let Some(record) = self.records.remove(&id) else {
            return false;
        };
        for key in &record.keys {
            if let Some(stack) = self.layers.get_mut(key) {
                if let Some(pos) = stack.iter().position(|l| l.mutation == id) {
                    let layer = stack.remove(pos);
                    for lower in &mut stack[..pos] {
                        if let Err(e) = lower.snapshot.rebase(&layer.projection) {
                            trace!(mutation = %lower.mutation, error = %e, "Snapshot not rebased");
                        }
                    }
                }
            }
            self.prune(key);
        }
        record.status.send_replace(MutationStatus::Committed);
        true
    }

    /// Settle a mutation as rolled back and undo its optimistic writes.
    /// Returns false if the mutation had already settled.
    pub fn rollback(&mut self, id: MutationId, cache: &mut EntityCache, error: ClientError) -> bool {
        let Some(record) = self.records.remove(&id) else {
            return false;
        };
        for key in &record.keys {
            self.unwind(id, key, cache);
        }
        record.status.send_replace(MutationStatus::RolledBack(error));
        true
    }

    /// Fold a committed change into every pending snapshot of `key`, so a
    /// later rollback cannot undo it.
    pub fn rebase_pending(&mut self, key: &CacheKey, projection: &Projection) {
        if let Some(stack) = self.layers.get_mut(key) {
            for layer in stack.iter_mut() {
                if let Err(e) = layer.snapshot.rebase(projection) {
                    trace!(mutation = %layer.mutation, error = %e, "Snapshot not rebased");
                }
            }
        }
    }

    /// Roll back every mutation with a layer on `key` without touching the
    /// cache. Used when the key itself is going away.
    pub fn force_settle(
        &mut self,
        key: &CacheKey,
        error: &ClientError,
    ) -> Vec<(MutationId, MutationKind)> {
        let Some(stack) = self.layers.remove(key) else {
            return Vec::new();
        };
        let mut settled = Vec::new();
        for layer in stack {
            let Some(record) = self.records.remove(&layer.mutation) else {
                continue;
            };
            for other in record.keys.iter().filter(|k| *k != key) {
                if let Some(stack) = self.layers.get_mut(other) {
                    stack.retain(|l| l.mutation != layer.mutation);
                }
                self.prune(other);
            }
            debug!(mutation = %layer.mutation, %key, "Mutation force-settled");
            record
                .status
                .send_replace(MutationStatus::RolledBack(error.clone()));
            settled.push((layer.mutation, record.kind));
        }
        settled
    }

    /// Settle everything still pending as rolled back with `error`, leaving
    /// the cache untouched. Returns how many mutations were abandoned.
    pub fn close(&mut self, error: &ClientError) -> usize {
        self.layers.clear();
        let abandoned = self.records.len();
        for (_, record) in self.records.drain() {
            record
                .status
                .send_replace(MutationStatus::RolledBack(error.clone()));
        }
        abandoned
    }

    fn unwind(&mut self, id: MutationId, key: &CacheKey, cache: &mut EntityCache) {
        let Some(stack) = self.layers.get_mut(key) else {
            return;
        };
        let Some(pos) = stack.iter().position(|l| l.mutation == id) else {
            return;
        };
        let mut above = stack.split_off(pos);
        let layer = above.remove(0);

        if layer.snapshot.generation() != cache.generation(key) {
            debug!(mutation = %id, %key, "Rollback superseded by a newer fetch");
            stack.extend(above);
        } else {
            cache.restore(layer.snapshot);
            for mut later in above {
                later.snapshot = cache.snapshot(key);
                match cache.project(&later.projection) {
                    Ok(()) => stack.push(later),
                    Err(e) => {
                        warn!(mutation = %later.mutation, %key, error = %e, "Pending change could not be replayed");
                    }
                }
            }
        }
        self.prune(key);
    }

    fn prune(&mut self, key: &CacheKey) {
        if self.layers.get(key).is_some_and(Vec::is_empty) {
            self.layers.remove(key);
        }
    }
}
