//! Per-key cache cell: value, staleness, and in-flight fetch bookkeeping.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::key::CacheKey;
use crate::projection::Projection;

/// Handed out by [`EntityCache::begin_fetch`](crate::EntityCache::begin_fetch).
/// Only the ticket of the fetch currently in flight for a key can write its
/// result back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    pub key: CacheKey,
    pub(crate) serial: u64,
}

/// What a reader should show for a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum ReadStatus {
    /// Never requested.
    Missing,
    /// First fetch in flight, nothing to show yet.
    Loading,
    Ready,
    /// A value is shown while a newer one is fetched.
    Refreshing,
    /// No value and the last fetch failed.
    Failed(String),
}

#[derive(Debug, Clone)]
pub(crate) struct Slot<T> {
    pub value: Option<T>,
    pub stale: bool,
    pub in_flight: Option<u64>,
    /// Bumped each time an authoritative fetch replaces the value.
    pub generation: u64,
    pub fetched_at: Option<Instant>,
    pub last_error: Option<String>,
    /// Changes the server confirmed after the in-flight fetch began. Its
    /// result predates them, so they are replayed onto it.
    pub committed: Vec<Projection>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            value: None,
            stale: false,
            in_flight: None,
            generation: 0,
            fetched_at: None,
            last_error: None,
            committed: Vec::new(),
        }
    }
}

impl<T> Slot<T> {
    pub fn needs_fetch(&self, now: Instant, stale_after: Duration) -> bool {
        if self.in_flight.is_some() {
            return false;
        }
        if self.value.is_none() || self.stale {
            return true;
        }
        match self.fetched_at {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= stale_after,
        }
    }

    /// Mark the value stale.
    ///
    /// A plain invalidation rides a fetch already in flight. When the server
    /// itself was written (`written`), the in-flight result may predate the
    /// write, so the mark survives it and the key is fetched again.
    pub fn invalidate(&mut self, written: bool) {
        if self.in_flight.is_none() || written {
            self.stale = true;
        }
    }

    /// Returns false if a fetch is already in flight.
    pub fn begin(&mut self, serial: u64) -> bool {
        if self.in_flight.is_some() {
            return false;
        }
        self.in_flight = Some(serial);
        self.stale = false;
        true
    }

    pub fn complete(&mut self, serial: u64, value: T, now: Instant) -> bool {
        if self.in_flight != Some(serial) {
            return false;
        }
        self.value = Some(value);
        self.in_flight = None;
        self.generation += 1;
        self.fetched_at = Some(now);
        self.last_error = None;
        self.committed.clear();
        true
    }

    pub fn fail(&mut self, serial: u64, error: String) -> bool {
        if self.in_flight != Some(serial) {
            return false;
        }
        self.in_flight = None;
        self.last_error = Some(error);
        self.committed.clear();
        true
    }

    /// Give up the in-flight fetch without a result.
    pub fn release(&mut self, serial: u64) {
        if self.in_flight == Some(serial) {
            self.in_flight = None;
            self.committed.clear();
        }
    }

    /// Keep a committed change for replay onto the in-flight fetch. Returns
    /// false when nothing is in flight.
    pub fn hold(&mut self, projection: &Projection) -> bool {
        if self.in_flight.is_none() {
            return false;
        }
        self.committed.push(projection.clone());
        true
    }

    pub fn status(&self) -> ReadStatus {
        match (&self.value, self.in_flight, &self.last_error) {
            (Some(_), Some(_), _) => ReadStatus::Refreshing,
            (Some(_), None, _) => ReadStatus::Ready,
            (None, Some(_), _) => ReadStatus::Loading,
            (None, None, Some(err)) => ReadStatus::Failed(err.clone()),
            (None, None, None) => ReadStatus::Missing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_current_ticket_completes() {
        let mut slot: Slot<u32> = Slot::default();
        assert!(slot.begin(1));
        assert!(!slot.begin(2));
        assert!(!slot.complete(2, 7, Instant::now()));
        assert!(slot.complete(1, 7, Instant::now()));
        assert_eq!(slot.value, Some(7));
        assert_eq!(slot.generation, 1);
    }

    #[test]
    fn test_failure_keeps_last_value() {
        let mut slot: Slot<u32> = Slot::default();
        slot.begin(1);
        slot.complete(1, 5, Instant::now());
        slot.begin(2);
        assert!(slot.fail(2, "offline".into()));
        assert_eq!(slot.value, Some(5));
        assert_eq!(slot.status(), ReadStatus::Ready);
    }

    #[test]
    fn test_failure_without_value_is_reported() {
        let mut slot: Slot<u32> = Slot::default();
        slot.begin(1);
        assert_eq!(slot.status(), ReadStatus::Loading);
        slot.fail(1, "offline".into());
        assert_eq!(slot.status(), ReadStatus::Failed("offline".into()));
    }

    #[test]
    fn test_freshness_window() {
        let stale_after = Duration::from_secs(60);
        let mut slot: Slot<u32> = Slot::default();
        let t0 = Instant::now();
        assert!(slot.needs_fetch(t0, stale_after));

        slot.begin(1);
        assert!(!slot.needs_fetch(t0, stale_after));
        slot.complete(1, 1, t0);

        assert!(!slot.needs_fetch(t0 + Duration::from_secs(59), stale_after));
        assert!(slot.needs_fetch(t0 + Duration::from_secs(60), stale_after));

        slot.stale = true;
        assert!(slot.needs_fetch(t0, stale_after));
    }

    #[test]
    fn test_invalidation_rides_pending_fetch() {
        let stale_after = Duration::from_secs(60);
        let mut slot: Slot<u32> = Slot::default();
        let t0 = Instant::now();
        slot.begin(1);
        slot.invalidate(false);
        slot.invalidate(false);
        assert!(!slot.needs_fetch(t0, stale_after));
        slot.complete(1, 3, t0);
        assert!(!slot.needs_fetch(t0, stale_after));
    }

    #[test]
    fn test_write_during_fetch_survives_completion() {
        let stale_after = Duration::from_secs(60);
        let mut slot: Slot<u32> = Slot::default();
        let t0 = Instant::now();
        slot.begin(1);
        slot.invalidate(true);
        slot.complete(1, 3, t0);
        assert!(slot.needs_fetch(t0, stale_after));

        slot.begin(2);
        slot.complete(2, 4, t0);
        assert!(!slot.needs_fetch(t0, stale_after));
    }

    #[test]
    fn test_idle_invalidation_marks_stale() {
        let mut slot: Slot<u32> = Slot::default();
        let t0 = Instant::now();
        slot.begin(1);
        slot.complete(1, 3, t0);
        slot.invalidate(false);
        assert!(slot.needs_fetch(t0, Duration::from_secs(60)));
    }
}
