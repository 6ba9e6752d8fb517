//! Video cache store with in-flight fetch deduplication.
//!
//! An entry is created as a downloading placeholder when the first fetch for
//! an id starts. Every concurrent requester shares that entry's
//! [`InFlightState`]. Completions are matched by pointer identity, so a fetch
//! finishing after its entry was evicted or replaced changes nothing.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, OnceCell};

/// Public view of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedVideo {
    pub id: String,
    /// Set once the video is ready.
    pub local_uri: Option<String>,
    pub is_downloading: bool,
    pub is_ready: bool,
}

pub(crate) type InFlightResult = std::result::Result<String, String>;

/// Result slot shared by everyone waiting on one video download.
///
/// The fetch task settles it exactly once; eviction and `clear` may settle it
/// earlier with an error, in which case the fetch's own result is dropped.
pub(crate) struct InFlightState {
    outcome: OnceCell<InFlightResult>,
    settled: Notify,
}

impl InFlightState {
    fn new() -> Self {
        Self {
            outcome: OnceCell::new(),
            settled: Notify::new(),
        }
    }

    /// Record the download outcome and wake every waiter.
    ///
    /// # Arguments
    ///
    /// * `outcome` - local URI on success, failure reason otherwise. Ignored
    ///   if the slot was already settled.
    fn settle(&self, outcome: InFlightResult) {
        if self.outcome.set(outcome).is_ok() {
            self.settled.notify_waiters();
        }
    }

    /// Wait for the download outcome.
    ///
    /// The `Notified` future is created before the second check, so a settle
    /// landing in between is not missed.
    pub(crate) async fn wait(&self) -> InFlightResult {
        loop {
            let notified = self.settled.notified();
            match self.outcome.get() {
                Some(outcome) => return outcome.clone(),
                None => notified.await,
            }
        }
    }
}

pub(crate) type InFlight = Arc<InFlightState>;

/// Outcome of [`VideoCacheStore::begin`].
pub(crate) enum Lookup {
    /// Already downloaded.
    Ready(String),
    /// Someone else is fetching; wait on the handle.
    Pending(InFlight),
    /// The caller must run the fetch and settle the handle.
    Started(InFlight),
}

struct StoreEntry {
    video: CachedVideo,
    in_flight: Option<InFlight>,
}

impl StoreEntry {
    fn placeholder(id: &str) -> (Self, InFlight) {
        let request = Arc::new(InFlightState::new());
        let entry = Self {
            video: CachedVideo {
                id: id.to_string(),
                local_uri: None,
                is_downloading: true,
                is_ready: false,
            },
            in_flight: Some(Arc::clone(&request)),
        };
        (entry, request)
    }

    fn is_current(&self, request: &InFlight) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, request))
    }
}

/// Diagnostic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub ready: usize,
    pub downloading: usize,
    pub queued: usize,
}

/// Map of cached videos keyed by id.
#[derive(Default)]
pub struct VideoCacheStore {
    entries: DashMap<String, StoreEntry>,
}

impl VideoCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<CachedVideo> {
        self.entries.get(id).map(|entry| entry.video.clone())
    }

    /// True only for entries that finished downloading.
    pub fn is_ready(&self, id: &str) -> bool {
        self.entries.get(id).is_some_and(|entry| entry.video.is_ready)
    }

    /// True for ready and downloading entries.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Return the ready URI, join an in-flight fetch, or register a new one.
    pub(crate) fn begin(&self, id: &str) -> Lookup {
        match self.entries.entry(id.to_string()) {
            Entry::Occupied(mut entry) => {
                let existing = {
                    let current = entry.get();
                    match (&current.video.local_uri, &current.in_flight) {
                        (Some(uri), _) if current.video.is_ready => Some(Lookup::Ready(uri.clone())),
                        (_, Some(request)) => Some(Lookup::Pending(Arc::clone(request))),
                        _ => None,
                    }
                };
                existing.unwrap_or_else(|| {
                    // Neither ready nor in flight: restart it.
                    let (placeholder, request) = StoreEntry::placeholder(id);
                    entry.insert(placeholder);
                    Lookup::Started(request)
                })
            }
            Entry::Vacant(entry) => {
                let (placeholder, request) = StoreEntry::placeholder(id);
                entry.insert(placeholder);
                Lookup::Started(request)
            }
        }
    }

    /// Whether `request` still owns the entry for `id`.
    pub(crate) fn is_current(&self, id: &str, request: &InFlight) -> bool {
        self.entries
            .get(id)
            .is_some_and(|entry| entry.is_current(request))
    }

    /// Whether any entry, under any id, points at `local_uri`.
    pub(crate) fn references(&self, local_uri: &str) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.video.local_uri.as_deref() == Some(local_uri))
    }

    /// Mark the entry ready and wake waiters.
    ///
    /// Returns `false` if the entry was evicted or replaced meanwhile; waiters
    /// are still woken with the URI.
    pub(crate) fn complete(&self, id: &str, request: &InFlight, local_uri: String) -> bool {
        let stored = match self.entries.get_mut(id) {
            Some(mut entry) if entry.is_current(request) => {
                entry.video.local_uri = Some(local_uri.clone());
                entry.video.is_downloading = false;
                entry.video.is_ready = true;
                entry.in_flight = None;
                true
            }
            _ => false,
        };
        request.settle(Ok(local_uri));
        stored
    }

    /// Drop the placeholder so the id can be fetched again, and wake waiters.
    pub(crate) fn fail(&self, id: &str, request: &InFlight, reason: String) {
        self.entries.remove_if(id, |_, entry| entry.is_current(request));
        request.settle(Err(reason));
    }

    /// Remove every entry whose id isn't in `keep`. Returns the removed entries.
    pub fn retain_ids(&self, keep: &HashSet<&str>) -> Vec<CachedVideo> {
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| !keep.contains(entry.key().as_str()))
            .map(|entry| entry.key().clone())
            .collect();

        doomed
            .into_iter()
            .filter_map(|id| self.remove_entry(&id, "evicted from cache"))
            .collect()
    }

    /// Remove everything. Pending waiters fail.
    pub fn clear(&self) -> Vec<CachedVideo> {
        let ids = self.ids();
        ids.into_iter()
            .filter_map(|id| self.remove_entry(&id, "cache cleared"))
            .collect()
    }

    fn remove_entry(&self, id: &str, reason: &str) -> Option<CachedVideo> {
        let (_, entry) = self.entries.remove(id)?;
        if let Some(request) = entry.in_flight {
            request.settle(Err(reason.to_string()));
        }
        Some(entry.video)
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            entries: self.entries.len(),
            ..Default::default()
        };
        for entry in self.entries.iter() {
            if entry.video.is_ready {
                stats.ready += 1;
            }
            if entry.video.is_downloading {
                stats.downloading += 1;
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(store: &VideoCacheStore, id: &str) -> InFlight {
        match store.begin(id) {
            Lookup::Started(request) => request,
            _ => panic!("expected a new fetch for {id}"),
        }
    }

    #[test]
    fn test_begin_deduplicates() {
        let store = VideoCacheStore::new();
        let first = started(&store, "v1");

        match store.begin("v1") {
            Lookup::Pending(request) => assert!(Arc::ptr_eq(&request, &first)),
            _ => panic!("expected pending"),
        }

        let entry = store.get("v1").unwrap();
        assert!(entry.is_downloading);
        assert!(!entry.is_ready);
        assert!(entry.local_uri.is_none());
        assert!(!store.is_ready("v1"));
    }

    #[test]
    fn test_complete_marks_ready() {
        let store = VideoCacheStore::new();
        let request = started(&store, "v1");
        assert!(store.complete("v1", &request, "file:///tmp/v1.mp4".into()));

        assert!(store.is_ready("v1"));
        match store.begin("v1") {
            Lookup::Ready(uri) => assert_eq!(uri, "file:///tmp/v1.mp4"),
            _ => panic!("expected ready"),
        }
    }

    #[test]
    fn test_fail_removes_placeholder() {
        let store = VideoCacheStore::new();
        let request = started(&store, "v1");
        store.fail("v1", &request, "404".into());

        assert!(!store.contains("v1"));
        assert!(matches!(store.begin("v1"), Lookup::Started(_)));
    }

    #[test]
    fn test_late_completion_after_eviction_is_ignored() {
        let store = VideoCacheStore::new();
        let stale = started(&store, "v1");
        store.retain_ids(&HashSet::new());
        let fresh = started(&store, "v1");

        assert!(!store.complete("v1", &stale, "file:///stale".into()));
        let entry = store.get("v1").unwrap();
        assert!(entry.is_downloading);
        assert!(store.complete("v1", &fresh, "file:///fresh".into()));
        assert_eq!(store.get("v1").unwrap().local_uri.as_deref(), Some("file:///fresh"));
    }

    #[test]
    fn test_orphaned_entry_restarts_instead_of_hanging() {
        let store = VideoCacheStore::new();
        store.entries.insert(
            "v1".to_string(),
            StoreEntry {
                video: CachedVideo {
                    id: "v1".into(),
                    local_uri: None,
                    is_downloading: true,
                    is_ready: false,
                },
                in_flight: None,
            },
        );

        let request = started(&store, "v1");
        assert!(store.is_current("v1", &request));
        assert!(store.complete("v1", &request, "file:///v1".into()));
        assert!(store.is_ready("v1"));
        assert!(store.references("file:///v1"));
    }

    #[tokio::test]
    async fn test_waiters_fail_on_clear() {
        let store = VideoCacheStore::new();
        let request = started(&store, "v1");
        let removed = store.clear();

        assert_eq!(removed.len(), 1);
        assert!(store.is_empty());
        assert_eq!(request.wait().await, Err("cache cleared".to_string()));
    }

    #[test]
    fn test_stats() {
        let store = VideoCacheStore::new();
        let a = started(&store, "a");
        let _b = started(&store, "b");
        store.complete("a", &a, "file:///a".into());

        let stats = store.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.ready, 1);
        assert_eq!(stats.downloading, 1);
    }
}
