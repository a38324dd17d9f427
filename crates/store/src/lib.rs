//! Optiq cache store: keyed entries, staleness, fetch generations and change
//! notification.
//!
//! The store is a synchronous map from [`QueryKey`] to one cached value. All
//! asynchrony lives in the callers: a fetch borrows a ticket via
//! [`CacheStore::begin_fetch`], does its I/O, and hands the result back
//! through [`CacheStore::complete_fetch`], which drops anything whose ticket
//! generation has been overtaken in the meantime. Readers hold cheap
//! [`Arc`] clones of values and wake up through per-entry watch channels.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use metrics::counter;
use optiq_core::{CachedValue, QueryKey};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchState {
    Idle,
    Fetching,
    Cancelled,
}

/// Outcome of a remote fetch, as reported back to the store.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Value(CachedValue),
    /// The entity no longer exists remotely. Clears the value and marks the
    /// entry fresh, so views stop showing ghosts.
    Missing,
    Error(String),
}

/// Borrowed permission to write a fetch result for one key. The generation
/// pins the ticket to the fetch that was current when it was issued;
/// [`CacheStore::cancel_in_flight`] and any newer [`CacheStore::begin_fetch`]
/// both overtake it.
#[derive(Debug, Clone)]
pub struct FetchTicket {
    key: QueryKey,
    generation: u64,
}

impl FetchTicket {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }
}

/// Captured state of one entry, for rollback. Restoring writes back exactly
/// what was captured, including absence.
#[derive(Debug, Clone)]
pub struct Snapshot {
    key: QueryKey,
    value: Option<Arc<CachedValue>>,
}

impl Snapshot {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn value(&self) -> Option<&CachedValue> {
        self.value.as_deref()
    }
}

/// Observable entry bookkeeping, for UIs and diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct EntryMeta {
    pub revision: u64,
    pub stale: bool,
    pub state: FetchState,
    pub has_value: bool,
    pub last_error: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

struct Entry {
    value: Option<Arc<CachedValue>>,
    state: FetchState,
    generation: u64,
    revision: u64,
    stale: bool,
    queued: bool,
    last_error: Option<String>,
    updated_at: Option<DateTime<Utc>>,
    rev_tx: watch::Sender<u64>,
}

impl Entry {
    fn new() -> Self {
        let (rev_tx, _) = watch::channel(0u64);
        Self {
            value: None,
            state: FetchState::Idle,
            generation: 0,
            revision: 0,
            stale: false,
            queued: false,
            last_error: None,
            updated_at: None,
            rev_tx,
        }
    }

    fn bump(&mut self) {
        self.revision += 1;
        let _ = self.rev_tx.send(self.revision);
    }

    /// Wake watchers without claiming the value changed.
    fn nudge(&mut self) {
        let _ = self.rev_tx.send(self.revision);
    }

    fn meta(&self) -> EntryMeta {
        EntryMeta {
            revision: self.revision,
            stale: self.stale,
            state: self.state,
            has_value: self.value.is_some(),
            last_error: self.last_error.clone(),
            updated_at: self.updated_at,
        }
    }
}

struct Inner {
    entries: FxHashMap<QueryKey, Entry>,
    invalidations: VecDeque<QueryKey>,
}

/// The cache. One entry per query key; entries are created lazily by
/// whichever operation touches a key first.
pub struct CacheStore {
    inner: Mutex<Inner>,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: FxHashMap::default(),
                invalidations: VecDeque::new(),
            }),
        }
    }

    fn with_entry<T>(&self, key: &QueryKey, f: impl FnOnce(&mut Inner, &QueryKey) -> T) -> T {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if !inner.entries.contains_key(key) {
            inner.entries.insert(key.clone(), Entry::new());
        }
        f(&mut inner, key)
    }

    pub fn get(&self, key: &QueryKey) -> Option<Arc<CachedValue>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        inner.entries.get(key).and_then(|e| e.value.clone())
    }

    /// Capture the entry's value for later [`CacheStore::restore`]. Absent
    /// entries capture as absent.
    pub fn snapshot(&self, key: &QueryKey) -> Snapshot {
        let inner = self.inner.lock().expect("store lock poisoned");
        let value = inner.entries.get(key).and_then(|e| e.value.clone());
        Snapshot { key: key.clone(), value }
    }

    /// Write a value and wake watchers. Used for optimistic overlays; does
    /// not touch staleness, which belongs to the fetch path.
    pub fn set(&self, key: &QueryKey, value: CachedValue) -> u64 {
        counter!("store_writes_total", 1u64);
        self.with_entry(key, |inner, key| {
            let e = inner.entries.get_mut(key).expect("entry just ensured");
            e.value = Some(Arc::new(value));
            e.updated_at = Some(Utc::now());
            e.bump();
            debug!(key = %key, revision = e.revision, "store write");
            e.revision
        })
    }

    /// Read-modify-write in one critical section. The transform runs while
    /// the store lock is held, so concurrent writers cannot interleave
    /// between the read and the write; it must not call back into the store.
    /// A missing value, or `None` from the transform, leaves the entry
    /// untouched and returns `false`.
    pub fn update<F>(&self, key: &QueryKey, f: F) -> bool
    where
        F: FnOnce(&CachedValue) -> Option<CachedValue>,
    {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let e = match inner.entries.get_mut(key) {
            Some(e) => e,
            None => return false,
        };
        let current = match e.value.clone() {
            Some(v) => v,
            None => return false,
        };
        let next = match f(&current) {
            Some(v) => v,
            None => return false,
        };
        counter!("store_writes_total", 1u64);
        e.value = Some(Arc::new(next));
        e.updated_at = Some(Utc::now());
        e.bump();
        debug!(key = %key, revision = e.revision, "store rewrite");
        true
    }

    /// Put a captured snapshot back, including absence.
    pub fn restore(&self, snapshot: Snapshot) -> u64 {
        counter!("store_restores_total", 1u64);
        self.with_entry(&snapshot.key, |inner, key| {
            let e = inner.entries.get_mut(key).expect("entry just ensured");
            e.value = snapshot.value.clone();
            e.updated_at = Some(Utc::now());
            e.bump();
            debug!(key = %key, revision = e.revision, "store restore");
            e.revision
        })
    }

    /// Mark the entry stale and queue it for refetch. Idempotent while the
    /// key is still queued: invalidating twice before the worker drains the
    /// queue yields one refetch.
    pub fn invalidate(&self, key: &QueryKey) {
        self.with_entry(key, |inner, key| {
            let e = inner.entries.get_mut(key).expect("entry just ensured");
            e.stale = true;
            if !e.queued {
                e.queued = true;
                inner.invalidations.push_back(key.clone());
                counter!("store_invalidations_total", 1u64);
                debug!(key = %key, "invalidated");
            }
        })
    }

    /// Invalidate every existing key the predicate selects. Returns how many
    /// keys matched.
    pub fn invalidate_matching(&self, pred: impl Fn(&QueryKey) -> bool) -> usize {
        let matched: Vec<QueryKey> = {
            let inner = self.inner.lock().expect("store lock poisoned");
            inner.entries.keys().filter(|k| pred(k)).cloned().collect()
        };
        for key in &matched {
            self.invalidate(key);
        }
        matched.len()
    }

    /// Drain the refetch queue, clearing the queued flags. The caller owns
    /// the refetches from here.
    pub fn take_invalidations(&self) -> Vec<QueryKey> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let keys: Vec<QueryKey> = inner.invalidations.drain(..).collect();
        for key in &keys {
            if let Some(e) = inner.entries.get_mut(key) {
                e.queued = false;
            }
        }
        keys
    }

    pub fn pending_invalidations(&self) -> usize {
        self.inner.lock().expect("store lock poisoned").invalidations.len()
    }

    /// Abandon the in-flight fetch for this key, if any. The fetch itself
    /// keeps running; its result is dropped at [`CacheStore::complete_fetch`]
    /// because the generation has moved on.
    pub fn cancel_in_flight(&self, key: &QueryKey) -> bool {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        match inner.entries.get_mut(key) {
            Some(e) if e.state == FetchState::Fetching => {
                e.generation += 1;
                e.state = FetchState::Cancelled;
                counter!("store_fetch_cancelled_total", 1u64);
                debug!(key = %key, generation = e.generation, "fetch cancelled");
                true
            }
            _ => false,
        }
    }

    /// Open a fetch for this key. A newer `begin_fetch` on the same key
    /// overtakes any older ticket.
    pub fn begin_fetch(&self, key: &QueryKey) -> FetchTicket {
        counter!("store_fetch_begin_total", 1u64);
        self.with_entry(key, |inner, key| {
            let e = inner.entries.get_mut(key).expect("entry just ensured");
            e.generation += 1;
            e.state = FetchState::Fetching;
            FetchTicket { key: key.clone(), generation: e.generation }
        })
    }

    /// Land a fetch result. Returns `false` when the ticket was overtaken
    /// and the result was dropped without touching the entry's value.
    pub fn complete_fetch(&self, ticket: FetchTicket, outcome: FetchOutcome) -> bool {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let e = match inner.entries.get_mut(&ticket.key) {
            Some(e) => e,
            None => {
                counter!("store_fetch_dropped_total", 1u64);
                return false;
            }
        };
        if e.generation != ticket.generation {
            counter!("store_fetch_dropped_total", 1u64);
            debug!(key = %ticket.key, "stale fetch result dropped");
            return false;
        }
        e.state = FetchState::Idle;
        match outcome {
            FetchOutcome::Value(v) => {
                e.value = Some(Arc::new(v));
                e.stale = false;
                e.last_error = None;
                e.updated_at = Some(Utc::now());
                e.bump();
            }
            FetchOutcome::Missing => {
                e.value = None;
                e.stale = false;
                e.last_error = None;
                e.updated_at = Some(Utc::now());
                e.bump();
            }
            FetchOutcome::Error(msg) => {
                // Keep the stale value on screen; record the failure and wake
                // watchers so UIs can surface it.
                e.last_error = Some(msg);
                e.nudge();
            }
        }
        debug!(key = %ticket.key, revision = e.revision, "fetch completed");
        true
    }

    /// Watch an entry's revision. The receiver's current value is the
    /// revision at subscribe time; every visible write sends a new one.
    pub fn subscribe(&self, key: &QueryKey) -> watch::Receiver<u64> {
        self.with_entry(key, |inner, key| {
            inner.entries.get(key).expect("entry just ensured").rev_tx.subscribe()
        })
    }

    pub fn meta(&self, key: &QueryKey) -> Option<EntryMeta> {
        let inner = self.inner.lock().expect("store lock poisoned");
        inner.entries.get(key).map(Entry::meta)
    }

    pub fn keys(&self) -> Vec<QueryKey> {
        let inner = self.inner.lock().expect("store lock poisoned");
        inner.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("store lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop an entry entirely. Watchers see their channel close.
    pub fn evict(&self, key: &QueryKey) -> bool {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.invalidations.retain(|k| k != key);
        inner.entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.entries.clear();
        inner.invalidations.clear();
    }
}
