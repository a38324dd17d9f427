//! Optiq public API façade (in-process).
//!
//! [`CacheApi`] wires the pieces together for a frontend: one cache store,
//! one remote, one mutation coordinator, and a background reconciler that
//! drains the store's invalidation queue and refetches canonical data. UIs
//! subscribe to keys through typed [`Subscription`] handles and trigger
//! mutations through the `create`/`update`/`delete`/`bulk_delete` methods,
//! which run against whatever view context the frontend last declared.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use metrics::{counter, histogram};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use optiq_client::RemoteTasks;
use optiq_core::{
    CachedValue, NewTask, PageParams, QueryKey, Task, TaskDetail, TaskFeed, TaskFilters, TaskId,
    TaskPage, TaskPatch, ViewKind, DEFAULT_PAGE_LIMIT,
};
use optiq_store::{CacheStore, EntryMeta, FetchOutcome};
use optiq_sync::{Coordinator, MutationScope, NotificationSink, OperationFailed};

/// Runtime knobs, all overridable from the environment.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Window size used for every list key this façade builds.
    pub page_limit: u32,
    /// Reconciler poll interval.
    pub tick: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { page_limit: DEFAULT_PAGE_LIMIT, tick: Duration::from_millis(5) }
    }
}

impl ApiConfig {
    pub fn from_env() -> Self {
        let page_limit = std::env::var("OPTIQ_PAGE_LIMIT")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_PAGE_LIMIT);
        let tick_ms = std::env::var("OPTIQ_TICK_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(5);
        Self { page_limit, tick: Duration::from_millis(tick_ms) }
    }
}

/// A live view onto one cache entry. `current` reads the store directly, so
/// a subscriber that was just notified always sees the write that woke it.
pub struct Subscription<T> {
    key: QueryKey,
    store: Arc<CacheStore>,
    rx: watch::Receiver<u64>,
    extract: fn(&CachedValue) -> Option<T>,
}

impl<T> Subscription<T> {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn current(&self) -> Option<T> {
        self.store.get(&self.key).and_then(|v| (self.extract)(&v))
    }

    pub fn meta(&self) -> Option<EntryMeta> {
        self.store.meta(&self.key)
    }

    /// Wait for the next visible write. Returns `false` once the entry is
    /// gone for good (evicted or the store dropped).
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

fn extract_page(v: &CachedValue) -> Option<TaskPage> {
    v.as_page().cloned()
}

fn extract_feed(v: &CachedValue) -> Option<TaskFeed> {
    v.as_feed().cloned()
}

fn extract_detail(v: &CachedValue) -> Option<TaskDetail> {
    v.as_detail().cloned()
}

/// In-process cache engine: store + coordinator + background reconciler.
pub struct CacheApi {
    store: Arc<CacheStore>,
    remote: Arc<dyn RemoteTasks>,
    coordinator: Coordinator,
    /// Current view context, swapped whole on navigation and read on every
    /// subscribe/mutate without a lock.
    scope: ArcSwap<MutationScope>,
    cfg: ApiConfig,
    busy: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
}

impl CacheApi {
    pub fn new(remote: Arc<dyn RemoteTasks>) -> Self {
        Self::with_config(remote, ApiConfig::from_env())
    }

    pub fn with_config(remote: Arc<dyn RemoteTasks>, cfg: ApiConfig) -> Self {
        let store = Arc::new(CacheStore::new());
        let busy = Arc::new(AtomicBool::new(false));
        let shutdown_tx =
            spawn_reconciler(Arc::clone(&store), Arc::clone(&remote), cfg.tick, Arc::clone(&busy));
        let coordinator = Coordinator::new(Arc::clone(&store), Arc::clone(&remote));
        Self {
            store,
            remote,
            coordinator,
            scope: ArcSwap::from_pointee(MutationScope::new(cfg.page_limit, 0, TaskFilters::default())),
            cfg,
            busy,
            shutdown_tx,
        }
    }

    /// Route notices (success/failure toasts) somewhere other than the log.
    pub fn with_notifications(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.coordinator = self.coordinator.with_notifications(sink);
        self
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn config(&self) -> &ApiConfig {
        &self.cfg
    }

    /// Declare the view context mutations should target: which paged window
    /// the user is on and which filters are active.
    pub fn set_context(&self, offset: u32, filters: TaskFilters) {
        let scope = MutationScope::new(self.cfg.page_limit, offset, filters);
        debug!(paged = %scope.paged_key(), "context changed");
        self.scope.store(Arc::new(scope));
    }

    pub fn context(&self) -> Arc<MutationScope> {
        self.scope.load_full()
    }

    fn subscribe_key<T>(
        &self,
        key: QueryKey,
        extract: fn(&CachedValue) -> Option<T>,
    ) -> Subscription<T> {
        // First touch schedules the initial load through the same
        // invalidation path reconciliation uses.
        if self.store.get(&key).is_none() {
            self.store.invalidate(&key);
        }
        let rx = self.store.subscribe(&key);
        Subscription { key, store: Arc::clone(&self.store), rx, extract }
    }

    /// Subscribe to the current paged window.
    pub fn subscribe_paged(&self) -> Subscription<TaskPage> {
        self.subscribe_key(self.context().paged_key(), extract_page)
    }

    /// Subscribe to the infinite feed for the current filters.
    pub fn subscribe_infinite(&self) -> Subscription<TaskFeed> {
        self.subscribe_key(self.context().infinite_key(), extract_feed)
    }

    pub fn subscribe_detail(&self, id: &TaskId) -> Subscription<TaskDetail> {
        self.subscribe_key(QueryKey::detail(id), extract_detail)
    }

    /// Fetch the next page of the current infinite feed and append it. A
    /// mutation racing this call cancels the append; the feed is left to the
    /// settlement refetch instead.
    pub async fn load_more(&self) -> anyhow::Result<usize> {
        let scope = self.context();
        let key = scope.infinite_key();
        let loaded = self
            .store
            .get(&key)
            .and_then(|v| v.as_feed().map(|f| f.loaded_pages()))
            .unwrap_or(0);
        let ticket = self.store.begin_fetch(&key);
        let params = PageParams::page(scope.limit, loaded as u32);
        match self.remote.list(params, &scope.filters).await {
            Ok(page) => {
                let mut feed = self
                    .store
                    .get(&key)
                    .and_then(|v| v.as_feed().cloned())
                    .unwrap_or_default();
                feed.pages.push(page);
                let pages = feed.pages.len();
                self.store.complete_fetch(ticket, FetchOutcome::Value(CachedValue::Feed(feed)));
                Ok(pages)
            }
            Err(e) => {
                self.store.complete_fetch(ticket, FetchOutcome::Error(e.to_string()));
                Err(anyhow::anyhow!("load more failed: {e}"))
            }
        }
    }

    pub async fn create(&self, draft: NewTask) -> Result<Task, OperationFailed> {
        let scope = self.context();
        self.coordinator.create(&scope, draft).await
    }

    pub async fn update(&self, id: &TaskId, patch: TaskPatch) -> Result<Task, OperationFailed> {
        let scope = self.context();
        self.coordinator.update(&scope, id, patch).await
    }

    pub async fn delete(&self, id: &TaskId) -> Result<(), OperationFailed> {
        let scope = self.context();
        self.coordinator.delete(&scope, id).await
    }

    pub async fn bulk_delete(&self, ids: &[TaskId]) -> Result<(), OperationFailed> {
        let scope = self.context();
        self.coordinator.bulk_delete(&scope, ids).await
    }

    /// Wait until the invalidation queue is drained and the reconciler is
    /// idle. Returns `false` on timeout.
    pub async fn quiesce(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.store.pending_invalidations() == 0 && !self.busy.load(Ordering::SeqCst) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(pending = self.store.pending_invalidations(), "quiesce timed out");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    /// Stop the reconciler. Queued invalidations stay queued; a fresh façade
    /// over the same remote would pick them up only via new subscriptions.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Spawn the reconciler loop: every tick, drain the invalidation queue and
/// refetch. List keys go one at a time; detail keys for the same batch run
/// concurrently.
fn spawn_reconciler(
    store: Arc<CacheStore>,
    remote: Arc<dyn RemoteTasks>,
    tick: Duration,
    busy: Arc<AtomicBool>,
) -> watch::Sender<bool> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("reconciler started");
        loop {
            tokio::select! {
                res = shutdown_rx.changed() => {
                    // Err means the facade was dropped without an explicit
                    // shutdown; stop along with it.
                    if res.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    busy.store(true, Ordering::SeqCst);
                    let keys = store.take_invalidations();
                    if !keys.is_empty() {
                        let t0 = Instant::now();
                        let (lists, details): (Vec<QueryKey>, Vec<QueryKey>) =
                            keys.into_iter().partition(|k| k.is_list());
                        for key in &lists {
                            refetch(&store, remote.as_ref(), key).await;
                        }
                        futures::future::join_all(
                            details.iter().map(|key| refetch(&store, remote.as_ref(), key)),
                        )
                        .await;
                        histogram!("reconcile_batch_ms", t0.elapsed().as_millis() as f64);
                        debug!(
                            lists = lists.len(),
                            details = details.len(),
                            took_ms = %t0.elapsed().as_millis(),
                            "reconcile batch done"
                        );
                    }
                    busy.store(false, Ordering::SeqCst);
                }
            }
        }
        info!("reconciler stopped");
    });
    shutdown_tx
}

/// Refetch one key and land the outcome through the store's generation
/// guard. A fetch that was cancelled or overtaken mid-flight lands nowhere.
async fn refetch(store: &CacheStore, remote: &dyn RemoteTasks, key: &QueryKey) {
    let target = match (key.view, key.target.as_ref()) {
        (ViewKind::Detail, None) => {
            warn!(key = %key, "detail key without target");
            return;
        }
        (_, target) => target,
    };
    counter!("reconcile_fetch_total", 1u64, "view" => key.view.as_str());
    let ticket = store.begin_fetch(key);
    let outcome = match key.view {
        ViewKind::Paged => {
            let params = PageParams::new(key.limit, key.offset.unwrap_or(0));
            match remote.list(params, &key.filters).await {
                Ok(page) => FetchOutcome::Value(CachedValue::Page(page)),
                Err(e) => {
                    counter!("reconcile_fetch_errors_total", 1u64);
                    FetchOutcome::Error(e.to_string())
                }
            }
        }
        ViewKind::Infinite => refetch_feed(store, remote, key).await,
        ViewKind::Detail => {
            let id = target.expect("checked above");
            match remote.get(id).await {
                Ok(task) => FetchOutcome::Value(CachedValue::Detail(TaskDetail::new(task))),
                Err(e) if e.is_not_found() => FetchOutcome::Missing,
                Err(e) => {
                    counter!("reconcile_fetch_errors_total", 1u64);
                    FetchOutcome::Error(e.to_string())
                }
            }
        }
    };
    store.complete_fetch(ticket, outcome);
}

/// Rebuild every loaded page of a feed, head first, so per-page totals come
/// back mutually consistent. A feed nobody has loaded yet fetches one page.
async fn refetch_feed(store: &CacheStore, remote: &dyn RemoteTasks, key: &QueryKey) -> FetchOutcome {
    let loaded = store
        .get(key)
        .and_then(|v| v.as_feed().map(|f| f.loaded_pages()))
        .unwrap_or(1)
        .max(1);
    let mut pages = Vec::with_capacity(loaded);
    for index in 0..loaded {
        let params = PageParams::page(key.limit, index as u32);
        match remote.list(params, &key.filters).await {
            Ok(page) => {
                // Stop early once the server runs out of rows.
                let empty_tail = page.items.is_empty() && index > 0;
                pages.push(page);
                if empty_tail {
                    pages.pop();
                    break;
                }
            }
            Err(e) => {
                counter!("reconcile_fetch_errors_total", 1u64);
                return FetchOutcome::Error(e.to_string());
            }
        }
    }
    FetchOutcome::Value(CachedValue::Feed(TaskFeed { pages }))
}
