//! Optiq remote facade: the wire-facing task API and an in-memory remote.
//!
//! Everything above this crate talks to [`RemoteTasks`] and never to a
//! concrete transport. [`InMemoryRemote`] is the reference implementation:
//! it keeps the authoritative task list in RAM, applies server-side filter
//! and pagination semantics, and exposes a couple of levers (planted
//! failures, a hold gate for the next list call, artificial latency) that
//! tests and demos use to force interesting orderings.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use optiq_core::{NewTask, PageParams, Task, TaskFilters, TaskId, TaskPage, TaskPatch};
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("remote operation failed: {0}")]
    Failed(String),
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// The remote task service as the cache sees it. `NotFound` is an expected
/// outcome of `get` only; mutations on unknown ids report `Failed`.
#[async_trait]
pub trait RemoteTasks: Send + Sync {
    async fn list(&self, page: PageParams, filters: &TaskFilters) -> Result<TaskPage>;
    async fn get(&self, id: &TaskId) -> Result<Task>;
    async fn create(&self, draft: &NewTask) -> Result<Task>;
    async fn update(&self, id: &TaskId, patch: &TaskPatch) -> Result<Task>;
    async fn delete(&self, id: &TaskId) -> Result<()>;
    async fn delete_many(&self, ids: &[TaskId]) -> Result<()>;
}

struct RemoteState {
    /// Newest first; `create` pushes to the front, which is also the order
    /// `list` serves.
    tasks: Vec<Task>,
    next_id: u64,
    planted_failures: VecDeque<String>,
    hold_list: Option<oneshot::Receiver<()>>,
}

/// In-memory authoritative store with server-side list semantics.
pub struct InMemoryRemote {
    state: Mutex<RemoteState>,
    latency: Duration,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    pub fn new() -> Self {
        let latency_ms = std::env::var("OPTIQ_REMOTE_LATENCY_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        Self::with_latency(Duration::from_millis(latency_ms))
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            state: Mutex::new(RemoteState {
                tasks: Vec::new(),
                next_id: 1001,
                planted_failures: VecDeque::new(),
                hold_list: None,
            }),
            latency,
        }
    }

    /// A remote pre-populated with `n` plausible tasks, newest first.
    pub fn seeded(n: usize) -> Self {
        let remote = Self::new();
        remote.seed(n);
        remote
    }

    /// Append `n` plausible tasks, newest first.
    pub fn seed(&self, n: usize) {
        let mut state = self.state.lock().expect("remote lock poisoned");
        let now = Utc::now();
        for i in 0..n {
            let id = TaskId::new(format!("T-{}", state.next_id));
            state.next_id += 1;
            let task = seed_task(id, i, now - ChronoDuration::minutes(i as i64));
            state.tasks.push(task);
        }
    }

    /// Plant a failure for the next mutation (create/update/delete). List and
    /// get are unaffected, so background refetches keep working while a test
    /// fails exactly one operation.
    pub fn fail_next(&self, message: impl Into<String>) {
        let mut state = self.state.lock().expect("remote lock poisoned");
        state.planted_failures.push_back(message.into());
    }

    /// Gate the next `list` call: it will not return until the returned
    /// sender fires (or is dropped). Lets tests park a fetch mid-flight.
    pub fn hold_next_list(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().expect("remote lock poisoned");
        state.hold_list = Some(rx);
        tx
    }

    /// Authoritative view of every task, newest first. For assertions.
    pub fn tasks(&self) -> Vec<Task> {
        self.state.lock().expect("remote lock poisoned").tasks.clone()
    }

    pub fn insert(&self, task: Task) {
        let mut state = self.state.lock().expect("remote lock poisoned");
        state.tasks.insert(0, task);
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn take_planted_failure(&self) -> Option<String> {
        let mut state = self.state.lock().expect("remote lock poisoned");
        state.planted_failures.pop_front()
    }
}

#[async_trait]
impl RemoteTasks for InMemoryRemote {
    async fn list(&self, page: PageParams, filters: &TaskFilters) -> Result<TaskPage> {
        self.simulate_latency().await;
        let gate = {
            let mut state = self.state.lock().expect("remote lock poisoned");
            state.hold_list.take()
        };
        if let Some(rx) = gate {
            // Released by send or by dropping the sender; either unparks us.
            let _ = rx.await;
        }
        let state = self.state.lock().expect("remote lock poisoned");
        let matched: Vec<&Task> = state.tasks.iter().filter(|t| filters.matches(t)).collect();
        let total = matched.len() as u64;
        let items: Vec<Task> = matched
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .cloned()
            .collect();
        debug!(total, returned = items.len(), offset = page.offset, "remote list");
        Ok(TaskPage::new(items, total, page.limit, page.offset))
    }

    async fn get(&self, id: &TaskId) -> Result<Task> {
        self.simulate_latency().await;
        let state = self.state.lock().expect("remote lock poisoned");
        state
            .tasks
            .iter()
            .find(|t| &t.id == id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(id.clone()))
    }

    async fn create(&self, draft: &NewTask) -> Result<Task> {
        self.simulate_latency().await;
        if let Some(msg) = self.take_planted_failure() {
            return Err(RemoteError::Failed(msg));
        }
        let mut state = self.state.lock().expect("remote lock poisoned");
        let id = TaskId::new(format!("T-{}", state.next_id));
        state.next_id += 1;
        let task = draft.into_task(id, Utc::now());
        state.tasks.insert(0, task.clone());
        debug!(id = %task.id, "remote create");
        Ok(task)
    }

    async fn update(&self, id: &TaskId, patch: &TaskPatch) -> Result<Task> {
        self.simulate_latency().await;
        if let Some(msg) = self.take_planted_failure() {
            return Err(RemoteError::Failed(msg));
        }
        let mut state = self.state.lock().expect("remote lock poisoned");
        let task = state
            .tasks
            .iter_mut()
            .find(|t| &t.id == id)
            .ok_or_else(|| RemoteError::Failed(format!("no such task: {id}")))?;
        patch.apply_to(task);
        task.updated_at = Utc::now();
        debug!(id = %id, "remote update");
        Ok(task.clone())
    }

    async fn delete(&self, id: &TaskId) -> Result<()> {
        self.simulate_latency().await;
        if let Some(msg) = self.take_planted_failure() {
            return Err(RemoteError::Failed(msg));
        }
        let mut state = self.state.lock().expect("remote lock poisoned");
        let before = state.tasks.len();
        state.tasks.retain(|t| &t.id != id);
        if state.tasks.len() == before {
            return Err(RemoteError::Failed(format!("no such task: {id}")));
        }
        debug!(id = %id, "remote delete");
        Ok(())
    }

    async fn delete_many(&self, ids: &[TaskId]) -> Result<()> {
        self.simulate_latency().await;
        if let Some(msg) = self.take_planted_failure() {
            return Err(RemoteError::Failed(msg));
        }
        let mut state = self.state.lock().expect("remote lock poisoned");
        // All or nothing: one unknown id fails the whole batch.
        if let Some(missing) = ids.iter().find(|id| !state.tasks.iter().any(|t| t.id == **id)) {
            return Err(RemoteError::Failed(format!("no such task: {missing}")));
        }
        state.tasks.retain(|t| !ids.contains(&t.id));
        debug!(count = ids.len(), "remote bulk delete");
        Ok(())
    }
}

fn seed_task(id: TaskId, i: usize, created: chrono::DateTime<Utc>) -> Task {
    use optiq_core::{Priority, TaskKind, TaskStatus, UserId};

    const TITLES: [&str; 8] = [
        "Fix login redirect loop",
        "Add keyboard shortcuts to board",
        "Migrate billing webhooks",
        "Tune search ranking weights",
        "Upgrade notification digests",
        "Repair flaky export job",
        "Polish onboarding checklist",
        "Archive stale attachments",
    ];
    const USERS: [&str; 4] = ["u-ana", "u-bo", "u-cleo", "u-dee"];
    const STATUSES: [TaskStatus; 4] =
        [TaskStatus::Todo, TaskStatus::InProgress, TaskStatus::InReview, TaskStatus::Done];
    const PRIORITIES: [Priority; 4] =
        [Priority::Low, Priority::Medium, Priority::High, Priority::Urgent];
    const KINDS: [TaskKind; 3] = [TaskKind::Feature, TaskKind::Bug, TaskKind::Chore];

    let mut draft = NewTask::new(
        format!("{} #{}", TITLES[i % TITLES.len()], i + 1),
        UserId::from(USERS[i % USERS.len()]),
    );
    draft.status = STATUSES[i % STATUSES.len()];
    draft.priority = PRIORITIES[i % PRIORITIES.len()];
    draft.kind = KINDS[i % KINDS.len()];
    if i % 3 != 0 {
        draft.assignee = Some(UserId::from(USERS[(i + 1) % USERS.len()]));
    }
    draft.into_task(id, created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use optiq_core::TaskStatus;

    #[tokio::test]
    async fn list_filters_and_paginates() {
        let remote = InMemoryRemote::seeded(10);
        let all = remote.list(PageParams::new(4, 0), &TaskFilters::default()).await.unwrap();
        assert_eq!(all.items.len(), 4);
        assert_eq!(all.page.total, 10);

        let page2 = remote.list(PageParams::new(4, 8), &TaskFilters::default()).await.unwrap();
        assert_eq!(page2.items.len(), 2);

        let filters =
            TaskFilters { status: Some(TaskStatus::Done), ..Default::default() }.normalize();
        let done = remote.list(PageParams::new(10, 0), &filters).await.unwrap();
        assert!(done.items.iter().all(|t| t.status == TaskStatus::Done));
        assert_eq!(done.page.total, done.items.len() as u64);
    }

    #[tokio::test]
    async fn create_prepends_and_sequences_ids() {
        let remote = InMemoryRemote::seeded(2);
        let draft = NewTask::new("newest", optiq_core::UserId::from("u-1"));
        let created = remote.create(&draft).await.unwrap();
        assert_eq!(created.id.as_str(), "T-1003");
        let head = remote.list(PageParams::new(1, 0), &TaskFilters::default()).await.unwrap();
        assert_eq!(head.items[0].id, created.id);
    }

    #[tokio::test]
    async fn planted_failure_hits_one_mutation() {
        let remote = InMemoryRemote::seeded(1);
        remote.fail_next("backend on fire");
        let draft = NewTask::new("doomed", optiq_core::UserId::from("u-1"));
        let err = remote.create(&draft).await.unwrap_err();
        assert!(matches!(err, RemoteError::Failed(m) if m == "backend on fire"));
        // The failure is consumed; the retry lands.
        assert!(remote.create(&draft).await.is_ok());
    }

    #[tokio::test]
    async fn get_distinguishes_not_found() {
        let remote = InMemoryRemote::seeded(1);
        let err = remote.get(&TaskId::from("T-9999")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn bulk_delete_is_all_or_nothing() {
        let remote = InMemoryRemote::seeded(3);
        let ids = vec![TaskId::from("T-1001"), TaskId::from("T-9999")];
        assert!(remote.delete_many(&ids).await.is_err());
        assert_eq!(remote.tasks().len(), 3);
        let ids = vec![TaskId::from("T-1001"), TaskId::from("T-1002")];
        remote.delete_many(&ids).await.unwrap();
        assert_eq!(remote.tasks().len(), 1);
    }

    #[tokio::test]
    async fn hold_gate_parks_one_list_call() {
        let remote = std::sync::Arc::new(InMemoryRemote::new());
        let release = remote.hold_next_list();
        let r2 = remote.clone();
        let parked =
            tokio::spawn(
                async move { r2.list(PageParams::new(5, 0), &TaskFilters::default()).await },
            );
        // Give the task a chance to reach the gate, then release it.
        tokio::task::yield_now().await;
        assert!(!parked.is_finished());
        release.send(()).unwrap();
        let page = parked.await.unwrap().unwrap();
        assert_eq!(page.page.total, 0);
    }
}
