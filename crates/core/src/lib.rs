//! Optiq core types: task model, optimistic overlay, query keys and cached views.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod query;
pub mod value;

pub use query::{FilterError, PageParams, QueryKey, TaskFilters, ViewKind, DOMAIN};
pub use value::{CachedValue, Pagination, TaskDetail, TaskFeed, TaskPage};

/// Default window size for list views when nothing else is configured.
pub const DEFAULT_PAGE_LIMIT: u32 = 20;

/// Server-assigned task identifier (e.g. `T-1042`). Opaque to the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    InReview,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::InReview => "in_review",
            TaskStatus::Done => "done",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = FilterError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(TaskStatus::Todo),
            "in_progress" => Ok(TaskStatus::InProgress),
            "in_review" => Ok(TaskStatus::InReview),
            "done" => Ok(TaskStatus::Done),
            _ => Err(FilterError::InvalidValue { field: "status", value: s.to_string() }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = FilterError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            _ => Err(FilterError::InvalidValue { field: "priority", value: s.to_string() }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    #[default]
    Feature,
    Bug,
    Chore,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Feature => "feature",
            TaskKind::Bug => "bug",
            TaskKind::Chore => "chore",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = FilterError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "feature" => Ok(TaskKind::Feature),
            "bug" => Ok(TaskKind::Bug),
            "chore" => Ok(TaskKind::Chore),
            _ => Err(FilterError::InvalidValue { field: "kind", value: s.to_string() }),
        }
    }
}

/// Which mutation is being applied to an entity. Drives the optimistic overlay
/// and shows up as the `op` field in logs and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
    BulkDelete,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Create => "create",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
            MutationKind::BulkDelete => "bulk_delete",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Client-side overlay tracking whether an entity is mid-mutation.
///
/// Never serialized: a task deserialized from the wire always comes back
/// `Stable`, which is exactly how reconciliation clears pending flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimisticStatus {
    #[default]
    Stable,
    Creating,
    Updating,
    Deleting,
}

impl OptimisticStatus {
    /// Overlay for an entity entering a mutation. A second mutation issued
    /// before the first settles simply re-applies on top, so the result
    /// depends only on the operation.
    pub fn on_mutation(kind: MutationKind) -> Self {
        match kind {
            MutationKind::Create => OptimisticStatus::Creating,
            MutationKind::Update => OptimisticStatus::Updating,
            MutationKind::Delete | MutationKind::BulkDelete => OptimisticStatus::Deleting,
        }
    }

    pub fn is_stable(&self) -> bool {
        matches!(self, OptimisticStatus::Stable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OptimisticStatus::Stable => "stable",
            OptimisticStatus::Creating => "creating",
            OptimisticStatus::Updating => "updating",
            OptimisticStatus::Deleting => "deleting",
        }
    }
}

impl fmt::Display for OptimisticStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub kind: TaskKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<UserId>,
    pub reporter: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Local-only overlay. `skip` means any task that round-trips through the
    /// wire is `Stable` again.
    #[serde(skip, default)]
    pub optimistic: OptimisticStatus,
}

impl Task {
    pub fn is_pending(&self) -> bool {
        !self.optimistic.is_stable()
    }
}

/// Fields for a task that does not exist yet. The remote assigns id and
/// timestamps; the optimistic path synthesizes placeholders for both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub kind: TaskKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<UserId>,
    pub reporter: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
}

impl NewTask {
    pub fn new(title: impl Into<String>, reporter: UserId) -> Self {
        Self {
            title: title.into(),
            status: TaskStatus::default(),
            priority: Priority::default(),
            kind: TaskKind::default(),
            assignee: None,
            reporter,
            due_date: None,
        }
    }

    /// Materialize a full task from the draft. Used by the remote when a
    /// create lands and by the optimistic path with a placeholder id.
    pub fn into_task(&self, id: TaskId, now: DateTime<Utc>) -> Task {
        Task {
            id,
            title: self.title.clone(),
            status: self.status,
            priority: self.priority,
            kind: self.kind,
            assignee: self.assignee.clone(),
            reporter: self.reporter.clone(),
            due_date: self.due_date,
            created_at: now,
            updated_at: now,
            optimistic: OptimisticStatus::Stable,
        }
    }
}

/// Partial update. Outer `None` leaves a field alone; for the nullable fields
/// `Some(None)` clears the value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<TaskKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<Option<UserId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<Option<DateTime<Utc>>>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.status.is_none()
            && self.priority.is_none()
            && self.kind.is_none()
            && self.assignee.is_none()
            && self.due_date.is_none()
    }

    /// Merge the patch into `task`, leaving untouched fields as they were.
    pub fn apply_to(&self, task: &mut Task) {
        if let Some(title) = &self.title {
            task.title = title.clone();
        }
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(priority) = self.priority {
            task.priority = priority;
        }
        if let Some(kind) = self.kind {
            task.kind = kind;
        }
        if let Some(assignee) = &self.assignee {
            task.assignee = assignee.clone();
        }
        if let Some(due) = &self.due_date {
            task.due_date = *due;
        }
    }
}

pub mod prelude {
    pub use super::query::{PageParams, QueryKey, TaskFilters, ViewKind};
    pub use super::value::{CachedValue, Pagination, TaskDetail, TaskFeed, TaskPage};
    pub use super::{
        MutationKind, NewTask, OptimisticStatus, Priority, Task, TaskId, TaskKind, TaskPatch,
        TaskStatus, UserId, DEFAULT_PAGE_LIMIT,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn task(id: &str) -> Task {
        NewTask::new("write release notes", UserId::from("u-7")).into_task(TaskId::from(id), t0())
    }

    #[test]
    fn optimistic_overlay_never_serialized() {
        let mut t = task("T-1");
        t.optimistic = OptimisticStatus::Creating;
        let json = serde_json::to_value(&t).unwrap();
        assert!(json.get("optimistic").is_none());
        let back: Task = serde_json::from_value(json).unwrap();
        assert_eq!(back.optimistic, OptimisticStatus::Stable);
    }

    #[test]
    fn overlay_follows_operation() {
        assert_eq!(OptimisticStatus::on_mutation(MutationKind::Create), OptimisticStatus::Creating);
        assert_eq!(OptimisticStatus::on_mutation(MutationKind::Update), OptimisticStatus::Updating);
        assert_eq!(OptimisticStatus::on_mutation(MutationKind::Delete), OptimisticStatus::Deleting);
        assert_eq!(
            OptimisticStatus::on_mutation(MutationKind::BulkDelete),
            OptimisticStatus::Deleting
        );
    }

    #[test]
    fn patch_merges_and_clears() {
        let mut t = task("T-2");
        t.assignee = Some(UserId::from("u-1"));
        let patch = TaskPatch {
            title: Some("rewrite release notes".into()),
            status: Some(TaskStatus::InProgress),
            assignee: Some(None),
            ..Default::default()
        };
        patch.apply_to(&mut t);
        assert_eq!(t.title, "rewrite release notes");
        assert_eq!(t.status, TaskStatus::InProgress);
        assert_eq!(t.assignee, None);
        assert_eq!(t.priority, Priority::Medium);
    }

    #[test]
    fn empty_patch_is_empty() {
        assert!(TaskPatch::default().is_empty());
        let p = TaskPatch { kind: Some(TaskKind::Bug), ..Default::default() };
        assert!(!p.is_empty());
    }

    #[test]
    fn enum_round_trips_from_str() {
        for s in ["todo", "in_progress", "in_review", "done"] {
            assert_eq!(s.parse::<TaskStatus>().unwrap().as_str(), s);
        }
        assert!("urgentish".parse::<Priority>().is_err());
    }

    #[test]
    fn display_honors_formatter_width() {
        // Column layouts rely on padding passing through Display.
        assert_eq!(format!("{:<9}|", TaskStatus::Done), "done     |");
        assert_eq!(format!("{:>8}", Priority::High), "    high");
        assert_eq!(format!("{:<8}", TaskKind::Bug), "bug     ");
        assert_eq!(format!("{:<6}", OptimisticStatus::Stable), "stable");
        assert_eq!(format!("{:<12}|", TaskId::from("T-1")), "T-1         |");
        assert_eq!(format!("{:<7}", UserId::from("u-3")), "u-3    ");
    }
}
