//! Cached view values: one page, an infinite feed, or a single entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::query::ViewKind;
use crate::{Task, TaskId};

/// Window metadata returned alongside every list fetch. `total` is the
/// server-side count across all pages of the filtered set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

/// One window of a list, as fetched or as locally adjusted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPage {
    pub items: Vec<Task>,
    pub page: Pagination,
}

impl TaskPage {
    pub fn new(items: Vec<Task>, total: u64, limit: u32, offset: u32) -> Self {
        Self { items, page: Pagination { total, limit, offset } }
    }

    pub fn position(&self, id: &TaskId) -> Option<usize> {
        self.items.iter().position(|t| &t.id == id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.position(id).is_some()
    }
}

/// Accumulated pages of an infinite scroll. Page 0 is the head of the list;
/// the newest entities live at the front of page 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFeed {
    pub pages: Vec<TaskPage>,
}

impl TaskFeed {
    pub fn loaded_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.pages.iter().flat_map(|p| p.items.iter())
    }

    pub fn find(&self, id: &TaskId) -> Option<&Task> {
        self.tasks().find(|t| &t.id == id)
    }

    /// Total as reported by the most recently consistent page, head first.
    pub fn total(&self) -> Option<u64> {
        self.pages.first().map(|p| p.page.total)
    }
}

/// A single entity plus local bookkeeping for views that outlive a delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDetail {
    pub task: Task,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl TaskDetail {
    pub fn new(task: Task) -> Self {
        Self { task, is_deleted: false, deleted_at: None }
    }
}

impl From<Task> for TaskDetail {
    fn from(task: Task) -> Self {
        Self::new(task)
    }
}

/// What a cache entry holds. The variant always agrees with the view kind of
/// the entry's key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachedValue {
    Page(TaskPage),
    Feed(TaskFeed),
    Detail(TaskDetail),
}

impl CachedValue {
    pub fn kind(&self) -> ViewKind {
        match self {
            CachedValue::Page(_) => ViewKind::Paged,
            CachedValue::Feed(_) => ViewKind::Infinite,
            CachedValue::Detail(_) => ViewKind::Detail,
        }
    }

    pub fn as_page(&self) -> Option<&TaskPage> {
        match self {
            CachedValue::Page(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_feed(&self) -> Option<&TaskFeed> {
        match self {
            CachedValue::Feed(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_detail(&self) -> Option<&TaskDetail> {
        match self {
            CachedValue::Detail(d) => Some(d),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NewTask, UserId};
    use chrono::TimeZone;

    fn task(id: &str) -> Task {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        NewTask::new(format!("task {id}"), UserId::from("u-1")).into_task(TaskId::from(id), now)
    }

    #[test]
    fn feed_flattens_in_page_order() {
        let feed = TaskFeed {
            pages: vec![
                TaskPage::new(vec![task("T-3"), task("T-2")], 3, 2, 0),
                TaskPage::new(vec![task("T-1")], 3, 2, 2),
            ],
        };
        let ids: Vec<_> = feed.tasks().map(|t| t.id.as_str().to_string()).collect();
        assert_eq!(ids, ["T-3", "T-2", "T-1"]);
        assert_eq!(feed.total(), Some(3));
        assert!(feed.find(&TaskId::from("T-1")).is_some());
    }

    #[test]
    fn value_kind_matches_variant() {
        let v = CachedValue::Detail(TaskDetail::new(task("T-9")));
        assert_eq!(v.kind(), ViewKind::Detail);
        assert!(v.as_detail().is_some());
        assert!(v.as_page().is_none());
    }
}
