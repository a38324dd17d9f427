//! Query keys: canonical identities for cached views.
//!
//! A key is a typed value, not a string path. Equality and hashing go through
//! the normalized filter struct, so two callers asking for the same view with
//! filters given in a different order land on the same cache entry.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

use crate::{Priority, Task, TaskId, TaskKind, TaskStatus, UserId};

/// Every key in this crate lives under one domain.
pub const DOMAIN: &str = "tasks";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewKind {
    Paged,
    Infinite,
    Detail,
}

impl ViewKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViewKind::Paged => "paged",
            ViewKind::Infinite => "infinite",
            ViewKind::Detail => "detail",
        }
    }
}

impl fmt::Display for ViewKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Window of a list fetch. For infinite views `offset` is derived from the
/// page index being loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageParams {
    pub limit: u32,
    pub offset: u32,
}

impl PageParams {
    pub fn new(limit: u32, offset: u32) -> Self {
        Self { limit, offset }
    }

    /// Window for page `index` of an infinite scroll with page size `limit`.
    pub fn page(limit: u32, index: u32) -> Self {
        Self { limit, offset: index.saturating_mul(limit) }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("unknown filter field: {0}")]
    UnknownField(String),
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
    #[error("expected field=value, got: {0}")]
    Malformed(String),
}

/// Server-side filters for task lists. The struct itself is the canonical
/// form: unset fields are `None`, the search term is trimmed and case-folded,
/// and derived `Eq`/`Hash` make equal filter sets equal keys regardless of
/// how callers spelled them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<TaskKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

impl TaskFilters {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.priority.is_none()
            && self.kind.is_none()
            && self.assignee.is_none()
            && self.search.is_none()
    }

    /// Trim and case-fold the search term; an empty term counts as unset.
    pub fn normalize(mut self) -> Self {
        self.search = self.search.and_then(|s| {
            let s = s.trim().to_lowercase();
            if s.is_empty() {
                None
            } else {
                Some(s)
            }
        });
        self
    }

    /// Parse `field=value` pairs as they arrive from a CLI or a URL. Order
    /// does not matter; a repeated field keeps the last value.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self, FilterError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut f = TaskFilters::default();
        for pair in pairs {
            let (field, value) = pair
                .split_once('=')
                .ok_or_else(|| FilterError::Malformed(pair.to_string()))?;
            let value = value.trim();
            match field.trim() {
                "status" => f.status = Some(value.parse()?),
                "priority" => f.priority = Some(value.parse()?),
                "kind" => f.kind = Some(value.parse()?),
                "assignee" => f.assignee = Some(UserId::from(value)),
                "search" => f.search = Some(value.to_string()),
                other => return Err(FilterError::UnknownField(other.to_string())),
            }
        }
        Ok(f.normalize())
    }

    /// Set fields in a fixed order, for display and key rendering.
    pub fn canonical_pairs(&self) -> SmallVec<[(&'static str, String); 5]> {
        let mut out = SmallVec::new();
        if let Some(a) = &self.assignee {
            out.push(("assignee", a.to_string()));
        }
        if let Some(k) = &self.kind {
            out.push(("kind", k.to_string()));
        }
        if let Some(p) = &self.priority {
            out.push(("priority", p.to_string()));
        }
        if let Some(s) = &self.search {
            out.push(("search", s.clone()));
        }
        if let Some(st) = &self.status {
            out.push(("status", st.to_string()));
        }
        out
    }

    /// Server-side match semantics, shared by the in-memory remote and by
    /// anything that needs to decide which cached lists a task belongs to.
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(status) = self.status {
            if task.status != status {
                return false;
            }
        }
        if let Some(priority) = self.priority {
            if task.priority != priority {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if task.kind != kind {
                return false;
            }
        }
        if let Some(assignee) = &self.assignee {
            if task.assignee.as_ref() != Some(assignee) {
                return false;
            }
        }
        if let Some(search) = &self.search {
            if !task.title.to_lowercase().contains(search.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Identity of one cached view. List keys carry the window and filters;
/// detail keys carry the entity id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub domain: &'static str,
    pub view: ViewKind,
    pub limit: u32,
    pub offset: Option<u32>,
    pub target: Option<TaskId>,
    pub filters: TaskFilters,
}

impl QueryKey {
    pub fn paged(limit: u32, offset: u32, filters: &TaskFilters) -> Self {
        Self {
            domain: DOMAIN,
            view: ViewKind::Paged,
            limit,
            offset: Some(offset),
            target: None,
            filters: filters.clone().normalize(),
        }
    }

    pub fn infinite(limit: u32, filters: &TaskFilters) -> Self {
        Self {
            domain: DOMAIN,
            view: ViewKind::Infinite,
            limit,
            offset: None,
            target: None,
            filters: filters.clone().normalize(),
        }
    }

    pub fn detail(id: &TaskId) -> Self {
        Self {
            domain: DOMAIN,
            view: ViewKind::Detail,
            limit: 0,
            offset: None,
            target: Some(id.clone()),
            filters: TaskFilters::default(),
        }
    }

    pub fn is_list(&self) -> bool {
        !matches!(self.view, ViewKind::Detail)
    }

    pub fn targets(&self, id: &TaskId) -> bool {
        self.target.as_ref() == Some(id)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.view {
            ViewKind::Detail => {
                let id = self.target.as_ref().map(TaskId::as_str).unwrap_or("?");
                write!(f, "{}/detail/{}", self.domain, id)
            }
            ViewKind::Paged => {
                write!(f, "{}/paged?limit={}", self.domain, self.limit)?;
                if let Some(o) = self.offset {
                    write!(f, "&offset={o}")?;
                }
                for (k, v) in self.filters.canonical_pairs() {
                    write!(f, "&{k}={v}")?;
                }
                Ok(())
            }
            ViewKind::Infinite => {
                write!(f, "{}/infinite?limit={}", self.domain, self.limit)?;
                for (k, v) in self.filters.canonical_pairs() {
                    write!(f, "&{k}={v}")?;
                }
                Ok(())
            }
        }
    }
}
