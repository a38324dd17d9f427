//! Pure view mergers: speculative edits over immutable cached values.
//!
//! Every function here takes the current value by reference and returns a
//! fresh one. Nothing is spliced in place, which is what makes the
//! snapshot/rollback contract trivial: the old value the coordinator captured
//! is never aliased by the new one.
//!
//! Delete handling is deliberately lopsided between the two list shapes: the
//! infinite feed decrements the matched page's `total` at write time, while
//! the paged view leaves `total` for reconciliation to correct. That mirrors
//! how the rest of the system expects each view to behave until the refetch
//! lands.

use chrono::{DateTime, Utc};
use optiq_core::{
    MutationKind, OptimisticStatus, Task, TaskDetail, TaskFeed, TaskId, TaskPage, TaskPatch,
};

/// Prepend a placeholder to a paged window and count it.
pub fn page_prepend(page: &TaskPage, task: &Task) -> TaskPage {
    let mut next = page.clone();
    next.items.insert(0, task.clone());
    next.page.total += 1;
    next
}

/// Prepend a placeholder to the head of a feed. Only page 0's items and
/// `total` change; deeper pages keep their fetched counts. An empty feed
/// grows a head page so the placeholder has somewhere to live.
pub fn feed_prepend(feed: &TaskFeed, task: &Task, limit: u32) -> TaskFeed {
    let mut next = feed.clone();
    match next.pages.first_mut() {
        Some(head) => {
            head.items.insert(0, task.clone());
            head.page.total += 1;
        }
        None => next.pages.push(TaskPage::new(vec![task.clone()], 1, limit, 0)),
    }
    next
}

fn patched(task: &Task, patch: &TaskPatch) -> Task {
    let mut t = task.clone();
    patch.apply_to(&mut t);
    t.optimistic = OptimisticStatus::on_mutation(MutationKind::Update);
    t
}

/// Merge a patch into every matching entity of the window, flagging it
/// `updating`. Entities that do not match pass through untouched.
pub fn page_apply_patch(page: &TaskPage, id: &TaskId, patch: &TaskPatch) -> TaskPage {
    let mut next = page.clone();
    for t in next.items.iter_mut().filter(|t| &t.id == id) {
        *t = patched(t, patch);
    }
    next
}

pub fn feed_apply_patch(feed: &TaskFeed, id: &TaskId, patch: &TaskPatch) -> TaskFeed {
    let mut next = feed.clone();
    for page in next.pages.iter_mut() {
        for t in page.items.iter_mut().filter(|t| &t.id == id) {
            *t = patched(t, patch);
        }
    }
    next
}

pub fn detail_apply_patch(detail: &TaskDetail, patch: &TaskPatch) -> TaskDetail {
    let mut next = detail.clone();
    patch.apply_to(&mut next.task);
    next.task.optimistic = OptimisticStatus::on_mutation(MutationKind::Update);
    next
}

/// Flag matching entities `deleting` in place. They stay in the window and
/// `total` stays put; the settlement refetch supplies the canonical count.
pub fn page_flag_deleting(page: &TaskPage, ids: &[TaskId]) -> TaskPage {
    let mut next = page.clone();
    for t in next.items.iter_mut().filter(|t| ids.contains(&t.id)) {
        t.optimistic = OptimisticStatus::on_mutation(MutationKind::Delete);
    }
    next
}

/// Flag matching entities `deleting` and debit each page's `total` by the
/// number of matches found on that page.
pub fn feed_flag_deleting(feed: &TaskFeed, ids: &[TaskId]) -> TaskFeed {
    let mut next = feed.clone();
    for page in next.pages.iter_mut() {
        let mut matched: u64 = 0;
        for t in page.items.iter_mut().filter(|t| ids.contains(&t.id)) {
            t.optimistic = OptimisticStatus::on_mutation(MutationKind::Delete);
            matched += 1;
        }
        page.page.total = page.page.total.saturating_sub(matched);
    }
    next
}

/// Mark a detail view deleted without dropping the data, so a detail screen
/// can keep rendering while the remote call is in flight.
pub fn detail_flag_deleting(detail: &TaskDetail, now: DateTime<Utc>) -> TaskDetail {
    let mut next = detail.clone();
    next.is_deleted = true;
    next.deleted_at = Some(now);
    next.task.optimistic = OptimisticStatus::on_mutation(MutationKind::Delete);
    next
}
