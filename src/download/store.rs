// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-memory task registry.
//!
//! The store is the only owner of the active and stored collections. Every
//! operation takes the single write lock for its whole duration and works on
//! whole tasks, so a poll update and a promotion can never interleave field
//! by field. Callers get clones, never references into the collections, and
//! the lock is never held across an `.await`.

use std::sync::{Arc, RwLock};

use indexmap::IndexMap;

use super::types::{Task, TaskState, WorkerHandle, WorkerStatus};
use crate::locks::{resilient_read, resilient_write};

/// Which collection a task lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    /// Pending, downloading, complete (until swept) and failed tasks
    Active,
    /// Library
    Stored,
}

#[derive(Debug, Default)]
struct Collections {
    active: IndexMap<String, Task>,
    stored: IndexMap<String, Task>,
}

impl Collections {
    fn get_mut(&mut self, collection: Collection) -> &mut IndexMap<String, Task> {
        match collection {
            Collection::Active => &mut self.active,
            Collection::Stored => &mut self.stored,
        }
    }

    fn contains(&self, content_id: &str) -> bool {
        self.active.contains_key(content_id) || self.stored.contains_key(content_id)
    }
}

/// Outcome of recording a failed poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollFailure {
    /// Streak below the limit, progress left untouched
    Counted(u32),
    /// Limit reached, task moved to `Failed`
    MarkedFailed,
    /// Task is gone or no longer downloading
    Ignored,
}

/// Shared handle to the registry. Cloning is cheap.
#[derive(Debug, Clone, Default)]
pub struct TaskStore {
    inner: Arc<RwLock<Collections>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-partitioned collections, e.g. after loading from disk.
    pub fn with_tasks(active: Vec<Task>, stored: Vec<Task>) -> Self {
        let store = Self::new();
        store.replace_all(active, stored);
        store
    }

    /// Replace both collections wholesale.
    ///
    /// Ids already seen (in either collection) are skipped, first one wins.
    pub fn replace_all(&self, active: Vec<Task>, stored: Vec<Task>) {
        let mut fresh = Collections::default();
        for task in active {
            if !fresh.contains(&task.content_id) {
                fresh.active.insert(task.content_id.clone(), task);
            }
        }
        for task in stored {
            if !fresh.contains(&task.content_id) {
                fresh.stored.insert(task.content_id.clone(), task);
            }
        }
        *resilient_write(&self.inner) = fresh;
    }

    /// Add a task to the active collection.
    ///
    /// Returns `false` without changing anything if the id is already
    /// tracked in either collection.
    pub fn add(&self, task: Task) -> bool {
        let mut guard = resilient_write(&self.inner);
        if guard.contains(&task.content_id) {
            return false;
        }
        guard.active.insert(task.content_id.clone(), task);
        true
    }

    /// Remove a task from `collection`. Absent ids are a no-op.
    pub fn remove(&self, content_id: &str, collection: Collection) -> Option<Task> {
        resilient_write(&self.inner)
            .get_mut(collection)
            .shift_remove(content_id)
    }

    /// Move a task between collections. Returns whether anything moved.
    pub fn move_to(&self, content_id: &str, from: Collection, to: Collection) -> bool {
        if from == to {
            return false;
        }
        let mut guard = resilient_write(&self.inner);
        match guard.get_mut(from).shift_remove(content_id) {
            Some(task) => {
                guard.get_mut(to).insert(content_id.to_string(), task);
                true
            }
            None => false,
        }
    }

    /// Promote a `Complete` active task into the library.
    ///
    /// The state change and the move happen under one lock, so two callers
    /// racing to promote the same task cannot both succeed.
    pub fn promote(&self, content_id: &str) -> bool {
        let mut guard = resilient_write(&self.inner);
        let ready = guard
            .active
            .get(content_id)
            .is_some_and(|t| t.state == TaskState::Complete);
        if !ready {
            return false;
        }
        match guard.active.shift_remove(content_id) {
            Some(mut task) => {
                task.transition(TaskState::Stored);
                task.rate_bytes_per_sec = 0;
                guard.stored.insert(content_id.to_string(), task);
                true
            }
            None => false,
        }
    }

    /// Apply `f` to an active task in place. Returns `None` if absent.
    pub fn update<R>(&self, content_id: &str, f: impl FnOnce(&mut Task) -> R) -> Option<R> {
        resilient_write(&self.inner).active.get_mut(content_id).map(f)
    }

    /// Transition an active task if the state machine allows it.
    pub fn transition(&self, content_id: &str, next: TaskState) -> bool {
        self.update(content_id, |task| task.transition(next))
            .unwrap_or(false)
    }

    /// Record a freshly launched worker and flip the task to `Downloading`.
    ///
    /// Only a `Pending` task that never had a worker is accepted.
    pub fn mark_launched(&self, content_id: &str, handle: WorkerHandle) -> bool {
        self.update(content_id, |task| {
            if task.state != TaskState::Pending || task.worker.is_some() {
                return false;
            }
            task.worker = Some(handle);
            task.transition(TaskState::Downloading)
        })
        .unwrap_or(false)
    }

    /// Merge a poll result. Returns the task's state afterwards.
    pub fn apply_progress(&self, content_id: &str, report: &WorkerStatus) -> Option<TaskState> {
        self.update(content_id, |task| {
            task.apply_progress(report);
            task.state
        })
    }

    /// Count a failed poll; fail the task once `limit` is reached.
    ///
    /// A `limit` of zero never fails the task.
    pub fn record_poll_failure(&self, content_id: &str, limit: u32) -> PollFailure {
        self.update(content_id, |task| {
            if task.state != TaskState::Downloading {
                return PollFailure::Ignored;
            }
            task.poll_failures += 1;
            if limit > 0 && task.poll_failures >= limit && task.transition(TaskState::Failed) {
                PollFailure::MarkedFailed
            } else {
                PollFailure::Counted(task.poll_failures)
            }
        })
        .unwrap_or(PollFailure::Ignored)
    }

    pub fn get(&self, content_id: &str) -> Option<Task> {
        let guard = resilient_read(&self.inner);
        guard
            .active
            .get(content_id)
            .or_else(|| guard.stored.get(content_id))
            .cloned()
    }

    /// Which collection holds `content_id`, if any.
    pub fn locate(&self, content_id: &str) -> Option<Collection> {
        let guard = resilient_read(&self.inner);
        if guard.active.contains_key(content_id) {
            Some(Collection::Active)
        } else if guard.stored.contains_key(content_id) {
            Some(Collection::Stored)
        } else {
            None
        }
    }

    pub fn contains(&self, content_id: &str) -> bool {
        resilient_read(&self.inner).contains(content_id)
    }

    /// Visit every active task under the read lock.
    ///
    /// `f` must not call back into the store.
    pub fn for_each_active(&self, mut f: impl FnMut(&Task)) {
        let guard = resilient_read(&self.inner);
        for task in guard.active.values() {
            f(task);
        }
    }

    pub fn active(&self) -> Vec<Task> {
        resilient_read(&self.inner).active.values().cloned().collect()
    }

    pub fn stored(&self) -> Vec<Task> {
        resilient_read(&self.inner).stored.values().cloned().collect()
    }

    /// Consistent copy of both collections taken under one lock.
    pub fn snapshot(&self) -> (Vec<Task>, Vec<Task>) {
        let guard = resilient_read(&self.inner);
        (
            guard.active.values().cloned().collect(),
            guard.stored.values().cloned().collect(),
        )
    }

    /// Every task, active first, then stored.
    pub fn snapshot_all(&self) -> Vec<Task> {
        let (mut active, stored) = self.snapshot();
        active.extend(stored);
        active
    }

    /// Ids of active tasks in the given state.
    pub fn active_ids_in(&self, state: TaskState) -> Vec<String> {
        let mut ids = Vec::new();
        self.for_each_active(|task| {
            if task.state == state {
                ids.push(task.content_id.clone());
            }
        });
        ids
    }

    pub fn len(&self) -> (usize, usize) {
        let guard = resilient_read(&self.inner);
        (guard.active.len(), guard.stored.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == (0, 0)
    }
}
