// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! User-facing task lifecycle: enqueue, cancel, library removal, promotion.

use std::collections::HashSet;
use std::io;
use std::sync::Arc;

use super::store::{Collection, TaskStore};
use super::supervisor::{signal_group, LaunchError, ProcessSupervisor};
use super::types::{Task, TaskState, WorkerHandle};
use crate::config::Config;
use crate::search::SearchResult;

/// Split loaded tasks into (active, stored).
///
/// The first occurrence of a content id wins. Tasks that were downloading go
/// back to the active collection; everything else is library material, and
/// a task saved as `Complete` is promoted on the way in.
pub fn dedupe_on_load(tasks: Vec<Task>) -> (Vec<Task>, Vec<Task>) {
    let mut seen = HashSet::new();
    let mut active = Vec::new();
    let mut stored = Vec::new();

    for mut task in tasks {
        if !seen.insert(task.content_id.clone()) {
            tracing::warn!(content_id = %task.content_id, "Dropping duplicate saved task");
            continue;
        }
        if task.state == TaskState::Downloading {
            active.push(task);
        } else {
            if task.state == TaskState::Complete {
                task.transition(TaskState::Stored);
            }
            task.rate_bytes_per_sec = 0;
            stored.push(task);
        }
    }

    (active, stored)
}

/// Reacts to user intent and to tasks reaching terminal states.
#[derive(Clone)]
pub struct LifecycleController {
    store: TaskStore,
    supervisor: ProcessSupervisor,
    config: Arc<Config>,
}

impl LifecycleController {
    pub fn new(store: TaskStore, supervisor: ProcessSupervisor, config: Arc<Config>) -> Self {
        Self {
            store,
            supervisor,
            config,
        }
    }

    /// Track a search candidate and start its worker.
    ///
    /// If the launch fails the task stays `Pending` in the active list so the
    /// user can retry or cancel it.
    pub async fn enqueue(&self, candidate: &SearchResult) -> Result<WorkerHandle, LaunchError> {
        if !self.store.add(Task::from_candidate(candidate)) {
            return Err(LaunchError::AlreadyTracked(candidate.content_id.clone()));
        }
        tracing::info!(
            content_id = %candidate.content_id,
            name = %candidate.display_name,
            "Task queued"
        );
        self.supervisor.launch(&candidate.content_id).await
    }

    /// Launch a task that is still `Pending` after a failed launch.
    pub async fn retry(&self, content_id: &str) -> Result<WorkerHandle, LaunchError> {
        tracing::info!(content_id, "Retrying launch");
        self.supervisor.launch(content_id).await
    }

    pub fn display_name(&self, content_id: &str) -> Option<String> {
        self.store.get(content_id).map(|task| task.display_name)
    }

    /// Stop and forget an active task, deleting whatever it downloaded.
    ///
    /// Idempotent; unknown ids and dead workers are not errors. The task
    /// leaves the active list first, so a launch racing with the cancel
    /// sees it gone and stops its own worker.
    pub async fn cancel(&self, content_id: &str) {
        let Some(task) = self.store.remove(content_id, Collection::Active) else {
            tracing::debug!(content_id, "Cancel of unknown task ignored");
            return;
        };

        if let Some(handle) = &task.worker {
            match signal_group(handle.group_id).await {
                Ok(()) => tracing::info!(content_id, group_id = handle.group_id, "Worker stopped"),
                Err(e) => tracing::warn!(
                    content_id,
                    group_id = handle.group_id,
                    "Could not signal worker (already gone?): {:#}",
                    e
                ),
            }
        }

        self.remove_artifacts(&task).await;
        tracing::info!(content_id, "Task cancelled");
    }

    /// Delete a library item and its files. Idempotent.
    pub async fn remove_from_library(&self, content_id: &str) {
        let Some(task) = self.store.remove(content_id, Collection::Stored) else {
            tracing::debug!(content_id, "Library removal of unknown item ignored");
            return;
        };
        self.remove_artifacts(&task).await;
        tracing::info!(content_id, "Removed from library");
    }

    /// Promote every `Complete` task into the library.
    ///
    /// Returns the ids promoted by this call. Data on disk is left alone.
    pub fn sweep_completed(&self) -> Vec<String> {
        self.store
            .active_ids_in(TaskState::Complete)
            .into_iter()
            .filter(|id| {
                let promoted = self.store.promote(id);
                if promoted {
                    tracing::info!(content_id = %id, "Moved to library");
                }
                promoted
            })
            .collect()
    }

    async fn remove_artifacts(&self, task: &Task) {
        let dir = self.config.task_dir(&task.display_name, &task.content_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => tracing::debug!(dir = %dir.display(), "Removed download directory"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(dir = %dir.display(), "Failed to remove download directory: {}", e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// pid_max tops out at 2^22, so this group can never exist.
    const DEAD_GROUP: u32 = 4_999_999;

    fn task(id: &str, state: TaskState) -> Task {
        let mut task = Task::new(id, format!("Name {id}"), 100);
        task.state = state;
        task
    }

    fn controller(downloader: &str) -> (TempDir, TaskStore, LifecycleController) {
        let dir = TempDir::new().unwrap();
        let mut config = Config::with_download_dir(dir.path());
        config.downloader = downloader.into();
        let config = Arc::new(config);
        let store = TaskStore::new();
        let supervisor = ProcessSupervisor::new(store.clone(), Arc::clone(&config));
        let controller = LifecycleController::new(store.clone(), supervisor, config);
        (dir, store, controller)
    }

    fn candidate(id: &str) -> SearchResult {
        SearchResult {
            content_id: id.to_string(),
            display_name: format!("Item {id}"),
            total_bytes: 2048,
            seeders: 3,
            leechers: 1,
            file_count: 1,
        }
    }

    #[test]
    fn test_dedupe_keeps_first_occurrence() {
        let mut first = task("a", TaskState::Downloading);
        first.display_name = "first".into();
        let mut second = task("a", TaskState::Stored);
        second.display_name = "second".into();

        let (active, stored) = dedupe_on_load(vec![first, task("b", TaskState::Stored), second]);

        assert_eq!(active.len(), 1);
        assert_eq!(active[0].display_name, "first");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content_id, "b");
    }

    #[test]
    fn test_dedupe_partitions_by_state() {
        let (active, stored) = dedupe_on_load(vec![
            task("d", TaskState::Downloading),
            task("c", TaskState::Complete),
            task("f", TaskState::Failed),
            task("p", TaskState::Pending),
        ]);

        let ids = |tasks: &[Task]| tasks.iter().map(|t| t.content_id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&active), ["d"]);
        assert_eq!(ids(&stored), ["c", "f", "p"]);
        assert_eq!(stored[0].state, TaskState::Stored);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_removes_directory() {
        let (dir, store, controller) = controller("true");
        let task = task("x", TaskState::Pending);
        let task_dir = dir.path().join("Name_x-x");
        std::fs::create_dir_all(task_dir.join("sub")).unwrap();
        std::fs::write(task_dir.join("sub").join("part.bin"), b"data").unwrap();
        store.add(task);

        controller.cancel("x").await;
        controller.cancel("x").await;

        assert!(!store.contains("x"));
        assert!(!task_dir.exists());
    }

    #[tokio::test]
    async fn test_cancel_with_dead_worker() {
        let (dir, store, controller) = controller("true");
        store.add(task("x", TaskState::Pending));
        assert!(store.mark_launched("x", WorkerHandle::new(1, DEAD_GROUP, "secret")));
        let task_dir = dir.path().join("Name_x-x");
        std::fs::create_dir_all(&task_dir).unwrap();
        std::fs::write(task_dir.join("part.bin"), b"data").unwrap();

        controller.cancel("x").await;
        assert!(!store.contains("x"));
        // Signal fails, cleanup still happens
        assert!(!task_dir.exists());
    }

    #[tokio::test]
    async fn test_cancel_spares_library_item_with_same_sanitized_title() {
        let (dir, store, controller) = controller("true");
        let mut library = Task::new("aaaa1111aaaa1111", "Big Buck Bunny", 100);
        library.state = TaskState::Stored;
        store.add(library);
        store.move_to("aaaa1111aaaa1111", Collection::Active, Collection::Stored);
        let library_dir = dir.path().join("Big_Buck_Bunny-aaaa1111");
        std::fs::create_dir_all(&library_dir).unwrap();
        std::fs::write(library_dir.join("movie.mkv"), b"data").unwrap();

        store.add(Task::new("bbbb2222bbbb2222", "Big_Buck_Bunny", 100));
        let active_dir = dir.path().join("Big_Buck_Bunny-bbbb2222");
        std::fs::create_dir_all(&active_dir).unwrap();

        controller.cancel("bbbb2222bbbb2222").await;

        assert!(!active_dir.exists());
        assert_eq!(store.locate("aaaa1111aaaa1111"), Some(Collection::Stored));
        assert!(library_dir.join("movie.mkv").exists());
    }

    #[tokio::test]
    async fn test_cancel_does_not_touch_library() {
        let (_dir, store, controller) = controller("true");
        store.add(task("s", TaskState::Stored));
        store.move_to("s", Collection::Active, Collection::Stored);

        controller.cancel("s").await;
        assert_eq!(store.locate("s"), Some(Collection::Stored));
    }

    #[tokio::test]
    async fn test_remove_from_library() {
        let (dir, store, controller) = controller("true");
        store.add(task("s", TaskState::Stored));
        store.move_to("s", Collection::Active, Collection::Stored);
        let task_dir = dir.path().join("Name_s-s");
        std::fs::create_dir_all(&task_dir).unwrap();

        controller.remove_from_library("s").await;
        controller.remove_from_library("s").await;

        assert!(!store.contains("s"));
        assert!(!task_dir.exists());
    }

    #[tokio::test]
    async fn test_sweep_promotes_complete_only_once() {
        let (dir, store, controller) = controller("true");
        store.add(task("c", TaskState::Complete));
        store.add(task("d", TaskState::Downloading));
        let task_dir = dir.path().join("Name_c-c");
        std::fs::create_dir_all(&task_dir).unwrap();

        assert_eq!(controller.sweep_completed(), vec!["c".to_string()]);
        assert!(controller.sweep_completed().is_empty());

        let promoted = store.get("c").unwrap();
        assert_eq!(promoted.state, TaskState::Stored);
        assert_eq!(store.locate("c"), Some(Collection::Stored));
        assert_eq!(store.locate("d"), Some(Collection::Active));
        assert!(task_dir.exists());
    }

    #[tokio::test]
    async fn test_enqueue_rejects_duplicates() {
        let (_dir, store, controller) = controller("/nonexistent/aria2c");
        store.add(task("dup", TaskState::Stored));

        let err = controller.enqueue(&candidate("dup")).await.unwrap_err();
        assert!(matches!(err, LaunchError::AlreadyTracked(ref id) if id == "dup"));
    }

    #[tokio::test]
    async fn test_failed_enqueue_leaves_pending_for_retry() {
        let (_dir, store, controller) = controller("/nonexistent/aria2c");

        let err = controller.enqueue(&candidate("n")).await.unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }), "{err}");

        let task = store.get("n").unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert!(task.worker.is_none());

        let err = controller.retry("n").await.unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }
}
