// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistent download state.
//!
//! The whole task set (active and library) is written as one JSON document
//! at shutdown and read back at startup. Writes go to a temp file that is
//! synced and renamed over the previous state, so a crash mid-write leaves
//! the last good state in place. A sibling `.lock` file serialises access
//! between concurrent instances.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use super::types::Task;

/// Default timeout for acquiring file locks (5 seconds)
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval when waiting for lock acquisition
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Current on-disk format version
const STATE_VERSION: u32 = 1;

/// On-disk document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SavedState {
    version: u32,
    last_saved: Option<DateTime<Utc>>,
    tasks: Vec<Task>,
}

/// Reads and writes the state file at a fixed path.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
    lock_timeout: Duration,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: LOCK_TIMEOUT,
        }
    }

    /// Use a custom timeout for lock acquisition.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("tmp")
    }

    /// Acquire an exclusive lock with timeout.
    fn acquire_exclusive_lock_with_timeout(path: &Path, timeout: Duration) -> Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create directory for lock file: {:?}", parent)
            })?;
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file: {:?}", path))?;

        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&lock_file) {
                Ok(()) => return Ok(lock_file),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        bail!(
                            "Timed out waiting for exclusive lock on {:?} after {:?}. \
                             Another instance may be writing the state file.",
                            path,
                            timeout
                        );
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to acquire exclusive lock on {:?}", path));
                }
            }
        }
    }

    /// Acquire a shared lock with timeout.
    ///
    /// Called through `FileExt` so std's inherent `File::try_lock_shared`,
    /// which has a different error type, is not picked.
    fn acquire_shared_lock_with_timeout(file: &File, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            match FileExt::try_lock_shared(file) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        bail!(
                            "Timed out waiting for shared lock after {:?}. \
                             Another instance may be writing the state file.",
                            timeout
                        );
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(e).with_context(|| "Failed to acquire shared lock on state file");
                }
            }
        }
    }

    /// Load every saved task.
    ///
    /// A missing state file is a fresh start and yields an empty list.
    /// Duplicates are returned as stored; deduplication is the caller's job.
    pub fn load(&self) -> Result<Vec<Task>> {
        if !self.path.exists() {
            tracing::info!(
                path = %self.path.display(),
                "No saved download state, starting fresh"
            );
            return Ok(Vec::new());
        }

        let lock_path = self.lock_path();
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file: {:?}", lock_path))?;

        Self::acquire_shared_lock_with_timeout(&lock_file, self.lock_timeout)?;

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read state file {:?}", self.path))?;
        let state: SavedState = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file {:?}", self.path))?;

        if state.version > STATE_VERSION {
            tracing::warn!(
                version = state.version,
                supported = STATE_VERSION,
                "State file was written by a newer version"
            );
        }

        tracing::info!(tasks = state.tasks.len(), "Download state loaded");
        Ok(state.tasks)
    }

    /// Write the union of both collections, active first.
    pub fn save(&self, active: &[Task], stored: &[Task]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let _lock_guard =
            Self::acquire_exclusive_lock_with_timeout(&self.lock_path(), self.lock_timeout)?;

        let state = SavedState {
            version: STATE_VERSION,
            last_saved: Some(Utc::now()),
            tasks: active.iter().chain(stored.iter()).cloned().collect(),
        };
        let content = serde_json::to_string_pretty(&state)
            .with_context(|| "Failed to serialize download state")?;

        let temp_path = self.temp_path();
        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;

            temp_file
                .write_all(content.as_bytes())
                .with_context(|| "Failed to write to temp file")?;

            temp_file
                .sync_all()
                .with_context(|| "Failed to sync temp file to disk")?;
        }

        // Atomic on POSIX, best-effort on Windows
        fs::rename(&temp_path, &self.path).with_context(|| {
            format!(
                "Failed to rename temp file to state file: {:?} -> {:?}",
                temp_path, self.path
            )
        })?;

        tracing::info!(
            tasks = state.tasks.len(),
            path = %self.path.display(),
            "Download state saved"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::types::{TaskState, WorkerHandle};
    use tempfile::TempDir;

    fn sample_tasks() -> (Vec<Task>, Vec<Task>) {
        let mut downloading = Task::new("aaa", "Downloading One", 4096);
        downloading.transition(TaskState::Downloading);
        downloading.worker = Some(WorkerHandle::new(6800, 1234, "run-one-token"));
        downloading.completed_bytes = 1024;
        downloading.seeders = 10;

        let mut stored = Task::new("bbb", "Library Item", 2048);
        stored.state = TaskState::Stored;
        stored.completed_bytes = 2048;

        (vec![downloading, Task::new("ccc", "Pending", 1)], vec![stored])
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let state = StateFile::new(dir.path().join("nested").join(".downloading.json"));
        assert!(state.load().unwrap().is_empty());
    }

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let state = StateFile::new(dir.path().join(".downloading.json"));
        let (active, stored) = sample_tasks();

        state.save(&active, &stored).unwrap();
        let loaded = state.load().unwrap();

        let mut expected = active.clone();
        expected.extend(stored);
        assert_eq!(loaded, expected);
        // The launch token survives so the worker can still be queried
        assert_eq!(loaded[0].worker.as_ref().unwrap().secret, "run-one-token");
    }

    #[test]
    fn test_handle_without_saved_token_loads() {
        let json = r#"{"version":1,"last_saved":"2025-01-01T00:00:00Z","tasks":[
            {"content_id":"aaa","display_name":"x","total_bytes":1,"state":"Downloading",
             "worker":{"port":6800,"group_id":1234},
             "created_at":"2025-01-01T00:00:00Z","updated_at":"2025-01-01T00:00:00Z"}]}"#;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".downloading.json");
        fs::write(&path, json).unwrap();

        let tasks = StateFile::new(&path).load().unwrap();
        assert_eq!(tasks[0].worker, Some(WorkerHandle::new(6800, 1234, "")));
    }

    #[test]
    fn test_save_replaces_previous_state_and_cleans_temp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".downloading.json");
        let state = StateFile::new(&path);
        let (active, stored) = sample_tasks();

        state.save(&active, &stored).unwrap();
        state.save(&[], &stored).unwrap();

        assert_eq!(state.load().unwrap().len(), 1);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".downloading.json");
        fs::write(&path, "{ not json").unwrap();

        let err = StateFile::new(&path).load().unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse state file"));
    }

    #[test]
    fn test_volatile_poll_counter_is_not_persisted() {
        let dir = TempDir::new().unwrap();
        let state = StateFile::new(dir.path().join(".downloading.json"));
        let (mut active, _) = sample_tasks();
        active[0].poll_failures = 4;

        state.save(&active, &[]).unwrap();
        assert_eq!(state.load().unwrap()[0].poll_failures, 0);
    }

    #[test]
    fn test_save_times_out_while_locked_and_keeps_old_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".downloading.json");
        let state = StateFile::new(&path).with_lock_timeout(Duration::from_millis(100));
        let (active, stored) = sample_tasks();
        state.save(&active, &stored).unwrap();

        let _held = StateFile::acquire_exclusive_lock_with_timeout(
            &path.with_extension("lock"),
            Duration::from_secs(1),
        )
        .unwrap();

        let err = state.save(&[], &[]).unwrap_err();
        assert!(err.to_string().contains("Timed out"), "{err}");
        assert_eq!(state.load_unlocked_for_test().len(), 3);
    }

    #[test]
    fn test_exclusive_lock_blocks_second_writer() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("state.lock");
        let acquire = |timeout| StateFile::acquire_exclusive_lock_with_timeout(&lock_path, timeout);

        let first = acquire(Duration::from_secs(1));
        assert!(first.is_ok());
        let second = acquire(Duration::from_millis(100));
        assert!(second.is_err());

        drop(first);
        let third = acquire(Duration::from_secs(1));
        assert!(third.is_ok());
    }

    #[test]
    fn test_load_waits_for_writer_then_times_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".downloading.json");
        let state = StateFile::new(&path).with_lock_timeout(Duration::from_millis(100));
        let (active, stored) = sample_tasks();
        state.save(&active, &stored).unwrap();

        let held = StateFile::acquire_exclusive_lock_with_timeout(
            &path.with_extension("lock"),
            Duration::from_secs(1),
        )
        .unwrap();
        let err = state.load().unwrap_err();
        assert!(err.to_string().contains("Timed out waiting for shared lock"), "{err}");

        drop(held);
        assert_eq!(state.load().unwrap().len(), 3);
    }

    #[test]
    fn test_readers_share_the_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".downloading.json");
        let state = StateFile::new(&path).with_lock_timeout(Duration::from_millis(100));
        let (active, stored) = sample_tasks();
        state.save(&active, &stored).unwrap();

        let reader = File::open(path.with_extension("lock")).unwrap();
        StateFile::acquire_shared_lock_with_timeout(&reader, Duration::from_millis(100)).unwrap();

        assert_eq!(state.load().unwrap().len(), 3);
        // A writer still has to wait for the reader
        assert!(state.save(&[], &[]).is_err());
    }

    impl StateFile {
        /// Read the document without taking the shared lock.
        fn load_unlocked_for_test(&self) -> Vec<Task> {
            let content = fs::read_to_string(&self.path).unwrap();
            serde_json::from_str::<SavedState>(&content).unwrap().tasks
        }
    }
}
