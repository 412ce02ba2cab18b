// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Task types and the download state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::search::SearchResult;
use crate::utils::mask_secret;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * 1024 * 1024;

/// Lifecycle state of a task.
///
/// ```text
/// Pending ──launch──▶ Downloading ──poll/exit 0──▶ Complete ──sweep──▶ Stored
///                         │
///                         └──exit ≠ 0 / unreachable──▶ Failed
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Marked for download, no worker yet
    Pending,
    /// Worker running and being polled
    Downloading,
    /// All bytes transferred, waiting to be moved to the library
    Complete,
    /// Worker exited with an error or stopped answering
    Failed,
    /// In the library
    Stored,
}

impl TaskState {
    /// Whether `self -> next` is an edge of the state machine.
    ///
    /// Staying in the same state is not a transition.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Downloading)
                | (Downloading, Complete)
                | (Downloading, Failed)
                | (Complete, Stored)
        )
    }

    /// Terminal states only leave the registry by explicit user removal.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Failed | TaskState::Stored)
    }

    pub fn label(self) -> &'static str {
        match self {
            TaskState::Pending => "Pending",
            TaskState::Downloading => "Downloading",
            TaskState::Complete => "Complete",
            TaskState::Failed => "Failed",
            TaskState::Stored => "Stored",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Control endpoint and process group of a launched worker.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerHandle {
    /// Loopback port the worker's RPC interface listens on
    pub port: u16,
    /// Process group id; signaling it reaches the worker and its children
    pub group_id: u32,
    /// RPC token the worker was started with. Saved with the task so a
    /// worker that outlives this process can still be polled after restart.
    #[serde(default)]
    pub secret: String,
}

impl WorkerHandle {
    pub fn new(port: u16, group_id: u32, secret: impl Into<String>) -> Self {
        Self {
            port,
            group_id,
            secret: secret.into(),
        }
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("port", &self.port)
            .field("group_id", &self.group_id)
            .field("secret", &mask_secret(&self.secret, 4))
            .finish()
    }
}

/// One entry of a worker's status report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStatus {
    /// Worker's own status word (`active`, `waiting`, `complete`, ...)
    pub status: String,
    pub total_bytes: u64,
    pub completed_bytes: u64,
    pub rate_bytes_per_sec: u64,
}

/// A tracked download or library item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Info-hash; unique across active and stored collections
    pub content_id: String,
    pub display_name: String,
    /// Advertised size from the search index
    pub total_bytes: u64,
    #[serde(default)]
    pub completed_bytes: u64,
    #[serde(default)]
    pub rate_bytes_per_sec: u64,
    pub state: TaskState,
    #[serde(default)]
    pub worker: Option<WorkerHandle>,
    #[serde(default)]
    pub worker_status: Option<String>,
    #[serde(default)]
    pub seeders: u32,
    #[serde(default)]
    pub leechers: u32,
    #[serde(default)]
    pub file_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Consecutive failed polls; volatile
    #[serde(skip)]
    pub poll_failures: u32,
}

impl Task {
    /// Create a pending task.
    pub fn new(
        content_id: impl Into<String>,
        display_name: impl Into<String>,
        total_bytes: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            content_id: content_id.into(),
            display_name: display_name.into(),
            total_bytes,
            completed_bytes: 0,
            rate_bytes_per_sec: 0,
            state: TaskState::Pending,
            worker: None,
            worker_status: None,
            seeders: 0,
            leechers: 0,
            file_count: 0,
            created_at: now,
            updated_at: now,
            poll_failures: 0,
        }
    }

    /// Create a pending task from a search result.
    pub fn from_candidate(candidate: &SearchResult) -> Self {
        let mut task =
            Self::new(&candidate.content_id, &candidate.display_name, candidate.total_bytes);
        task.seeders = candidate.seeders;
        task.leechers = candidate.leechers;
        task.file_count = candidate.file_count;
        task
    }

    /// Move to `next` if the state machine allows it.
    pub fn transition(&mut self, next: TaskState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        self.updated_at = Utc::now();
        true
    }

    /// Merge a successful poll result.
    ///
    /// Only applies while downloading; a report arriving after the task
    /// already reached another state is dropped. Returns `true` when this
    /// report completed the download.
    pub fn apply_progress(&mut self, report: &WorkerStatus) -> bool {
        if self.state != TaskState::Downloading {
            return false;
        }
        self.completed_bytes = report.completed_bytes;
        self.rate_bytes_per_sec = report.rate_bytes_per_sec;
        self.worker_status = Some(report.status.clone());
        self.poll_failures = 0;
        self.updated_at = Utc::now();

        if self.total_bytes > 0 && self.completed_bytes >= self.total_bytes {
            return self.transition(TaskState::Complete);
        }
        false
    }

    pub fn total_size(&self) -> String {
        format_size(self.total_bytes)
    }

    pub fn completed_size(&self) -> String {
        format_size(self.completed_bytes)
    }

    pub fn transfer_rate(&self) -> String {
        format_speed(self.rate_bytes_per_sec)
    }

    /// Percentage of the advertised size transferred so far.
    pub fn progress_percent(&self) -> Option<f64> {
        match self.state {
            TaskState::Complete | TaskState::Stored => Some(100.0),
            _ if self.total_bytes == 0 => None,
            _ => Some((self.completed_bytes as f64 / self.total_bytes as f64 * 100.0).min(100.0)),
        }
    }

    /// Seconds until completion at the current rate.
    pub fn eta_seconds(&self) -> Option<u64> {
        if self.state != TaskState::Downloading || self.rate_bytes_per_sec == 0 {
            return None;
        }
        let remaining = self.total_bytes.saturating_sub(self.completed_bytes);
        Some(remaining.div_ceil(self.rate_bytes_per_sec))
    }

    pub fn eta_string(&self) -> Option<String> {
        self.eta_seconds().map(|secs| {
            if secs >= 3600 {
                format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
            } else if secs >= 60 {
                format!("{}m {}s", secs / 60, secs % 60)
            } else {
                format!("{}s", secs)
            }
        })
    }
}

/// Human-readable size: KB below 1 MiB, MB below 1 GiB, GB above.
pub fn format_size(bytes: u64) -> String {
    if bytes < MIB {
        format!("{:.2} KB", bytes as f64 / KIB as f64)
    } else if bytes < GIB {
        format!("{:.2} MB", bytes as f64 / MIB as f64)
    } else {
        format!("{:.2} GB", bytes as f64 / GIB as f64)
    }
}

/// Human-readable transfer rate.
pub fn format_speed(bytes_per_sec: u64) -> String {
    if bytes_per_sec < KIB {
        format!("{} B/s", bytes_per_sec)
    } else if bytes_per_sec < MIB {
        format!("{:.2} KB/s", bytes_per_sec as f64 / KIB as f64)
    } else {
        format!("{:.2} MB/s", bytes_per_sec as f64 / MIB as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn downloading(total: u64) -> Task {
        let mut task = Task::new("abc", "Some Title", total);
        assert!(task.transition(TaskState::Downloading));
        task
    }

    fn report(completed: u64, rate: u64) -> WorkerStatus {
        WorkerStatus {
            status: "active".into(),
            total_bytes: 0,
            completed_bytes: completed,
            rate_bytes_per_sec: rate,
        }
    }

    #[test]
    fn test_size_boundaries() {
        assert_eq!(format_size(1024), "1.00 KB");
        assert_eq!(format_size(1_048_576), "1.00 MB");
        assert_eq!(format_size(1_073_741_824), "1.00 GB");
        assert_eq!(format_size(0), "0.00 KB");
        assert_eq!(format_size(2048), "2.00 KB");
    }

    #[test]
    fn test_speed_formatting() {
        assert_eq!(format_speed(512), "512 B/s");
        assert_eq!(format_speed(1536), "1.50 KB/s");
        assert_eq!(format_speed(3 * 1_048_576), "3.00 MB/s");
    }

    #[test]
    fn test_only_listed_edges_are_allowed() {
        use TaskState::*;
        let all = [Pending, Downloading, Complete, Failed, Stored];
        let allowed = [
            (Pending, Downloading),
            (Downloading, Complete),
            (Downloading, Failed),
            (Complete, Stored),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
        assert!(!Pending.can_transition_to(Stored));
    }

    #[test]
    fn test_partial_then_full_progress() {
        let mut task = downloading(2048);

        assert!(!task.apply_progress(&report(1024, 300)));
        assert_eq!(task.state, TaskState::Downloading);
        assert_eq!(task.completed_size(), "1.00 KB");
        assert_eq!(task.transfer_rate(), "300 B/s");

        assert!(task.apply_progress(&report(2048, 0)));
        assert_eq!(task.state, TaskState::Complete);
        assert_eq!(task.completed_size(), task.total_size());
    }

    #[test]
    fn test_progress_ignored_outside_downloading() {
        let mut task = Task::new("abc", "x", 100);
        assert!(!task.apply_progress(&report(100, 1)));
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.completed_bytes, 0);
    }

    #[test]
    fn test_unknown_total_never_completes() {
        let mut task = downloading(0);
        assert!(!task.apply_progress(&report(0, 0)));
        assert_eq!(task.state, TaskState::Downloading);
    }

    #[test]
    fn test_successful_poll_resets_failure_streak() {
        let mut task = downloading(10);
        task.poll_failures = 3;
        task.apply_progress(&report(1, 1));
        assert_eq!(task.poll_failures, 0);
    }

    #[test]
    fn test_eta() {
        let mut task = downloading(10 * 1024);
        task.apply_progress(&report(4 * 1024, 1024));
        assert_eq!(task.eta_seconds(), Some(6));
        assert_eq!(task.eta_string().as_deref(), Some("6s"));

        task.apply_progress(&report(4 * 1024, 0));
        assert_eq!(task.eta_seconds(), None);
    }

    #[test]
    fn test_from_candidate_copies_metadata() {
        let candidate = SearchResult {
            content_id: "hash".into(),
            display_name: "Name".into(),
            total_bytes: 42,
            seeders: 7,
            leechers: 3,
            file_count: 2,
        };
        let task = Task::from_candidate(&candidate);
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!((task.seeders, task.leechers, task.file_count), (7, 3, 2));
        assert!(task.worker.is_none());
    }

    #[test]
    fn test_worker_handle_debug_masks_token() {
        let handle = WorkerHandle::new(6800, 1234, "0123456789abcdef");
        let printed = format!("{:?}", handle);
        assert!(printed.contains("6800"));
        assert!(printed.contains("0123..."));
        assert!(!printed.contains("0123456789abcdef"));
    }
}
