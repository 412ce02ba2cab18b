// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Worker process supervision.
//!
//! One downloader process per task, each with its own RPC port, output
//! directory and process group. The group id is what cancellation signals,
//! so everything the worker forks dies with it.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use thiserror::Error;
use tokio::process::{Child, Command};

use super::store::{Collection, TaskStore};
use super::types::{TaskState, WorkerHandle};
use crate::config::Config;

/// Why a launch did not happen. The task stays `Pending` in every case.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("no free local port for the worker: {0}")]
    PortAllocation(#[source] io::Error),
    #[error("cannot create download directory {path:?}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot start {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("task {content_id} is not pending (state: {state:?})")]
    NotPending {
        content_id: String,
        state: Option<TaskState>,
    },
    #[error("task {0} is already tracked")]
    AlreadyTracked(String),
}

/// Source of free local ports for worker RPC endpoints.
pub trait PortAllocator: Send + Sync {
    fn allocate(&self) -> io::Result<u16>;
}

/// Asks the OS for an ephemeral loopback port.
///
/// The port is released again before the worker binds it, so another
/// process could grab it in between; the worker then fails to start its RPC
/// server and the poller eventually fails the task.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackPorts;

impl PortAllocator for LoopbackPorts {
    fn allocate(&self) -> io::Result<u16> {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
        Ok(listener.local_addr()?.port())
    }
}

/// Build a magnet link for `content_id` announcing to `trackers`.
pub fn magnet_link(content_id: &str, display_name: &str, trackers: &[String]) -> String {
    let mut magnet = format!(
        "magnet:?xt=urn:btih:{}&dn={}",
        content_id,
        urlencoding::encode(display_name)
    );
    for tracker in trackers {
        magnet.push_str("&tr=");
        magnet.push_str(&urlencoding::encode(tracker));
    }
    magnet
}

/// aria2c command line for one worker.
///
/// `--seed-time=0` makes the worker exit once the payload is complete so the
/// exit watcher sees a clean exit.
fn worker_args(port: u16, secret: &str, dir: &Path, magnet: &str) -> Vec<String> {
    vec![
        "--enable-rpc=true".to_string(),
        format!("--rpc-listen-port={}", port),
        format!("--rpc-secret={}", secret),
        "--seed-time=0".to_string(),
        format!("--dir={}", dir.display()),
        magnet.to_string(),
    ]
}

/// Starts and watches worker processes.
#[derive(Clone)]
pub struct ProcessSupervisor {
    store: TaskStore,
    config: Arc<Config>,
    ports: Arc<dyn PortAllocator>,
}

impl ProcessSupervisor {
    pub fn new(store: TaskStore, config: Arc<Config>) -> Self {
        Self {
            store,
            config,
            ports: Arc::new(LoopbackPorts),
        }
    }

    pub fn with_port_allocator(mut self, ports: Arc<dyn PortAllocator>) -> Self {
        self.ports = ports;
        self
    }

    /// Launch the worker for a pending task.
    ///
    /// On success the task holds its worker handle and is `Downloading`,
    /// and an exit watcher is running. On failure nothing about the task
    /// changed.
    pub async fn launch(&self, content_id: &str) -> Result<WorkerHandle, LaunchError> {
        let task = match (self.store.locate(content_id), self.store.get(content_id)) {
            (Some(Collection::Active), Some(task)) if task.state == TaskState::Pending => task,
            (_, task) => {
                return Err(LaunchError::NotPending {
                    content_id: content_id.to_string(),
                    state: task.map(|t| t.state),
                })
            }
        };

        let port = self.ports.allocate().map_err(LaunchError::PortAllocation)?;

        let dir = self.config.task_dir(&task.display_name, &task.content_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| LaunchError::Directory {
                path: dir.clone(),
                source,
            })?;

        let magnet = magnet_link(&task.content_id, &task.display_name, &self.config.trackers);
        let mut cmd = Command::new(&self.config.downloader);
        cmd.args(worker_args(port, &self.config.rpc_secret, &dir, &magnet))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        cmd.process_group(0);

        tracing::info!(
            content_id,
            port,
            dir = %dir.display(),
            program = %self.config.downloader.display(),
            "Starting worker"
        );

        let spawn_error = |source: io::Error| LaunchError::Spawn {
            program: self.config.downloader.clone(),
            source,
        };
        let child = cmd.spawn().map_err(spawn_error)?;
        let Some(pid) = child.id() else {
            return Err(spawn_error(io::Error::other("worker exited before its pid was read")));
        };

        // process_group(0) makes the child the leader of a new group
        let handle = WorkerHandle::new(port, pid, self.config.rpc_secret.as_str());

        if !self.store.mark_launched(content_id, handle.clone()) {
            // Cancelled or removed while we were spawning
            tracing::warn!(content_id, pid, "Task changed during launch, stopping new worker");
            if let Err(e) = signal_group(pid).await {
                tracing::warn!(content_id, pid, "Could not stop orphaned worker: {:#}", e);
            }
            reap(child);
            return Err(LaunchError::NotPending {
                content_id: content_id.to_string(),
                state: self.store.get(content_id).map(|t| t.state),
            });
        }

        self.watch_exit(content_id.to_string(), child);
        Ok(handle)
    }

    /// Mark the task `Complete` on a clean exit and `Failed` otherwise.
    ///
    /// Only acts while the task is still `Downloading`; a poll that already
    /// completed it, or a cancel that removed it, wins.
    fn watch_exit(&self, content_id: String, mut child: Child) {
        let store = self.store.clone();
        tokio::spawn(async move {
            let next = match child.wait().await {
                Ok(status) if status.success() => {
                    tracing::info!(content_id = %content_id, "Worker exited cleanly");
                    TaskState::Complete
                }
                Ok(status) => {
                    tracing::warn!(content_id = %content_id, %status, "Worker exited with error");
                    TaskState::Failed
                }
                Err(e) => {
                    tracing::error!(content_id = %content_id, "Failed to wait for worker: {}", e);
                    TaskState::Failed
                }
            };
            if store.transition(&content_id, next) {
                tracing::debug!(
                    content_id = %content_id,
                    state = %next,
                    "Exit watcher updated task"
                );
            }
        });
    }
}

/// Wait for a child in the background so it does not linger as a zombie.
fn reap(mut child: Child) {
    tokio::spawn(async move {
        let _ = child.wait().await;
    });
}

/// Send SIGTERM to every process in group `group_id`.
///
/// Groups 0 and 1 are refused: 0 would address our own group.
#[cfg(unix)]
pub async fn signal_group(group_id: u32) -> Result<()> {
    if group_id <= 1 {
        bail!("Refusing to signal process group {}", group_id);
    }

    let status = Command::new("kill")
        .args(["-TERM", "--", &format!("-{}", group_id)])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .context("Failed to run kill")?;

    if status.success() {
        Ok(())
    } else {
        bail!("Failed to signal process group {} ({})", group_id, status)
    }
}

#[cfg(windows)]
pub async fn signal_group(group_id: u32) -> Result<()> {
    if group_id <= 1 {
        bail!("Refusing to signal process {}", group_id);
    }

    // /T takes the whole child tree with it
    let status = Command::new("taskkill")
        .args(["/F", "/T", "/PID", &group_id.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .context("Failed to run taskkill")?;

    if status.success() {
        Ok(())
    } else {
        bail!("Failed to kill process tree {} ({})", group_id, status)
    }
}
