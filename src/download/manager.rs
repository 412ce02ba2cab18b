// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download manager: the single entry point the UI talks to.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use super::lifecycle::{dedupe_on_load, LifecycleController};
use super::poller::ProgressPoller;
use super::state::StateFile;
use super::store::TaskStore;
use super::supervisor::{PortAllocator, ProcessSupervisor};
use super::types::Task;
use crate::config::Config;
use crate::error::state_load_report;
use crate::rpc::{Aria2Client, WorkerControl};
use crate::search::SearchResult;

/// Capacity of the command channel.
const COMMAND_BUFFER: usize = 100;

/// Capacity of the event channel; slow subscribers lose the oldest events.
const EVENT_BUFFER: usize = 64;

/// Commands that can be sent to the command loop.
#[derive(Debug)]
pub enum DownloadCommand {
    /// Track a candidate and start its worker
    Download(SearchResult),
    /// Relaunch a task left pending by a failed launch
    Retry { content_id: String },
    /// Stop an active task and delete its files
    Cancel { content_id: String },
    /// Delete a library item and its files
    RemoveFromLibrary { content_id: String },
    /// Stop the command loop
    Shutdown,
}

/// Things the UI may want to tell the user about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    Launched {
        content_id: String,
        display_name: String,
    },
    LaunchFailed {
        content_id: String,
        display_name: String,
        error: String,
    },
    /// Promoted into the library
    Stored { content_id: String },
    /// Worker unreachable for too long
    Failed { content_id: String },
}

/// Point-in-time report of every task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadView {
    pub active: Vec<Task>,
    pub stored: Vec<Task>,
}

/// Owns the task store and the background loops driving it.
pub struct DownloadManager {
    command_tx: mpsc::Sender<DownloadCommand>,
    store: TaskStore,
    state_file: StateFile,
    events: broadcast::Sender<DownloadEvent>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    load_warning: Option<String>,
}

impl DownloadManager {
    /// Restore saved state and start polling, talking to aria2 workers.
    pub async fn start(config: Arc<Config>) -> Self {
        let control = Arc::new(Aria2Client::new().with_timeout(config.request_timeout()));
        Self::start_with(config, control, None).await
    }

    /// Start with an explicit worker control and, optionally, port source.
    pub async fn start_with(
        config: Arc<Config>,
        control: Arc<dyn WorkerControl>,
        ports: Option<Arc<dyn PortAllocator>>,
    ) -> Self {
        let state_file = StateFile::new(config.state_path());

        let loader = state_file.clone();
        let loaded = tokio::task::spawn_blocking(move || loader.load())
            .await
            .context("State loader panicked")
            .and_then(|result| result);

        let (tasks, load_warning) = match loaded {
            Ok(tasks) => (tasks, None),
            Err(e) => {
                tracing::error!("Failed to load download state: {:#}", e);
                (Vec::new(), Some(state_load_report(state_file.path(), &e)))
            }
        };

        let (active, stored) = dedupe_on_load(tasks);
        tracing::info!(active = active.len(), stored = stored.len(), "Restored tasks");
        let store = TaskStore::with_tasks(active, stored);

        let mut supervisor = ProcessSupervisor::new(store.clone(), Arc::clone(&config));
        if let Some(ports) = ports {
            supervisor = supervisor.with_port_allocator(ports);
        }
        let lifecycle = LifecycleController::new(store.clone(), supervisor, Arc::clone(&config));

        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let poller = ProgressPoller::new(store.clone(), control, &config);
        let sweeper = lifecycle.clone();
        let poll_events = events.clone();
        let poll_loop = tokio::spawn(poller.run(shutdown_rx, move |summary| {
            for content_id in &summary.marked_failed {
                let _ = poll_events.send(DownloadEvent::Failed {
                    content_id: content_id.clone(),
                });
            }
            for content_id in sweeper.sweep_completed() {
                let _ = poll_events.send(DownloadEvent::Stored { content_id });
            }
        }));

        let loop_events = events.clone();
        let command_loop = tokio::spawn(async move {
            Self::command_loop(command_rx, lifecycle, loop_events).await;
        });

        Self {
            command_tx,
            store,
            state_file,
            events,
            shutdown_tx,
            workers: Mutex::new(vec![poll_loop, command_loop]),
            load_warning,
        }
    }

    /// User-facing report if saved state could not be restored.
    pub fn load_warning(&self) -> Option<&str> {
        self.load_warning.as_deref()
    }

    /// Subscribe to download events.
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events.subscribe()
    }

    /// Consistent snapshot of both collections.
    pub fn view(&self) -> DownloadView {
        let (active, stored) = self.store.snapshot();
        DownloadView { active, stored }
    }

    pub async fn request_download(&self, candidate: SearchResult) -> Result<()> {
        self.send(DownloadCommand::Download(candidate)).await
    }

    pub async fn request_retry(&self, content_id: impl Into<String>) -> Result<()> {
        self.send(DownloadCommand::Retry { content_id: content_id.into() }).await
    }

    pub async fn request_cancel(&self, content_id: impl Into<String>) -> Result<()> {
        self.send(DownloadCommand::Cancel { content_id: content_id.into() }).await
    }

    pub async fn request_library_remove(&self, content_id: impl Into<String>) -> Result<()> {
        self.send(DownloadCommand::RemoveFromLibrary { content_id: content_id.into() }).await
    }

    async fn send(&self, command: DownloadCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .context("Download manager is shut down")
    }

    /// Stop the background loops and save state.
    ///
    /// Workers keep running; their tasks are restored as downloading on the
    /// next start. Commands already queued are processed first.
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.command_tx.send(DownloadCommand::Shutdown).await;
        let _ = self.shutdown_tx.send(true);

        let workers = {
            let mut guard = self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *guard)
        };
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!("Background loop ended abnormally: {}", e);
            }
        }

        let (active, stored) = self.store.snapshot();
        let state_file = self.state_file.clone();
        tokio::task::spawn_blocking(move || state_file.save(&active, &stored))
            .await
            .context("State writer panicked")??;
        Ok(())
    }

    /// Path of the state file, for reports.
    pub fn state_path(&self) -> &std::path::Path {
        self.state_file.path()
    }

    /// Process commands one at a time until shutdown.
    async fn command_loop(
        mut command_rx: mpsc::Receiver<DownloadCommand>,
        lifecycle: LifecycleController,
        events: broadcast::Sender<DownloadEvent>,
    ) {
        while let Some(cmd) = command_rx.recv().await {
            match cmd {
                DownloadCommand::Download(candidate) => {
                    let outcome = lifecycle.enqueue(&candidate).await;
                    Self::report_launch(
                        &events,
                        &candidate.content_id,
                        &candidate.display_name,
                        outcome,
                    );
                }
                DownloadCommand::Retry { content_id } => {
                    let outcome = lifecycle.retry(&content_id).await;
                    let display_name = lifecycle
                        .display_name(&content_id)
                        .unwrap_or_else(|| content_id.clone());
                    Self::report_launch(&events, &content_id, &display_name, outcome);
                }
                DownloadCommand::Cancel { content_id } => {
                    lifecycle.cancel(&content_id).await;
                }
                DownloadCommand::RemoveFromLibrary { content_id } => {
                    lifecycle.remove_from_library(&content_id).await;
                }
                DownloadCommand::Shutdown => break,
            }
        }
        tracing::debug!("Command loop stopped");
    }

    fn report_launch<T, E: std::fmt::Display>(
        events: &broadcast::Sender<DownloadEvent>,
        content_id: &str,
        display_name: &str,
        outcome: Result<T, E>,
    ) {
        let event = match outcome {
            Ok(_) => DownloadEvent::Launched {
                content_id: content_id.to_string(),
                display_name: display_name.to_string(),
            },
            Err(e) => {
                tracing::error!(content_id, "Launch failed: {}", e);
                DownloadEvent::LaunchFailed {
                    content_id: content_id.to_string(),
                    display_name: display_name.to_string(),
                    error: e.to_string(),
                }
            }
        };
        let _ = events.send(event);
    }
}
