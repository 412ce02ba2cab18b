// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Periodic progress polling.
//!
//! Every tick the poller asks each downloading task's worker for its status,
//! one tokio task per worker, and joins the whole round before the next tick.
//! A slow worker only delays its own query, bounded by the request timeout.
//! Failed queries never touch the last known progress; they only feed the
//! task's failure streak.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use super::store::{PollFailure, TaskStore};
use super::types::TaskState;
use crate::config::Config;
use crate::rpc::{primary_status, WorkerControl};

/// What one polling round did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundSummary {
    /// Workers queried
    pub polled: usize,
    /// Tasks whose progress was refreshed
    pub updated: usize,
    /// Queries that failed or timed out
    pub failed: usize,
    /// Tasks that reached `Complete` in this round
    pub completed: Vec<String>,
    /// Tasks failed for being unreachable too long
    pub marked_failed: Vec<String>,
}

/// Queries workers and folds their reports into the store.
#[derive(Clone)]
pub struct ProgressPoller {
    store: TaskStore,
    control: Arc<dyn WorkerControl>,
    interval: Duration,
    request_timeout: Duration,
    max_poll_failures: u32,
}

impl ProgressPoller {
    pub fn new(store: TaskStore, control: Arc<dyn WorkerControl>, config: &Config) -> Self {
        Self {
            store,
            control,
            interval: config.poll_interval(),
            request_timeout: config.request_timeout(),
            max_poll_failures: config.max_poll_failures,
        }
    }

    /// Override the tick interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run a single round over every `Downloading` task.
    pub async fn poll_round(&self) -> RoundSummary {
        let mut targets = Vec::new();
        let mut orphans = Vec::new();
        self.store.for_each_active(|task| {
            if task.state != TaskState::Downloading {
                return;
            }
            match &task.worker {
                Some(handle) => {
                    targets.push((task.content_id.clone(), handle.port, handle.secret.clone()))
                }
                None => orphans.push(task.content_id.clone()),
            }
        });

        let mut summary = RoundSummary {
            polled: targets.len(),
            ..Default::default()
        };

        for content_id in orphans {
            tracing::warn!(content_id = %content_id, "Downloading task has no worker");
            self.count_failure(&content_id, &mut summary);
        }

        let mut queries = JoinSet::new();
        for (content_id, port, secret) in targets {
            let control = Arc::clone(&self.control);
            let timeout = self.request_timeout;
            queries.spawn(async move {
                let query = control.query_active(port, &secret);
                let outcome = tokio::time::timeout(timeout, query).await;
                (content_id, port, outcome)
            });
        }

        while let Some(joined) = queries.join_next().await {
            let (content_id, port, outcome) = match joined {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!("Poll task panicked: {}", e);
                    summary.failed += 1;
                    continue;
                }
            };

            match outcome {
                Ok(Ok(entries)) => {
                    let Some(status) = primary_status(entries) else {
                        // Reachable but idle, e.g. between metadata and payload
                        tracing::debug!(
                            content_id = %content_id,
                            port,
                            "Worker reports no active transfer"
                        );
                        continue;
                    };
                    match self.store.apply_progress(&content_id, &status) {
                        Some(TaskState::Complete) => {
                            tracing::info!(content_id = %content_id, "Download complete");
                            summary.updated += 1;
                            summary.completed.push(content_id);
                        }
                        Some(_) => summary.updated += 1,
                        // Cancelled while the query was in flight
                        None => {}
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(content_id = %content_id, port, "Status query failed: {}", e);
                    summary.failed += 1;
                    self.count_failure(&content_id, &mut summary);
                }
                Err(_) => {
                    tracing::warn!(
                        content_id = %content_id,
                        port,
                        timeout = ?self.request_timeout,
                        "Status query timed out"
                    );
                    summary.failed += 1;
                    self.count_failure(&content_id, &mut summary);
                }
            }
        }

        summary
    }

    fn count_failure(&self, content_id: &str, summary: &mut RoundSummary) {
        match self.store.record_poll_failure(content_id, self.max_poll_failures) {
            PollFailure::MarkedFailed => {
                tracing::error!(
                    content_id,
                    limit = self.max_poll_failures,
                    "Worker unreachable too long, marking download failed"
                );
                summary.marked_failed.push(content_id.to_string());
            }
            PollFailure::Counted(streak) => {
                tracing::debug!(content_id, streak, "Poll failure recorded");
            }
            PollFailure::Ignored => {}
        }
    }

    /// Poll on a fixed cadence until `shutdown` flips to `true`.
    ///
    /// `after_round` runs after every round, which is where completed tasks
    /// get promoted.
    pub async fn run<F>(self, mut shutdown: watch::Receiver<bool>, mut after_round: F)
    where
        F: FnMut(&RoundSummary) + Send,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(interval = ?self.interval, "Progress poller started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let summary = self.poll_round().await;
                    if summary.polled > 0 {
                        tracing::debug!(
                            polled = summary.polled,
                            updated = summary.updated,
                            failed = summary.failed,
                            "Poll round finished"
                        );
                    }
                    after_round(&summary);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Progress poller stopped");
    }
}
