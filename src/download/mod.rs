// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download lifecycle for sailor
//!
//! Every download is a task moving through
//! `Pending -> Downloading -> Complete | Failed`, with completed tasks
//! promoted into the library (`Stored`). Each task gets its own aria2
//! worker process, polled over JSON-RPC on a fixed cadence.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │ DownloadManager │────▶│ Lifecycle       │────▶│ Process         │
//! │ (command loop)  │     │ Controller      │     │ Supervisor      │
//! └────────┬────────┘     └────────┬────────┘     └────────┬────────┘
//!          │                       │                       │
//!          ▼                       ▼                       ▼
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │ StateFile       │     │ TaskStore       │◀────│ Progress Poller │
//! │ (persistent)    │     │ (shared)        │     │ (aria2 RPC)     │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sailor::config::Config;
//! use sailor::download::DownloadManager;
//! use sailor::search::SearchResult;
//!
//! # async fn example(candidate: SearchResult) -> anyhow::Result<()> {
//! let config = Arc::new(Config::load()?);
//! let manager = DownloadManager::start(config).await;
//!
//! manager.request_download(candidate).await?;
//!
//! for task in manager.view().active {
//!     println!("{} {}", task.display_name, task.state);
//! }
//!
//! // Saves state; workers keep running
//! manager.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod types;
pub mod store;
pub mod supervisor;
pub mod poller;
pub mod lifecycle;
pub mod state;
pub mod manager;

// Re-export commonly used items
pub use types::{format_size, format_speed, Task, TaskState, WorkerHandle, WorkerStatus};
pub use store::{Collection, PollFailure, TaskStore};
pub use supervisor::{LaunchError, LoopbackPorts, PortAllocator, ProcessSupervisor};
pub use poller::{ProgressPoller, RoundSummary};
pub use lifecycle::{dedupe_on_load, LifecycleController};
pub use state::StateFile;
pub use manager::{DownloadCommand, DownloadEvent, DownloadManager, DownloadView};
