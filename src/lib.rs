// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! sailor - torrent search and download library
//!
//! Search an index, hand each chosen item to its own aria2 worker, watch
//! progress, and keep finished items in a library that survives restarts.
//!
//! # Core Modules
//!
//! - [`download`] - Task store, worker supervision, polling, lifecycle, persistence
//! - [`rpc`] - aria2 JSON-RPC status queries
//! - [`search`] - Torrent index client
//! - [`config`] - User configuration (`~/.sailor/config.json`)
//! - [`error`] - Consistent error formatting utilities

pub mod config;
pub mod download;
pub mod error;
pub mod locks;
pub mod rpc;
pub mod search;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use download::{
    DownloadEvent, DownloadManager, DownloadView, LaunchError, Task, TaskState, TaskStore,
};
pub use error::{format_error, ErrorBuilder};
pub use rpc::{Aria2Client, RpcError, WorkerControl};
pub use search::{ApiBayClient, SearchError, SearchProvider, SearchResult};
pub use utils::{fit_to_width, mask_secret, sanitize_dir_name, truncate_to_width};
