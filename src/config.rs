// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Process-wide configuration.
//!
//! Loaded once at startup from `~/.sailor/config.json` (every field is
//! optional), completed with a freshly generated RPC secret, and then shared
//! read-only as `Arc<Config>`.

use anyhow::{Context, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::sanitize_dir_name;

/// Name of the state file inside the download directory.
pub const STATE_FILE_NAME: &str = ".downloading.json";

/// Content id characters appended to a task directory name.
const TASK_DIR_ID_CHARS: usize = 8;

/// Trackers appended to every magnet link.
pub const DEFAULT_TRACKERS: &[&str] = &[
    "udp://tracker.openbittorrent.com:80",
    "udp://tracker.opentrackr.org:1337/announce",
    "udp://9.rarbg.to:2920/announce",
    "udp://tracker.internetwarriors.net:1337/announce",
    "udp://tracker.leechers-paradise.org:6969",
    "udp://tracker.coppersurfer.tk:6969/announce",
    "udp://exodus.desync.com:6969",
    "udp://open.stealth.si:80/announce",
    "udp://tracker.tiny-vps.com:6969/announce",
    "udp://tracker.cyberia.is:6969/announce",
    "udp://tracker.moeking.me:6969/announce",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory; every task downloads into its own subdirectory.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Persisted task list. Defaults to `<download_dir>/.downloading.json`.
    #[serde(default)]
    pub state_file: Option<PathBuf>,
    /// Downloader executable (aria2c-compatible command line and RPC).
    #[serde(default = "default_downloader")]
    pub downloader: PathBuf,
    #[serde(default = "default_trackers")]
    pub trackers: Vec<String>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Timeout for a single worker status query.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Consecutive failed polls after which a downloading task is failed.
    #[serde(default = "default_max_poll_failures")]
    pub max_poll_failures: u32,
    #[serde(default = "default_search_url")]
    pub search_url: String,
    #[serde(default = "default_search_timeout_secs")]
    pub search_timeout_secs: u64,
    /// RPC token for workers launched by this run. Generated per run and
    /// not part of the config file; each task's worker handle keeps its own.
    #[serde(skip)]
    pub rpc_secret: String,
}

fn default_download_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join("Downloads").join("Sailor"))
        .unwrap_or_else(|| PathBuf::from("Sailor"))
}

fn default_downloader() -> PathBuf {
    PathBuf::from("aria2c")
}

fn default_trackers() -> Vec<String> {
    DEFAULT_TRACKERS.iter().map(|t| t.to_string()).collect()
}

fn default_poll_interval_secs() -> u64 {
    3
}

fn default_request_timeout_secs() -> u64 {
    5
}

fn default_max_poll_failures() -> u32 {
    5
}

fn default_search_url() -> String {
    "https://apibay.org/q.php".to_string()
}

fn default_search_timeout_secs() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            state_file: None,
            downloader: default_downloader(),
            trackers: default_trackers(),
            poll_interval_secs: default_poll_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            max_poll_failures: default_max_poll_failures(),
            search_url: default_search_url(),
            search_timeout_secs: default_search_timeout_secs(),
            rpc_secret: generate_secret(),
        }
    }
}

impl Config {
    /// Load `~/.sailor/config.json`, falling back to defaults when absent.
    pub fn load() -> Result<Self> {
        let path = config_path()?;
        Self::load_from(&path)
    }

    /// Load configuration from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config: Config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {:?}", path))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config file {:?}", path))?
        } else {
            Config::default()
        };

        config.rpc_secret = generate_secret();
        if config.poll_interval_secs == 0 {
            tracing::warn!("poll_interval_secs = 0 is not allowed, using 1");
            config.poll_interval_secs = 1;
        }
        Ok(config)
    }

    /// Configuration rooted at `dir`, used by tests and `--download-dir`.
    pub fn with_download_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: dir.into(),
            ..Self::default()
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| self.download_dir.join(STATE_FILE_NAME))
    }

    /// Output directory for a task.
    ///
    /// The sanitized title is suffixed with the start of the content id, so
    /// tasks with equal or equally-sanitized titles never share a directory.
    pub fn task_dir(&self, display_name: &str, content_id: &str) -> PathBuf {
        let id_prefix: String = content_id.chars().take(TASK_DIR_ID_CHARS).collect();
        let name = format!("{}-{}", sanitize_dir_name(display_name), id_prefix);
        self.download_dir.join(sanitize_dir_name(&name))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_secs)
    }
}

fn config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    Ok(home.join(".sailor").join("config.json"))
}

/// 128-bit random secret, hex encoded.
fn generate_secret() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
