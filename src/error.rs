// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Consistent user-facing error reports.
//!
//! Component errors are typed (`LaunchError`, `RpcError`, `SearchError`) or
//! carried as `anyhow::Error`; this module turns the ones a user has to act
//! on into a report with possible causes and suggested fixes.

use std::fmt;
use std::path::Path;

/// Formats an error message with title, causes and fixes.
///
/// # Example
///
/// ```
/// use sailor::error::format_error;
///
/// let report = format_error(
///     "Failed to save download state",
///     &["Disk full", "Download directory is read-only"],
///     &["Free some space and quit again"],
/// );
/// assert!(report.contains("Possible causes:"));
/// ```
pub fn format_error(title: &str, causes: &[&str], fixes: &[&str]) -> String {
    let mut output = format!("[✗] {}\n", title);

    if !causes.is_empty() {
        output.push_str("\nPossible causes:\n");
        for cause in causes {
            output.push_str(&format!("  - {}\n", cause));
        }
    }

    if !fixes.is_empty() {
        output.push_str("\nTry these fixes:\n");
        for (i, fix) in fixes.iter().enumerate() {
            output.push_str(&format!("  {}. {}\n", i + 1, fix));
        }
    }

    output
}

/// Builder for constructing formatted error reports.
#[derive(Debug, Clone)]
pub struct ErrorBuilder {
    title: String,
    detail: Option<String>,
    causes: Vec<String>,
    fixes: Vec<String>,
}

impl ErrorBuilder {
    /// Create a new error builder with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            detail: None,
            causes: Vec::new(),
            fixes: Vec::new(),
        }
    }

    /// Attach the underlying error (rendered with its full context chain).
    pub fn detail(mut self, err: &anyhow::Error) -> Self {
        self.detail = Some(format!("{:#}", err));
        self
    }

    /// Add a possible cause.
    pub fn cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }

    /// Add a suggested fix.
    pub fn fix(mut self, fix: impl Into<String>) -> Self {
        self.fixes.push(fix.into());
        self
    }

    /// Build the formatted error message.
    pub fn build(self) -> String {
        let title = match &self.detail {
            Some(detail) => format!("{}: {}", self.title, detail),
            None => self.title.clone(),
        };
        let causes: Vec<&str> = self.causes.iter().map(|s| s.as_str()).collect();
        let fixes: Vec<&str> = self.fixes.iter().map(|s| s.as_str()).collect();
        format_error(&title, &causes, &fixes)
    }
}

impl fmt::Display for ErrorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.clone().build())
    }
}

/// Report shown when the saved state could not be restored at startup.
///
/// Startup continues with an empty registry after this is shown.
pub fn state_load_report(path: &Path, err: &anyhow::Error) -> String {
    ErrorBuilder::new("Could not restore previous downloads, starting empty")
        .detail(err)
        .cause(format!("{} is corrupt or was written by another tool", path.display()))
        .cause("Another sailor instance is holding the state lock")
        .fix(format!("Move {} aside and restart", path.display()))
        .build()
}

/// Report shown when the state could not be written on exit.
pub fn state_save_report(path: &Path, err: &anyhow::Error) -> String {
    ErrorBuilder::new("Failed to save download state, recent changes may be lost")
        .detail(err)
        .cause(format!("{} is not writable", path.display()))
        .cause("The disk is full")
        .fix("Check permissions on the download directory")
        .fix("Run `sailor status` after fixing to confirm what was kept")
        .build()
}

/// Report shown when a worker could not be launched.
pub fn launch_report(name: &str, err: &anyhow::Error, downloader: &Path) -> String {
    ErrorBuilder::new(format!("Could not start download of \"{}\"", name))
        .detail(err)
        .cause(format!("{} is not installed or not on PATH", downloader.display()))
        .cause("No free local port or the download directory is not writable")
        .fix("Install aria2 (e.g. `apt install aria2`)")
        .fix("Use `retry <n>` from the downloads list once fixed")
        .build()
}
