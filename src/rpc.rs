// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Worker control protocol.
//!
//! Each worker is an aria2 process exposing JSON-RPC on its own loopback
//! port. The only call the poller needs is `aria2.tellActive`, which lists
//! the transfers the worker currently runs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::download::types::WorkerStatus;

/// Default timeout for a single status query.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 5;

/// Errors from talking to a worker.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Connection refused, timeout, or other transport failure
    #[error("worker on port {port} unreachable: {source}")]
    Unreachable {
        port: u16,
        #[source]
        source: reqwest::Error,
    },
    /// Non-success HTTP status
    #[error("worker on port {port} returned HTTP {status}")]
    Status {
        port: u16,
        status: reqwest::StatusCode,
    },
    /// JSON-RPC level error (bad token, unknown method, ...)
    #[error("worker on port {port} rejected request: {message} (code {code})")]
    Remote {
        port: u16,
        code: i64,
        message: String,
    },
    /// Body was not a JSON-RPC response
    #[error("worker on port {port} sent an invalid response: {source}")]
    Decode {
        port: u16,
        #[source]
        source: reqwest::Error,
    },
}

/// Query interface to a running worker.
#[async_trait]
pub trait WorkerControl: Send + Sync {
    /// Status of every transfer the worker on `port` currently runs.
    ///
    /// `secret` is the token the worker was launched with.
    async fn query_active(&self, port: u16, secret: &str) -> Result<Vec<WorkerStatus>, RpcError>;
}

#[derive(Debug, Serialize)]
struct RpcRequest {
    jsonrpc: &'static str,
    id: &'static str,
    method: &'static str,
    params: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Vec<ActiveEntry>>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// aria2 encodes all numbers as decimal strings.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActiveEntry {
    #[serde(default)]
    status: String,
    #[serde(default)]
    total_length: String,
    #[serde(default)]
    completed_length: String,
    #[serde(default)]
    download_speed: String,
}

impl From<ActiveEntry> for WorkerStatus {
    fn from(entry: ActiveEntry) -> Self {
        Self {
            status: entry.status,
            total_bytes: parse_count(&entry.total_length),
            completed_bytes: parse_count(&entry.completed_length),
            rate_bytes_per_sec: parse_count(&entry.download_speed),
        }
    }
}

/// Lenient decimal parse; anything unparsable counts as zero.
fn parse_count(raw: &str) -> u64 {
    raw.trim().parse().unwrap_or(0)
}

/// Pick the entry describing the payload.
///
/// A magnet download first fetches the torrent metadata and then the data as
/// a follow-up transfer; while both are listed the larger one is the payload.
pub fn primary_status(entries: Vec<WorkerStatus>) -> Option<WorkerStatus> {
    entries.into_iter().max_by_key(|s| s.total_bytes)
}

/// JSON-RPC client for aria2 workers.
///
/// Holds no credentials; every worker has its own token, passed per call.
#[derive(Debug, Clone)]
pub struct Aria2Client {
    client: reqwest::Client,
    host: String,
    timeout: Duration,
}

impl Default for Aria2Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Aria2Client {
    /// Client for workers on `127.0.0.1`.
    pub fn new() -> Self {
        Self::with_host("127.0.0.1")
    }

    /// Client for workers on another host.
    pub fn with_host(host: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            host: host.into(),
            timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }

    /// Set request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn endpoint(&self, port: u16) -> String {
        format!("http://{}:{}/jsonrpc", self.host, port)
    }
}

#[async_trait]
impl WorkerControl for Aria2Client {
    async fn query_active(&self, port: u16, secret: &str) -> Result<Vec<WorkerStatus>, RpcError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: "sailor",
            method: "aria2.tellActive",
            params: vec![format!("token:{}", secret)],
        };

        let response = self
            .client
            .post(self.endpoint(port))
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|source| RpcError::Unreachable { port, source })?;

        // aria2 answers auth failures with HTTP 400 and a JSON-RPC error body
        let status = response.status();
        let body: Result<RpcResponse, _> = response.json().await;

        match body {
            Ok(RpcResponse { error: Some(err), .. }) => Err(RpcError::Remote {
                port,
                code: err.code,
                message: err.message,
            }),
            _ if !status.is_success() => Err(RpcError::Status { port, status }),
            Ok(RpcResponse { result, .. }) => Ok(result
                .unwrap_or_default()
                .into_iter()
                .map(WorkerStatus::from)
                .collect()),
            Err(source) => Err(RpcError::Decode { port, source }),
        }
    }
}
