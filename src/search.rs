// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Torrent index search.
//!
//! The download core only needs candidates to turn into tasks; ranking and
//! display are left to the caller.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Info-hash the index returns for its "no results" placeholder row.
const EMPTY_INFO_HASH: &str = "0000000000000000000000000000000000000000";

/// A downloadable candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult {
    pub content_id: String,
    pub display_name: String,
    pub total_bytes: u64,
    pub seeders: u32,
    pub leechers: u32,
    pub file_count: u32,
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("search index returned HTTP {0}")]
    Status(reqwest::StatusCode),
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, SearchError>;
}

/// Row as served by the apibay API; every field is a string.
#[derive(Debug, Deserialize)]
struct ApiBayRow {
    info_hash: String,
    name: String,
    #[serde(default)]
    size: String,
    #[serde(default)]
    seeders: String,
    #[serde(default)]
    leechers: String,
    #[serde(default)]
    num_files: String,
}

impl ApiBayRow {
    fn into_result(self) -> Option<SearchResult> {
        if self.info_hash.is_empty() || self.info_hash == EMPTY_INFO_HASH {
            return None;
        }
        Some(SearchResult {
            content_id: self.info_hash,
            display_name: self.name,
            total_bytes: self.size.trim().parse().unwrap_or(0),
            seeders: self.seeders.trim().parse().unwrap_or(0),
            leechers: self.leechers.trim().parse().unwrap_or(0),
            file_count: self.num_files.trim().parse().unwrap_or(0),
        })
    }
}

/// Client for an apibay-compatible `q.php` endpoint.
#[derive(Debug, Clone)]
pub struct ApiBayClient {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl ApiBayClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl SearchProvider for ApiBayClient {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, SearchError> {
        tracing::debug!(query, url = %self.url, "Searching index");

        let response = self
            .client
            .get(&self.url)
            .query(&[("q", query)])
            .timeout(self.timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SearchError::Status(response.status()));
        }

        let rows: Vec<ApiBayRow> = response.json().await?;
        Ok(parse_rows(rows))
    }
}

fn parse_rows(rows: Vec<ApiBayRow>) -> Vec<SearchResult> {
    rows.into_iter().filter_map(ApiBayRow::into_result).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_parse_leniently() {
        let json = r#"[
            {"id":"1","name":"Ubuntu 24.04 Desktop","info_hash":"ABCDEF0123","leechers":"12","seeders":"345","num_files":"1","size":"6114656256","username":"u","added":"0","status":"vip","category":"303","imdb":""},
            {"id":"2","name":"Weird Row","info_hash":"FEDCBA","leechers":"n/a","seeders":"","num_files":"3","size":"-1"}
        ]"#;
        let rows: Vec<ApiBayRow> = serde_json::from_str(json).unwrap();
        let results = parse_rows(rows);

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].content_id, "ABCDEF0123");
        assert_eq!(results[0].total_bytes, 6_114_656_256);
        assert_eq!(results[0].seeders, 345);
        assert_eq!(results[1].leechers, 0);
        assert_eq!(results[1].seeders, 0);
        assert_eq!(results[1].total_bytes, 0);
        assert_eq!(results[1].file_count, 3);
    }

    #[test]
    fn test_placeholder_row_is_dropped() {
        let json = r#"[{"id":"0","name":"No results returned","info_hash":"0000000000000000000000000000000000000000","leechers":"0","seeders":"0","num_files":"0","size":"0"}]"#;
        let rows: Vec<ApiBayRow> = serde_json::from_str(json).unwrap();
        assert!(parse_rows(rows).is_empty());
    }
}
