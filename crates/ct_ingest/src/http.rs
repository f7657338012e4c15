// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! A [`LogSource`] speaking the [RFC 6962 client API](https://datatracker.ietf.org/doc/html/rfc6962#section-4)
//! over HTTP.

use crate::source::{LogSource, SourceError};
use anyhow::{anyhow, Context};
use ct_entry::{LeafIndex, RawLeaf, UnixTimestamp};
use log::debug;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_with::{base64::Base64, serde_as};
use std::time::Duration;
use url::Url;

const USER_AGENT: &str = concat!("ct-dump/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_IDLE_PER_HOST: usize = 10;

/// Get-sth response. Only the fields the crawler needs are kept.
#[derive(Deserialize)]
struct GetSthResponse {
    tree_size: u64,
    timestamp: UnixTimestamp,
}

/// Get-entries response.
#[derive(Deserialize)]
struct GetEntriesResponse {
    entries: Vec<GetEntriesItem>,
}

#[serde_as]
#[derive(Deserialize)]
struct GetEntriesItem {
    #[serde_as(as = "Base64")]
    leaf_input: Vec<u8>,
}

/// RFC 6962 log client.
#[derive(Debug, Clone)]
pub struct HttpLogSource {
    client: reqwest::Client,
    get_sth: Url,
    get_entries: Url,
}

impl HttpLogSource {
    /// Create a client for the log at `log_url`, e.g.
    /// `https://ct.example.com/2025h1`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot serve as a base URL or the HTTP
    /// client cannot be built.
    pub fn new(log_url: &Url) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .build()?;
        Ok(Self {
            client,
            get_sth: endpoint(log_url, "get-sth")?,
            get_entries: endpoint(log_url, "get-entries")?,
        })
    }

    async fn get(&self, url: Url) -> Result<Vec<u8>, SourceError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| request_error(&url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(&url, status));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| request_error(&url, e))?;
        Ok(body.to_vec())
    }

    /// The get-entries URL for the half-open range `[start, end)`, which
    /// must not be empty. The API's `end` parameter is inclusive.
    fn entries_url(&self, start: LeafIndex, end: LeafIndex) -> Url {
        let mut url = self.get_entries.clone();
        url.query_pairs_mut()
            .append_pair("start", &start.to_string())
            .append_pair("end", &(end - 1).to_string());
        url
    }
}

impl LogSource for HttpLogSource {
    async fn tree_size(&self) -> Result<u64, SourceError> {
        let body = self.get(self.get_sth.clone()).await?;
        parse_sth(&body)
    }

    async fn get_entries(
        &self,
        start: LeafIndex,
        end: LeafIndex,
    ) -> Result<Vec<RawLeaf>, SourceError> {
        if start >= end {
            return Ok(Vec::new());
        }
        let body = self.get(self.entries_url(start, end)).await?;
        parse_entries(start, &body)
    }
}

/// Resolve `ct/v1/<name>` against the log URL, which may or may not carry a
/// trailing slash.
fn endpoint(log_url: &Url, name: &str) -> anyhow::Result<Url> {
    let mut base = log_url.clone();
    if !base.path().ends_with('/') {
        base.set_path(&format!("{}/", base.path()));
    }
    base.join(&format!("ct/v1/{name}"))
        .with_context(|| format!("invalid log URL {log_url}"))
}

fn request_error(url: &Url, err: reqwest::Error) -> SourceError {
    let is_builder = err.is_builder();
    let err = anyhow::Error::new(err).context(format!("GET {url}"));
    if is_builder {
        SourceError::Protocol(err)
    } else {
        SourceError::Transient(err)
    }
}

fn status_error(url: &Url, status: StatusCode) -> SourceError {
    let err = anyhow!("GET {url}: {status}");
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        SourceError::Transient(err)
    } else {
        SourceError::Protocol(err)
    }
}

fn parse_sth(body: &[u8]) -> Result<u64, SourceError> {
    let sth: GetSthResponse = serde_json::from_slice(body)
        .context("invalid get-sth response")
        .map_err(SourceError::Protocol)?;
    debug!("STH: tree_size={} timestamp={}", sth.tree_size, sth.timestamp);
    Ok(sth.tree_size)
}

fn parse_entries(start: LeafIndex, body: &[u8]) -> Result<Vec<RawLeaf>, SourceError> {
    let response: GetEntriesResponse = serde_json::from_slice(body)
        .context("invalid get-entries response")
        .map_err(SourceError::Protocol)?;
    Ok(response
        .entries
        .into_iter()
        .zip(start..)
        .map(|(item, index)| RawLeaf {
            index,
            leaf_input: item.leaf_input,
        })
        .collect())
}
