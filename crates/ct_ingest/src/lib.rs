// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Ordered, resumable ingestion of a Certificate Transparency log.
//!
//! The pipeline has three seams:
//! - a [`LogSource`] serving contiguous ranges of raw leaves,
//! - an [`EntryDecoder`](ct_entry::EntryDecoder) turning each leaf into a
//!   [`LogEntry`](ct_entry::LogEntry),
//! - a [`Sink`] that durably commits one entry (and its DNS names) at a time.
//!
//! [`OrderedFetch`] pulls batches from the source on concurrent tasks and hands
//! decoded entries back strictly in index order. [`IngestionRunner`] derives
//! the resume point from the sink, drives the fetch and commits each entry.

pub mod fetch;
pub mod http;
pub mod options;
pub mod runner;
pub mod sink;
pub mod source;
pub mod text;

#[cfg(test)]
pub(crate) mod testing;

pub use fetch::OrderedFetch;
pub use http::HttpLogSource;
pub use options::*;
pub use runner::*;
pub use sink::{open_sink, DnsNameRow, EntryRow, Sink, SinkError, SinkKind};
pub use source::{LogSource, SourceError};

use ct_entry::{DecodeError, LeafIndex};
use std::fmt;

/// A half-open range `[start, end)` of leaf indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScanRange {
    pub start: LeafIndex,
    pub end: LeafIndex,
}

impl ScanRange {
    pub fn new(start: LeafIndex, end: LeafIndex) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for ScanRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Errors that stop a scan. Cancellation is not one of them; see
/// [`RunOutcome::Cancelled`].
#[derive(thiserror::Error, Debug)]
pub enum ScanError {
    #[error("failed to fetch {range} after {attempts} attempts")]
    Fetch {
        range: ScanRange,
        attempts: u32,
        #[source]
        source: SourceError,
    },
    #[error("log returned a malformed response for {range}")]
    Protocol {
        range: ScanRange,
        #[source]
        source: SourceError,
    },
    #[error("failed to decode entry {index}")]
    Decode {
        index: LeafIndex,
        #[source]
        source: DecodeError,
    },
    #[error("failed to commit entry {index}")]
    Sink {
        index: LeafIndex,
        #[source]
        source: SinkError,
    },
    #[error("failed to get tree size")]
    TreeSize(#[source] SourceError),
    #[error("entry {got} delivered out of order, expected {expected}")]
    OutOfOrder { expected: LeafIndex, got: LeafIndex },
    #[error("failed to read the highest committed index")]
    ResumePoint(#[source] SinkError),
    #[error("failed to flush sink")]
    Flush(#[source] SinkError),
    #[error("batch fetch task failed")]
    Worker(#[source] tokio::task::JoinError),
}
