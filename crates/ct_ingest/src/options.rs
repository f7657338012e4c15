// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Knobs for fetching and scanning.

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use ct_entry::LeafIndex;
use std::{num::NonZeroUsize, time::Duration};

/// Entries requested per `get-entries` batch.
pub const DEFAULT_BATCH_SIZE: u64 = 5000;
/// How often to log progress.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(10);
/// How long to wait before re-polling the tree size in follow mode.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Bounded exponential backoff for transient fetch errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts per request, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// The delay schedule between attempts. The attempt count, not elapsed
    /// time, bounds the retries.
    pub(crate) fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_delay)
            .with_max_interval(self.max_delay)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// How [`OrderedFetch`](crate::OrderedFetch) splits and parallelizes work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOptions {
    /// Maximum number of entries per batch.
    pub batch_size: u64,
    /// Maximum number of batches fetched or buffered at once.
    pub parallelism: usize,
    pub retry: RetryPolicy,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            parallelism: std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
            retry: RetryPolicy::default(),
        }
    }
}

/// Where a fetch stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    /// Stop after index `end - 1`.
    Fixed(LeafIndex),
    /// Never stop on our own: once `known_end` is reached, poll the tree
    /// size every `poll_interval` and keep going as the log grows.
    Follow {
        known_end: LeafIndex,
        poll_interval: Duration,
    },
}

impl Bound {
    pub fn known_end(&self) -> LeafIndex {
        match self {
            Bound::Fixed(end) | Bound::Follow { known_end: end, .. } => *end,
        }
    }
}

/// How far a run should go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScanTarget {
    /// Up to the tree size observed at startup.
    #[default]
    TreeSize,
    /// Up to `min(tree size, end)`.
    Until(LeafIndex),
    /// Follow the log as it grows, until cancelled.
    Follow { poll_interval: Duration },
}

/// Options for an [`IngestionRunner`](crate::IngestionRunner).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOptions {
    /// Where to start when the sink is empty. Ignored otherwise.
    pub start: Option<LeafIndex>,
    pub target: ScanTarget,
    pub fetch: FetchOptions,
    pub progress_interval: Duration,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            start: None,
            target: ScanTarget::default(),
            fetch: FetchOptions::default(),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}
