// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! One forward scan of a log into a sink.

use crate::{
    fetch::{retry, Exhausted},
    text::{fix_utf8, join_fixed},
    Bound, DnsNameRow, EntryRow, LogSource, OrderedFetch, ScanError, ScanOptions, ScanTarget,
    Sink,
};
use ct_entry::{EntryDecoder, LeafIndex, LogEntry};
use log::{info, warn};
use std::time::{Duration, Instant};
use tokio::{
    runtime::{Handle, RuntimeFlavor},
    task::block_in_place,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The bound was reached.
    Completed,
    /// The run stopped early because it was cancelled. Everything committed
    /// is still a gap-free prefix.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// The resume point the run started from.
    pub start: LeafIndex,
    /// The first index not committed.
    pub next_index: LeafIndex,
    /// Entries committed by this run.
    pub committed: u64,
    pub outcome: RunOutcome,
}

/// Drives an [`OrderedFetch`] from the sink's resume point and commits each
/// entry as it arrives.
pub struct IngestionRunner<S, K, D> {
    source: S,
    sink: K,
    decoder: D,
    options: ScanOptions,
    cancel: CancellationToken,
}

impl<S, K, D> IngestionRunner<S, K, D>
where
    S: LogSource + Clone + 'static,
    K: Sink,
    D: EntryDecoder + Clone + Send + Sync + 'static,
{
    pub fn new(
        source: S,
        sink: K,
        decoder: D,
        options: ScanOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            sink,
            decoder,
            options,
            cancel,
        }
    }

    pub fn into_sink(self) -> K {
        self.sink
    }

    /// Scan from the resume point to the configured target.
    ///
    /// # Errors
    ///
    /// Returns the first fatal [`ScanError`]. Entries committed before it
    /// stay committed and the sink is flushed either way.
    pub async fn run(&mut self) -> Result<RunSummary, ScanError> {
        let start = self.resume_point()?;
        let summary = |next_index: LeafIndex, outcome| RunSummary {
            start,
            next_index,
            committed: next_index - start,
            outcome,
        };

        let source = &self.source;
        let tree_size = match retry(&self.options.fetch.retry, &self.cancel, "get-sth", move || {
            source.tree_size()
        })
        .await
        {
            Ok(Some(size)) => size,
            Ok(None) => return Ok(summary(start, RunOutcome::Cancelled)),
            Err(Exhausted { source: err, .. }) => return Err(ScanError::TreeSize(err)),
        };

        let bound = match self.options.target {
            ScanTarget::TreeSize => Bound::Fixed(tree_size),
            ScanTarget::Until(end) => Bound::Fixed(tree_size.min(end)),
            ScanTarget::Follow { poll_interval } => Bound::Follow {
                known_end: tree_size,
                poll_interval,
            },
        };
        if let Bound::Fixed(end) = bound {
            if start >= end {
                info!("nothing to fetch: resume point {start}, end {end}");
                return Ok(summary(start, RunOutcome::Completed));
            }
        }
        info!(
            "scanning from {start} (tree size {tree_size}, {})",
            match bound {
                Bound::Fixed(end) => format!("stopping at {end}"),
                Bound::Follow { .. } => "following".to_string(),
            }
        );

        let mut fetch = OrderedFetch::new(
            self.source.clone(),
            self.decoder.clone(),
            start,
            bound,
            self.options.fetch.clone(),
            &self.cancel,
        );
        let mut progress = Progress::new(start, self.options.progress_interval);
        let mut next_index = start;

        let result = loop {
            let entry = match fetch.next().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            };
            if self.cancel.is_cancelled() {
                break Ok(());
            }
            if entry.index != next_index {
                break Err(ScanError::OutOfOrder {
                    expected: next_index,
                    got: entry.index,
                });
            }
            let (row, dns_names) = rows_for(&entry);
            let sink = &mut self.sink;
            if let Err(err) = blocking(|| sink.commit_entry(&row, &dns_names)) {
                break Err(ScanError::Sink {
                    index: entry.index,
                    source: err,
                });
            }
            next_index += 1;
            progress.update(next_index, fetch.known_end());
        };

        let outcome = if self.cancel.is_cancelled() {
            info!("cancelled, waiting for in-flight requests");
            fetch.drain().await;
            RunOutcome::Cancelled
        } else {
            RunOutcome::Completed
        };
        drop(fetch);

        let sink = &mut self.sink;
        let flushed = blocking(|| sink.flush());
        match result {
            Ok(()) => {
                flushed.map_err(ScanError::Flush)?;
                let summary = summary(next_index, outcome);
                info!(
                    "{outcome:?}: committed {} entries, next index {next_index}",
                    summary.committed
                );
                Ok(summary)
            }
            Err(err) => {
                if let Err(flush_err) = flushed {
                    warn!("failed to flush sink after error: {flush_err}");
                }
                Err(err)
            }
        }
    }

    fn resume_point(&mut self) -> Result<LeafIndex, ScanError> {
        let highest = self
            .sink
            .highest_committed_index()
            .map_err(ScanError::ResumePoint)?;
        Ok(match (highest, self.options.start) {
            (Some(highest), start) => {
                let resume = highest.saturating_add(1);
                if let Some(start) = start.filter(|s| *s != resume) {
                    warn!(
                        "ignoring start index {start}: sink already holds entries up to {highest}"
                    );
                }
                resume
            }
            (None, start) => start.unwrap_or(0),
        })
    }
}

/// Sink calls block on disk I/O. On a multi-threaded runtime the worker
/// hands its other tasks off first, so batch fetches keep running.
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => block_in_place(f),
        _ => f(),
    }
}

/// Map a decoded entry to the rows the sink stores, with all text passed
/// through [`fix_utf8`].
pub fn rows_for(entry: &LogEntry) -> (EntryRow, Vec<DnsNameRow>) {
    let cert = &entry.certificate;
    let row = EntryRow {
        index: entry.index,
        timestamp: entry.timestamp,
        is_precert: entry.is_precert,
        issuer_common_name: fix_utf8(&cert.issuer_common_name),
        issuer_organization: join_fixed(&cert.issuer_organizations),
        subject_common_name: fix_utf8(&cert.subject_common_name),
        subject_organization: join_fixed(&cert.subject_organizations),
        not_before: cert.not_before,
        not_after: cert.not_after,
    };
    let dns_names = cert
        .dns_names
        .iter()
        .map(|name| DnsNameRow {
            index: entry.index,
            dns_name: fix_utf8(name),
        })
        .collect();
    (row, dns_names)
}

/// Rate-limited progress logging.
struct Progress {
    start: LeafIndex,
    started: Instant,
    last_report: Instant,
    interval: Duration,
}

impl Progress {
    fn new(start: LeafIndex, interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            start,
            started: now,
            last_report: now,
            interval,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn update(&mut self, next_index: LeafIndex, end: LeafIndex) {
        let now = Instant::now();
        if now.duration_since(self.last_report) < self.interval {
            return;
        }
        self.last_report = now;

        let processed = next_index - self.start;
        let elapsed = now.duration_since(self.started).as_secs_f64();
        let rate = if elapsed > 0.0 {
            processed as f64 / elapsed
        } else {
            0.0
        };
        let percent = if end > 0 {
            next_index as f64 * 100.0 / end as f64
        } else {
            100.0
        };
        info!(
            "{processed} entries processed ({rate:.0}/s), at {next_index} of {end} ({percent:.2}%)"
        );
    }
}
