// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Parallel batch fetching with in-order delivery.
//!
//! The range to scan is cut into consecutive batches of at most
//! `batch_size` leaves. Each batch is fetched and decoded on its own task,
//! so batches keep making progress while the consumer is busy committing.
//! Finished batches wait in a reorder buffer keyed by start index until
//! every batch before them has been handed out, so entries come out of
//! [`OrderedFetch::next`] in strictly increasing index order no matter which
//! request finishes first. Running, finished and buffered batches together
//! never exceed `parallelism`.
//!
//! A failure inside a batch travels with the entries decoded before it, so
//! the consumer sees every entry below the failing index before the error.

use crate::{Bound, FetchOptions, LogSource, RetryPolicy, ScanError, ScanRange, SourceError};
use anyhow::anyhow;
use backoff::backoff::Backoff;
use ct_entry::{EntryDecoder, LeafIndex, LogEntry, RawLeaf};
use log::{debug, info, warn};
use std::{collections::BTreeMap, fmt::Display, future::Future};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// The outcome of fetching one batch: the leading run of decoded entries,
/// and the error that cut it short, if any.
struct Batch {
    range: ScanRange,
    entries: Vec<LogEntry>,
    error: Option<ScanError>,
}

/// A lazy, finite, non-restartable sequence of decoded entries in index
/// order.
///
/// Must be used from within a Tokio runtime. Dropping it aborts the batches
/// still running.
pub struct OrderedFetch<S, D> {
    source: S,
    decoder: D,
    options: FetchOptions,
    bound: Bound,
    cancel: CancellationToken,

    /// Start of the next batch to dispatch.
    next_dispatch: LeafIndex,
    /// Start of the next batch to hand to `ready`.
    next_release: LeafIndex,
    /// Batches running or finished but not yet collected.
    in_flight: JoinSet<Option<Batch>>,
    reorder: BTreeMap<LeafIndex, Batch>,
    ready: std::vec::IntoIter<LogEntry>,
    pending_error: Option<ScanError>,
    done: bool,
}

impl<S, D> OrderedFetch<S, D>
where
    S: LogSource + Clone + 'static,
    D: EntryDecoder + Clone + Send + Sync + 'static,
{
    /// Scan from `start` up to `bound`. Cancelling `cancel` stops dispatching
    /// and makes [`next`](Self::next) return `Ok(None)`.
    pub fn new(
        source: S,
        decoder: D,
        start: LeafIndex,
        bound: Bound,
        options: FetchOptions,
        cancel: &CancellationToken,
    ) -> Self {
        let options = FetchOptions {
            batch_size: options.batch_size.max(1),
            parallelism: options.parallelism.max(1),
            ..options
        };
        Self {
            source,
            decoder,
            options,
            bound,
            cancel: cancel.child_token(),
            next_dispatch: start,
            next_release: start,
            in_flight: JoinSet::new(),
            reorder: BTreeMap::new(),
            ready: Vec::new().into_iter(),
            pending_error: None,
            done: false,
        }
    }

    /// The end of the range known to exist. Grows in follow mode.
    pub fn known_end(&self) -> LeafIndex {
        self.bound.known_end()
    }

    /// Return the next entry, or `Ok(None)` once the bound is reached or the
    /// fetch was cancelled.
    ///
    /// # Errors
    ///
    /// Returns the first [`ScanError`] in index order. After an error, the
    /// sequence is over.
    pub async fn next(&mut self) -> Result<Option<LogEntry>, ScanError> {
        loop {
            if self.done || self.cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(entry) = self.ready.next() {
                return Ok(Some(entry));
            }
            if let Some(err) = self.pending_error.take() {
                self.stop();
                return Err(err);
            }
            if let Some(batch) = self.reorder.remove(&self.next_release) {
                self.next_release = batch.range.end;
                self.ready = batch.entries.into_iter();
                self.pending_error = batch.error;
                continue;
            }

            self.dispatch();

            if self.in_flight.is_empty() {
                // Everything up to the known end has been handed out.
                match self.bound {
                    Bound::Fixed(_) => {
                        self.done = true;
                        return Ok(None);
                    }
                    Bound::Follow { .. } => {
                        self.wait_for_growth().await?;
                        continue;
                    }
                }
            }

            tokio::select! {
                () = self.cancel.cancelled() => return Ok(None),
                Some(joined) = self.in_flight.join_next() => match joined {
                    Ok(Some(batch)) => {
                        debug!("fetched {} ({} entries)", batch.range, batch.entries.len());
                        self.reorder.insert(batch.range.start, batch);
                    }
                    // The batch gave up because of cancellation.
                    Ok(None) => {}
                    Err(err) => {
                        self.stop();
                        return Err(ScanError::Worker(err));
                    }
                },
            }
        }
    }

    /// Stop dispatching, wait for running batches to settle and discard
    /// whatever they fetched.
    pub async fn drain(&mut self) {
        self.cancel.cancel();
        while self.in_flight.join_next().await.is_some() {}
        self.reorder.clear();
        self.done = true;
    }

    /// End the sequence after an error. Running batches see the
    /// cancellation and return early.
    fn stop(&mut self) {
        self.done = true;
        self.cancel.cancel();
    }

    fn dispatch(&mut self) {
        let end = self.bound.known_end();
        while self.next_dispatch < end
            && self.in_flight.len() + self.reorder.len() < self.options.parallelism
            && !self.cancel.is_cancelled()
        {
            let range = ScanRange::new(
                self.next_dispatch,
                end.min(self.next_dispatch.saturating_add(self.options.batch_size)),
            );
            self.next_dispatch = range.end;
            debug!("dispatching {range}");
            self.in_flight.spawn(fetch_batch(
                self.source.clone(),
                self.decoder.clone(),
                range,
                self.options.retry.clone(),
                self.cancel.clone(),
            ));
        }
    }

    /// Poll the tree size until it exceeds the known end. Returns early,
    /// with `Ok`, if cancelled.
    async fn wait_for_growth(&mut self) -> Result<(), ScanError> {
        let Bound::Follow {
            known_end,
            poll_interval,
        } = self.bound
        else {
            return Ok(());
        };
        loop {
            let source = &self.source;
            let size = match retry(&self.options.retry, &self.cancel, "get-sth", move || {
                source.tree_size()
            })
            .await
            {
                Ok(Some(size)) => size,
                Ok(None) => return Ok(()),
                Err(err) => return Err(ScanError::TreeSize(err.source)),
            };
            if size > known_end {
                info!("log grew from {known_end} to {size} entries");
                self.bound = Bound::Follow {
                    known_end: size,
                    poll_interval,
                };
                return Ok(());
            }
            debug!("no new entries at {size}, polling again in {poll_interval:?}");
            tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
}

/// Fetch and decode every leaf of `range`, asking again for whatever a short
/// response left out. Returns `None` if cancelled.
async fn fetch_batch<S: LogSource, D: EntryDecoder>(
    source: S,
    decoder: D,
    range: ScanRange,
    retry_policy: RetryPolicy,
    cancel: CancellationToken,
) -> Option<Batch> {
    let source = &source;
    let mut entries = Vec::with_capacity(usize::try_from(range.len()).unwrap_or(0));
    let mut next = range.start;
    let fail = |entries, error| {
        Some(Batch {
            range,
            entries,
            error: Some(error),
        })
    };

    while next < range.end {
        let chunk = ScanRange::new(next, range.end);
        let fetched = retry(&retry_policy, &cancel, chunk, move || get_chunk(source, chunk)).await;
        let leaves = match fetched {
            Ok(Some(leaves)) => leaves,
            Ok(None) => return None,
            Err(Exhausted { attempts, source: err }) => {
                let error = if err.is_transient() {
                    ScanError::Fetch {
                        range: chunk,
                        attempts,
                        source: err,
                    }
                } else {
                    ScanError::Protocol {
                        range: chunk,
                        source: err,
                    }
                };
                return fail(entries, error);
            }
        };
        for leaf in &leaves {
            match decoder.decode(leaf) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    let error = ScanError::Decode {
                        index: leaf.index,
                        source: err,
                    };
                    return fail(entries, error);
                }
            }
        }
        next += leaves.len() as u64;
    }

    Some(Batch {
        range,
        entries,
        error: None,
    })
}
/// One `get-entries` call, checked against what was asked for.
async fn get_chunk<S: LogSource>(source: &S, chunk: ScanRange) -> Result<Vec<RawLeaf>, SourceError> {
    let leaves = source.get_entries(chunk.start, chunk.end).await?;
    if leaves.is_empty() {
        return Err(SourceError::Transient(anyhow!(
            "log returned no entries for {chunk}"
        )));
    }
    if leaves.len() as u64 > chunk.len() {
        return Err(SourceError::Protocol(anyhow!(
            "log returned {} entries for {chunk}",
            leaves.len()
        )));
    }
    if let Some((leaf, expected)) = leaves
        .iter()
        .zip(chunk.start..)
        .find(|(leaf, expected)| leaf.index != *expected)
    {
        return Err(SourceError::Protocol(anyhow!(
            "log returned entry {} at position {expected}",
            leaf.index
        )));
    }
    Ok(leaves)
}

pub(crate) struct Exhausted {
    pub attempts: u32,
    pub source: SourceError,
}

/// Run `op` until it succeeds, fails with a protocol error, or has been tried
/// `policy.max_attempts` times. Returns `Ok(None)` as soon as `cancel`
/// fires, even mid-request.
pub(crate) async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: impl Display,
    mut op: F,
) -> Result<Option<T>, Exhausted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    let mut backoff = policy.backoff();
    let mut attempts = 0;
    loop {
        attempts += 1;
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(None),
            result = op() => result,
        };
        let err = match result {
            Ok(value) => return Ok(Some(value)),
            Err(err) => err,
        };
        if !err.is_transient() || attempts >= policy.max_attempts {
            return Err(Exhausted {
                attempts,
                source: err,
            });
        }
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let delay = backoff.next_backoff().unwrap_or(policy.max_delay);
        warn!(
            "{what}: {err} (attempt {attempts}/{}), retrying in {delay:?}",
            policy.max_attempts
        );
        tokio::select! {
            () = cancel.cancelled() => return Ok(None),
            () = tokio::time::sleep(delay) => {}
        }
    }
}
