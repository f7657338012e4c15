// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Test doubles for the three pipeline seams. Batches run on their own
//! tasks, so the fake log keeps its state behind locks and atomics.

use crate::{
    DnsNameRow, EntryRow, FetchOptions, LogSource, RetryPolicy, ScanRange, Sink, SinkError,
    SourceError,
};
use anyhow::anyhow;
use ct_entry::{CertificateFields, DecodeError, EntryDecoder, LeafIndex, LogEntry, RawLeaf};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};
use tokio_util::sync::CancellationToken;

pub(crate) fn fast_fetch(batch_size: u64, parallelism: usize) -> FetchOptions {
    FetchOptions {
        batch_size,
        parallelism,
        retry: RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
    }
}

pub(crate) fn fake_leaf(index: LeafIndex) -> RawLeaf {
    RawLeaf {
        index,
        leaf_input: index.to_be_bytes().to_vec(),
    }
}

/// An in-memory log of `size` leaves with scriptable misbehavior, keyed by
/// the start index of the request.
#[derive(Default)]
pub(crate) struct FakeLog {
    size: AtomicU64,
    /// Sizes reported by successive `tree_size` calls; the last one sticks.
    scripted_sizes: Mutex<VecDeque<u64>>,
    max_per_request: Option<u64>,
    /// Number of sleeps, and their length, before answering.
    delays: HashMap<LeafIndex, (u32, Duration)>,
    transient_failures: Mutex<HashMap<LeafIndex, u32>>,
    protocol_failures: HashSet<LeafIndex>,
    extra_leaf_at: Option<LeafIndex>,
    sth_failures: AtomicU32,

    requests: Mutex<Vec<ScanRange>>,
    tree_size_calls: AtomicU32,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeLog {
    pub fn new(size: u64) -> Self {
        Self {
            size: AtomicU64::new(size),
            ..Default::default()
        }
    }

    pub fn with_delay(self, start: LeafIndex, millis: u64) -> Self {
        self.with_steps(start, 1, millis)
    }

    /// Answer requests starting at `start` only after `steps` consecutive
    /// sleeps of `millis` each. Every step needs the request to be polled
    /// again.
    pub fn with_steps(mut self, start: LeafIndex, steps: u32, millis: u64) -> Self {
        self.delays
            .insert(start, (steps, Duration::from_millis(millis)));
        self
    }

    pub fn with_max_per_request(mut self, max: u64) -> Self {
        self.max_per_request = Some(max);
        self
    }

    pub fn with_transient_failures(mut self, start: LeafIndex, times: u32) -> Self {
        self.transient_failures.get_mut().insert(start, times);
        self
    }

    pub fn with_protocol_failure(mut self, start: LeafIndex) -> Self {
        self.protocol_failures.insert(start);
        self
    }

    pub fn with_extra_leaf(mut self, start: LeafIndex) -> Self {
        self.extra_leaf_at = Some(start);
        self
    }

    pub fn with_sth_failures(mut self, times: u32) -> Self {
        *self.sth_failures.get_mut() = times;
        self
    }

    pub fn with_scripted_sizes(mut self, sizes: impl IntoIterator<Item = u64>) -> Self {
        self.scripted_sizes.get_mut().extend(sizes);
        self
    }

    pub fn requests(&self) -> Vec<ScanRange> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self, start: LeafIndex) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.start == start)
            .count()
    }

    pub fn tree_size_calls(&self) -> u32 {
        self.tree_size_calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn respond(&self, start: LeafIndex, end: LeafIndex) -> Result<Vec<RawLeaf>, SourceError> {
        if self.protocol_failures.contains(&start) {
            return Err(SourceError::Protocol(anyhow!("garbled response")));
        }
        if let Some(remaining) = self.transient_failures.lock().get_mut(&start) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SourceError::Transient(anyhow!("503 Service Unavailable")));
            }
        }
        let mut end = end.min(self.size.load(Ordering::SeqCst));
        if let Some(max) = self.max_per_request {
            end = end.min(start + max);
        }
        let mut leaves: Vec<RawLeaf> = (start..end).map(fake_leaf).collect();
        if self.extra_leaf_at == Some(start) {
            leaves.push(fake_leaf(end));
        }
        Ok(leaves)
    }
}

impl LogSource for FakeLog {
    async fn tree_size(&self) -> Result<u64, SourceError> {
        self.tree_size_calls.fetch_add(1, Ordering::SeqCst);
        let failures_left = self
            .sth_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failures_left.is_ok() {
            return Err(SourceError::Transient(anyhow!("connection refused")));
        }
        if let Some(size) = self.scripted_sizes.lock().pop_front() {
            self.size.store(size, Ordering::SeqCst);
        }
        Ok(self.size.load(Ordering::SeqCst))
    }

    async fn get_entries(
        &self,
        start: LeafIndex,
        end: LeafIndex,
    ) -> Result<Vec<RawLeaf>, SourceError> {
        self.requests.lock().push(ScanRange::new(start, end));
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        if let Some(&(steps, step)) = self.delays.get(&start) {
            for _ in 0..steps {
                tokio::time::sleep(step).await;
            }
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.respond(start, end)
    }
}

/// Decodes [`fake_leaf`]s: index `n` gets subject `hostN.example` and
/// `n % 3` DNS names.
#[derive(Clone, Default)]
pub(crate) struct FakeDecoder {
    pub fail_at: Option<LeafIndex>,
}

impl EntryDecoder for FakeDecoder {
    fn decode(&self, leaf: &RawLeaf) -> Result<LogEntry, DecodeError> {
        if self.fail_at == Some(leaf.index) {
            return Err(DecodeError::TrailingData);
        }
        let n = u64::from_be_bytes(
            leaf.leaf_input
                .as_slice()
                .try_into()
                .map_err(|_| DecodeError::TrailingData)?,
        );
        Ok(LogEntry {
            index: leaf.index,
            timestamp: 1_700_000_000_000 + n,
            is_precert: n % 2 == 1,
            certificate: CertificateFields {
                issuer_common_name: b"Fake CA".to_vec(),
                issuer_organizations: vec![b"Fake".to_vec(), b"Trust\0".to_vec()],
                subject_common_name: format!("host{n}.example").into_bytes(),
                dns_names: (0..n % 3)
                    .map(|i| format!("n{i}.host{n}.example").into_bytes())
                    .collect(),
                ..Default::default()
            },
        })
    }
}

/// A sink that commits to memory, optionally failing or cancelling at a
/// given index.
#[derive(Default)]
pub(crate) struct MemorySink {
    pub entries: Vec<EntryRow>,
    pub dns_names: Vec<DnsNameRow>,
    /// Fail the commit of this index after its entry row is staged.
    pub fail_at: Option<LeafIndex>,
    /// Cancel the token right after committing this index.
    pub cancel_after: Option<(LeafIndex, CancellationToken)>,
    pub flushes: u32,
}

impl MemorySink {
    pub fn indices(&self) -> Vec<LeafIndex> {
        self.entries.iter().map(|e| e.index).collect()
    }
}

impl Sink for MemorySink {
    fn highest_committed_index(&mut self) -> Result<Option<LeafIndex>, SinkError> {
        Ok(self.entries.last().map(|e| e.index))
    }

    fn commit_entry(
        &mut self,
        entry: &EntryRow,
        dns_names: &[DnsNameRow],
    ) -> Result<(), SinkError> {
        let staged_entry = entry.clone();
        if self.fail_at == Some(entry.index) {
            return Err(SinkError::Io(std::io::Error::other("injected fault")));
        }
        self.dns_names.extend_from_slice(dns_names);
        self.entries.push(staged_entry);

        if let Some((index, token)) = &self.cancel_after {
            if *index == entry.index {
                token.cancel();
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.flushes += 1;
        Ok(())
    }
}
