// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! The log-side seam of the pipeline.

use ct_entry::{LeafIndex, RawLeaf};
use std::{future::Future, sync::Arc};

/// Why a call to a [`LogSource`] failed.
#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    /// Worth retrying: network trouble, rate limiting, server errors.
    #[error("transient error: {0:#}")]
    Transient(anyhow::Error),
    /// The log answered, but not with anything usable.
    #[error("protocol error: {0:#}")]
    Protocol(anyhow::Error),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// A CT log, seen as an append-only array of raw leaves.
///
/// Batches are fetched on their own tasks, so sources are shared across
/// threads and their futures must be `Send`.
pub trait LogSource: Send + Sync {
    /// Return the current number of entries in the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the log could not be reached or its answer could
    /// not be parsed.
    fn tree_size(&self) -> impl Future<Output = Result<u64, SourceError>> + Send;

    /// Return leaves `[start, end)`, in order, with `index` set. Logs may
    /// cap the number of entries per response, so fewer than `end - start`
    /// leaves may come back; never more.
    ///
    /// # Errors
    ///
    /// Returns an error if the log could not be reached or its answer could
    /// not be parsed.
    fn get_entries(
        &self,
        start: LeafIndex,
        end: LeafIndex,
    ) -> impl Future<Output = Result<Vec<RawLeaf>, SourceError>> + Send;
}

impl<T: LogSource> LogSource for Arc<T> {
    fn tree_size(&self) -> impl Future<Output = Result<u64, SourceError>> + Send {
        (**self).tree_size()
    }

    fn get_entries(
        &self,
        start: LeafIndex,
        end: LeafIndex,
    ) -> impl Future<Output = Result<Vec<RawLeaf>, SourceError>> + Send {
        (**self).get_entries(start, end)
    }
}
