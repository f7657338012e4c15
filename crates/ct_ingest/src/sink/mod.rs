// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Durable storage for decoded entries.

mod csv_sink;
mod sqlite_sink;

pub use csv_sink::CsvSink;
pub use sqlite_sink::SqliteSink;

use ct_entry::{LeafIndex, UnixTimestamp};
use std::path::PathBuf;

/// One row per log entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryRow {
    pub index: LeafIndex,
    pub timestamp: UnixTimestamp,
    pub is_precert: bool,
    pub issuer_common_name: String,
    /// Organization names, joined with `;`.
    pub issuer_organization: String,
    pub subject_common_name: String,
    /// Organization names, joined with `;`.
    pub subject_organization: String,
    pub not_before: UnixTimestamp,
    pub not_after: UnixTimestamp,
}

/// One row per subject alternative DNS name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsNameRow {
    pub index: LeafIndex,
    pub dns_name: String,
}

#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("{}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error("database schema version {found} is newer than the supported version {supported}")]
    UnsupportedSchema { found: i64, supported: i64 },
    #[error("entry index {0} is out of range for this sink")]
    IndexOutOfRange(LeafIndex),
}

/// A single-writer store of committed entries, keyed by log index.
pub trait Sink {
    /// Return the highest index committed so far, or `None` if the sink is
    /// empty. The resume point of a run is derived from this alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage cannot be read.
    fn highest_committed_index(&mut self) -> Result<Option<LeafIndex>, SinkError>;

    /// Commit an entry together with its DNS names. Either all rows become
    /// durable, or on error or crash `highest_committed_index` is unchanged
    /// and no orphan DNS rows survive the next open.
    ///
    /// # Errors
    ///
    /// Returns an error if the rows could not be written.
    fn commit_entry(&mut self, entry: &EntryRow, dns_names: &[DnsNameRow])
        -> Result<(), SinkError>;

    /// Push everything committed so far to stable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails to sync.
    fn flush(&mut self) -> Result<(), SinkError>;
}

impl<T: Sink + ?Sized> Sink for &mut T {
    fn highest_committed_index(&mut self) -> Result<Option<LeafIndex>, SinkError> {
        (**self).highest_committed_index()
    }

    fn commit_entry(
        &mut self,
        entry: &EntryRow,
        dns_names: &[DnsNameRow],
    ) -> Result<(), SinkError> {
        (**self).commit_entry(entry, dns_names)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        (**self).flush()
    }
}

impl<T: Sink + ?Sized> Sink for Box<T> {
    fn highest_committed_index(&mut self) -> Result<Option<LeafIndex>, SinkError> {
        (**self).highest_committed_index()
    }

    fn commit_entry(
        &mut self,
        entry: &EntryRow,
        dns_names: &[DnsNameRow],
    ) -> Result<(), SinkError> {
        (**self).commit_entry(entry, dns_names)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        (**self).flush()
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkKind {
    /// `entries.csv` and `dnsnames.csv` in the given directory.
    Csv { dir: PathBuf },
    /// A single SQLite database file.
    Sqlite { path: PathBuf },
}

/// Open (and recover, if needed) the configured sink.
///
/// # Errors
///
/// Returns an error if the sink could not be opened or its existing content
/// is unusable.
pub fn open_sink(kind: &SinkKind) -> Result<Box<dyn Sink>, SinkError> {
    Ok(match kind {
        SinkKind::Csv { dir } => Box::new(CsvSink::open(dir)?),
        SinkKind::Sqlite { path } => Box::new(SqliteSink::open(path)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_sink() {
        let dir = tempfile::tempdir().unwrap();

        let mut csv = open_sink(&SinkKind::Csv {
            dir: dir.path().join("csv"),
        })
        .unwrap();
        assert_eq!(csv.highest_committed_index().unwrap(), None);
        assert!(dir.path().join("csv").join("entries.csv").exists());

        let mut sqlite = open_sink(&SinkKind::Sqlite {
            path: dir.path().join("ct.db"),
        })
        .unwrap();
        assert_eq!(sqlite.highest_committed_index().unwrap(), None);
    }
}
