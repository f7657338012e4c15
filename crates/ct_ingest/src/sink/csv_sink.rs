// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Flat-file sink: `entries.csv` and `dnsnames.csv`, both append-only and
//! headerless, with the log index as the first (unquoted) field.
//!
//! Commit protocol: an entry's DNS rows are written and flushed first, then
//! the entry row. The entry row is the commit marker. Fields never contain a
//! raw line break (CR and LF are escaped as `\r` and `\n`), so a record is
//! exactly one line and a line without a terminating newline is torn.
//!
//! On open, recovery truncates any torn line at the end of either file and
//! drops trailing DNS rows whose index has no committed entry row.

use super::{DnsNameRow, EntryRow, Sink, SinkError};
use chrono::{DateTime, SecondsFormat, Utc};
use csv::{QuoteStyle, Terminator, WriterBuilder};
use ct_entry::{LeafIndex, UnixTimestamp};
use log::{info, warn};
use serde::Serialize;
use std::{
    borrow::Cow,
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom},
    path::Path,
};

pub const ENTRIES_FILE: &str = "entries.csv";
pub const DNS_NAMES_FILE: &str = "dnsnames.csv";

const READ_CHUNK: u64 = 8192;

#[derive(Serialize)]
struct EntryRecord<'a> {
    index: LeafIndex,
    issuer_common_name: Cow<'a, str>,
    issuer_organization: Cow<'a, str>,
    subject_common_name: Cow<'a, str>,
    subject_organization: Cow<'a, str>,
    is_precert: u8,
    not_before: String,
    not_after: String,
    timestamp: String,
}

impl<'a> From<&'a EntryRow> for EntryRecord<'a> {
    fn from(row: &'a EntryRow) -> Self {
        Self {
            index: row.index,
            issuer_common_name: one_line(&row.issuer_common_name),
            issuer_organization: one_line(&row.issuer_organization),
            subject_common_name: one_line(&row.subject_common_name),
            subject_organization: one_line(&row.subject_organization),
            is_precert: u8::from(row.is_precert),
            not_before: rfc3339(row.not_before),
            not_after: rfc3339(row.not_after),
            timestamp: rfc3339(row.timestamp),
        }
    }
}

#[derive(Serialize)]
struct DnsNameRecord<'a> {
    index: LeafIndex,
    dns_name: Cow<'a, str>,
}

pub struct CsvSink {
    entries: csv::Writer<File>,
    dns_names: csv::Writer<File>,
    last_committed: Option<LeafIndex>,
}

impl CsvSink {
    /// Open the sink in `dir`, creating the directory and files as needed
    /// and recovering from an interrupted commit.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be opened or repaired, or if the
    /// last complete entry row has no parseable index.
    pub fn open(dir: &Path) -> Result<Self, SinkError> {
        fs::create_dir_all(dir)?;

        let entries_path = dir.join(ENTRIES_FILE);
        let mut entries = open_rw(&entries_path)?;
        let last_committed = match truncate_tail(&mut entries, &entries_path, |_| true)? {
            Some(line) => Some(parse_index(&line).ok_or_else(|| SinkError::Corrupt {
                path: entries_path.clone(),
                reason: format!(
                    "last row has no index: {:?}",
                    String::from_utf8_lossy(&line)
                ),
            })?),
            None => None,
        };

        let dns_path = dir.join(DNS_NAMES_FILE);
        let mut dns_names = open_rw(&dns_path)?;
        truncate_tail(&mut dns_names, &dns_path, |line| match parse_index(line) {
            Some(index) => last_committed.is_some_and(|last| index <= last),
            None => true,
        })?;

        entries.seek(SeekFrom::End(0))?;
        dns_names.seek(SeekFrom::End(0))?;

        if let Some(last) = last_committed {
            info!("{}: last committed entry is {last}", dir.display());
        }
        Ok(Self {
            entries: writer(entries),
            dns_names: writer(dns_names),
            last_committed,
        })
    }
}

impl Sink for CsvSink {
    fn highest_committed_index(&mut self) -> Result<Option<LeafIndex>, SinkError> {
        Ok(self.last_committed)
    }

    fn commit_entry(
        &mut self,
        entry: &EntryRow,
        dns_names: &[DnsNameRow],
    ) -> Result<(), SinkError> {
        for row in dns_names {
            self.dns_names.serialize(DnsNameRecord {
                index: row.index,
                dns_name: one_line(&row.dns_name),
            })?;
        }
        self.dns_names.flush()?;

        self.entries.serialize(EntryRecord::from(entry))?;
        self.entries.flush()?;

        self.last_committed = Some(entry.index);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.dns_names.flush()?;
        self.entries.flush()?;
        self.dns_names.get_ref().sync_data()?;
        self.entries.get_ref().sync_data()?;
        Ok(())
    }
}

fn open_rw(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

fn writer(file: File) -> csv::Writer<File> {
    WriterBuilder::new()
        .has_headers(false)
        .quote_style(QuoteStyle::NonNumeric)
        .terminator(Terminator::Any(b'\n'))
        .from_writer(file)
}

/// Escape line breaks so every row stays on one line. Backslashes are
/// escaped first, which keeps the mapping reversible.
fn one_line(s: &str) -> Cow<'_, str> {
    if s.contains(['\\', '\n', '\r']) {
        Cow::Owned(
            s.replace('\\', "\\\\")
                .replace('\n', "\\n")
                .replace('\r', "\\r"),
        )
    } else {
        Cow::Borrowed(s)
    }
}

fn rfc3339(millis: UnixTimestamp) -> String {
    i64::try_from(millis)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map_or_else(String::new, |t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn parse_index(line: &[u8]) -> Option<LeafIndex> {
    let field = line.split(|&b| b == b',').next()?;
    std::str::from_utf8(field).ok()?.parse().ok()
}

/// Truncate the file after its last newline, then keep dropping complete
/// lines from the end while `keep` rejects them. Returns the last line that
/// remains, without its newline.
fn truncate_tail(
    file: &mut File,
    path: &Path,
    mut keep: impl FnMut(&[u8]) -> bool,
) -> io::Result<Option<Vec<u8>>> {
    let len = file.seek(SeekFrom::End(0))?;
    let mut end = len;
    let mut last_line = None;

    // `end` is always just past a newline or at 0 after the first pass.
    let mut newline = find_prev_newline(file, end)?;
    end = newline.map_or(0, |pos| pos + 1);
    while let Some(pos) = newline {
        let prev = find_prev_newline(file, pos)?;
        let start = prev.map_or(0, |p| p + 1);
        let mut line = vec![0; usize::try_from(pos - start).map_err(io::Error::other)?];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut line)?;
        if keep(&line) {
            last_line = Some(line);
            break;
        }
        end = start;
        newline = prev;
    }

    if end < len {
        warn!(
            "{}: dropping {} bytes of uncommitted data",
            path.display(),
            len - end
        );
        file.set_len(end)?;
    }
    Ok(last_line)
}

/// Position of the last `\n` strictly before `before`.
fn find_prev_newline(file: &mut File, before: u64) -> io::Result<Option<u64>> {
    let mut buf = [0; READ_CHUNK as usize];
    let mut end = before;
    while end > 0 {
        let start = end.saturating_sub(READ_CHUNK);
        let chunk = &mut buf[..usize::try_from(end - start).map_err(io::Error::other)?];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(chunk)?;
        if let Some(i) = chunk.iter().rposition(|&b| b == b'\n') {
            return Ok(Some(start + i as u64));
        }
        end = start;
    }
    Ok(None)
}
