// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! SQLite sink. One transaction per committed entry.

use super::{DnsNameRow, EntryRow, Sink, SinkError};
use ct_entry::{LeafIndex, UnixTimestamp};
use log::{debug, info};
use rusqlite::{params, Connection};
use std::{fs, path::Path};

/// Bumped whenever `SCHEMA_SQL` changes incompatibly.
const SCHEMA_VERSION: i64 = 1;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS entries (
    idx         INTEGER PRIMARY KEY,
    timestamp   INTEGER NOT NULL,
    is_precert  INTEGER NOT NULL,
    issuer_cn   TEXT NOT NULL,
    issuer_org  TEXT NOT NULL,
    subject_cn  TEXT NOT NULL,
    subject_org TEXT NOT NULL,
    not_before  INTEGER NOT NULL,
    not_after   INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS dnsnames (
    idx      INTEGER NOT NULL,
    dns_name TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS dnsnames_by_idx ON dnsnames (idx);
CREATE INDEX IF NOT EXISTS dnsnames_by_name ON dnsnames (dns_name);
";

pub struct SqliteSink {
    conn: Connection,
}

impl SqliteSink {
    /// Open or create the database at `path`, in WAL mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened, or if it was
    /// created by a newer version with an unknown schema.
    pub fn open(path: &Path) -> Result<Self, SinkError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut conn = Connection::open(path)?;

        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("{}: journal_mode={mode}", path.display());

        let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(SinkError::UnsupportedSchema {
                found: version,
                supported: SCHEMA_VERSION,
            });
        }
        if version < SCHEMA_VERSION {
            info!(
                "{}: migrating schema from version {version} to {SCHEMA_VERSION}",
                path.display()
            );
            let tx = conn.transaction()?;
            tx.execute_batch(SCHEMA_SQL)?;
            tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
            tx.commit()?;
        }

        Ok(Self { conn })
    }
}

impl Sink for SqliteSink {
    fn highest_committed_index(&mut self) -> Result<Option<LeafIndex>, SinkError> {
        let max: Option<i64> =
            self.conn
                .query_row("SELECT MAX(idx) FROM entries", [], |row| row.get(0))?;
        Ok(max.and_then(|idx| LeafIndex::try_from(idx).ok()))
    }

    fn commit_entry(
        &mut self,
        entry: &EntryRow,
        dns_names: &[DnsNameRow],
    ) -> Result<(), SinkError> {
        let idx = i64::try_from(entry.index).map_err(|_| SinkError::IndexOutOfRange(entry.index))?;

        // Dropping the transaction on an early return rolls it back.
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO entries (idx, timestamp, is_precert, issuer_cn, issuer_org, \
             subject_cn, subject_org, not_before, not_after) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                idx,
                sql_time(entry.timestamp),
                entry.is_precert,
                entry.issuer_common_name,
                entry.issuer_organization,
                entry.subject_common_name,
                entry.subject_organization,
                sql_time(entry.not_before),
                sql_time(entry.not_after),
            ],
        )?;
        {
            let mut stmt =
                tx.prepare_cached("INSERT INTO dnsnames (idx, dns_name) VALUES (?1, ?2)")?;
            for row in dns_names {
                stmt.execute(params![idx, row.dns_name])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        // Commits are already durable; fold the WAL back into the database.
        self.conn
            .query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()))?;
        Ok(())
    }
}

fn sql_time(millis: UnixTimestamp) -> i64 {
    i64::try_from(millis).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: LeafIndex) -> EntryRow {
        EntryRow {
            index,
            timestamp: 1_717_200_000_000,
            is_precert: false,
            issuer_common_name: "Example Issuing CA".into(),
            issuer_organization: "Example Trust".into(),
            subject_common_name: format!("host{index}.example.com"),
            subject_organization: "Example Corp".into(),
            not_before: 1_704_067_200_000,
            not_after: 1_735_689_600_000,
        }
    }

    fn dns(index: LeafIndex, names: &[&str]) -> Vec<DnsNameRow> {
        names
            .iter()
            .map(|name| DnsNameRow {
                index,
                dns_name: (*name).to_string(),
            })
            .collect()
    }

    fn dns_count(sink: &SqliteSink, index: LeafIndex) -> i64 {
        sink.conn
            .query_row(
                "SELECT COUNT(*) FROM dnsnames WHERE idx = ?1",
                [i64::try_from(index).unwrap()],
                |row| row.get(0),
            )
            .unwrap()
    }

    #[test]
    fn test_schema_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ct.db");
        {
            let mut sink = SqliteSink::open(&path).unwrap();
            let mode: String = sink
                .conn
                .pragma_query_value(None, "journal_mode", |row| row.get(0))
                .unwrap();
            assert_eq!(mode, "wal");

            assert_eq!(sink.highest_committed_index().unwrap(), None);
            sink.commit_entry(&entry(0), &dns(0, &["a.example", "b.example"]))
                .unwrap();
            sink.commit_entry(&entry(1), &[]).unwrap();
            sink.flush().unwrap();
        }

        let mut sink = SqliteSink::open(&path).unwrap();
        assert_eq!(sink.highest_committed_index().unwrap(), Some(1));
        assert_eq!(dns_count(&sink, 0), 2);
        assert_eq!(dns_count(&sink, 1), 0);

        let (cn, not_after): (String, i64) = sink
            .conn
            .query_row(
                "SELECT subject_cn, not_after FROM entries WHERE idx = 0",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(cn, "host0.example.com");
        assert_eq!(not_after, 1_735_689_600_000);

        let names: Vec<String> = sink
            .conn
            .prepare("SELECT dns_name FROM dnsnames WHERE idx = 0 ORDER BY rowid")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(names, vec!["a.example", "b.example"]);
    }

    #[test]
    fn test_failed_commit_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = SqliteSink::open(&dir.path().join("ct.db")).unwrap();
        sink.commit_entry(&entry(0), &dns(0, &["a.example"])).unwrap();

        // Fail after the entry row and the first DNS row are written.
        sink.conn
            .execute_batch(
                "CREATE TRIGGER fail_dns BEFORE INSERT ON dnsnames
                 WHEN NEW.dns_name = 'boom'
                 BEGIN SELECT RAISE(ABORT, 'injected fault'); END;",
            )
            .unwrap();
        let err = sink
            .commit_entry(&entry(1), &dns(1, &["ok.example", "boom"]))
            .unwrap_err();
        assert!(matches!(err, SinkError::Sqlite(_)));

        assert_eq!(sink.highest_committed_index().unwrap(), Some(0));
        assert_eq!(dns_count(&sink, 1), 0);

        // The sink stays usable.
        sink.conn.execute_batch("DROP TRIGGER fail_dns").unwrap();
        sink.commit_entry(&entry(1), &dns(1, &["ok.example"])).unwrap();
        assert_eq!(sink.highest_committed_index().unwrap(), Some(1));
        assert_eq!(dns_count(&sink, 1), 1);
    }

    #[test]
    fn test_duplicate_index_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = SqliteSink::open(&dir.path().join("ct.db")).unwrap();
        sink.commit_entry(&entry(0), &dns(0, &["a.example"])).unwrap();
        assert!(sink
            .commit_entry(&entry(0), &dns(0, &["dup.example"]))
            .is_err());
        assert_eq!(dns_count(&sink, 0), 1);
    }

    #[test]
    fn test_newer_schema_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ct.db");
        Connection::open(&path)
            .unwrap()
            .pragma_update(None, "user_version", 99)
            .unwrap();
        assert!(matches!(
            SqliteSink::open(&path),
            Err(SinkError::UnsupportedSchema {
                found: 99,
                supported: SCHEMA_VERSION
            })
        ));
    }

    #[test]
    fn test_index_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = SqliteSink::open(&dir.path().join("ct.db")).unwrap();
        assert!(matches!(
            sink.commit_entry(&entry(u64::MAX), &[]),
            Err(SinkError::IndexOutOfRange(u64::MAX))
        ));
    }
}
