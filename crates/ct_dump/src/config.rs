// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Command-line flags, the optional JSON config file, and how they combine.
//! A flag given on the command line (or through its environment variable)
//! always wins over the same setting in the file. `--end`, `--follow` and
//! `--no-follow` all override the file's choice of scan target.

use anyhow::{bail, ensure, Context};
use clap::{Parser, ValueEnum};
use ct_ingest::{
    FetchOptions, RetryPolicy, ScanOptions, ScanTarget, SinkKind, DEFAULT_BATCH_SIZE,
    DEFAULT_POLL_INTERVAL, DEFAULT_PROGRESS_INTERVAL,
};
use log::LevelFilter;
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use url::Url;

const DEFAULT_LOG: &str = "http://ct.googleapis.com/pilot";
const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_DATABASE: &str = "ct.db";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkFormat {
    /// entries.csv and dnsnames.csv in the data directory
    #[default]
    Csv,
    /// A SQLite database
    Sqlite,
}

#[derive(Parser, Debug)]
#[command(name = "ct-dump")]
#[command(about = "Dump the entries of a Certificate Transparency log to local storage")]
#[command(version)]
pub struct Cli {
    /// Base URL of the CT log
    #[arg(long, env = "CT_DUMP_LOG")]
    pub log: Option<Url>,

    /// Index to start from when the output is empty
    #[arg(long)]
    pub start: Option<u64>,

    /// Stop before this index (at most the tree size)
    #[arg(long, conflicts_with = "follow")]
    pub end: Option<u64>,

    /// Output directory
    #[arg(long, env = "CT_DUMP_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, value_enum)]
    pub sink: Option<SinkFormat>,

    /// SQLite database path [default: <DATA_DIR>/ct.db]
    #[arg(long)]
    pub database: Option<PathBuf>,

    /// Entries per get-entries request [default: 5000]
    #[arg(long)]
    pub batch_size: Option<u64>,

    /// Concurrent get-entries requests [default: number of CPUs]
    #[arg(long)]
    pub parallelism: Option<usize>,

    /// Keep polling for new entries after reaching the tree size
    #[arg(long, overrides_with = "no_follow")]
    pub follow: bool,

    /// Stop at the tree size even if the config file asks to follow
    #[arg(long, overrides_with = "follow")]
    pub no_follow: bool,

    /// Seconds between tree size polls in follow mode [default: 30]
    #[arg(long, value_name = "SECONDS")]
    pub poll_interval: Option<u64>,

    /// Attempts per request before giving up [default: 8]
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Seconds between progress reports [default: 10]
    #[arg(long, value_name = "SECONDS")]
    pub progress_interval: Option<u64>,

    /// off, error, warn, info, debug or trace [default: info]
    #[arg(long, env = "CT_DUMP_LOG_LEVEL")]
    pub log_level: Option<LevelFilter>,

    /// JSON file with defaults for any of the settings above
    #[arg(long, env = "CT_DUMP_CONFIG")]
    pub config: Option<PathBuf>,
}

/// The config file. Every field is optional.
#[derive(Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub log: Option<String>,
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub data_dir: Option<PathBuf>,
    pub sink: Option<SinkFormat>,
    pub database: Option<PathBuf>,
    pub batch_size: Option<u64>,
    pub parallelism: Option<usize>,
    pub follow: Option<bool>,
    pub poll_interval_secs: Option<u64>,
    pub max_attempts: Option<u32>,
    pub progress_interval_secs: Option<u64>,
    pub log_level: Option<String>,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

/// Fully resolved settings.
#[derive(Debug)]
pub struct Settings {
    pub log: Url,
    pub sink: SinkKind,
    pub scan: ScanOptions,
    pub log_level: LevelFilter,
}

impl Cli {
    /// Merge the flags with the config file, if any, and validate the
    /// result.
    pub fn settings(self) -> anyhow::Result<Settings> {
        let file = match &self.config {
            Some(path) => AppConfig::load(path)?,
            None => AppConfig::default(),
        };
        self.merge(file)
    }

    fn merge(self, file: AppConfig) -> anyhow::Result<Settings> {
        let log = match (self.log, file.log) {
            (Some(url), _) => url,
            (None, Some(url)) => {
                Url::parse(&url).with_context(|| format!("invalid log URL {url:?}"))?
            }
            (None, None) => Url::parse(DEFAULT_LOG)?,
        };
        ensure!(
            matches!(log.scheme(), "http" | "https"),
            "log URL must be http or https: {log}"
        );

        // Either of --end or --no-follow turns off a follow from the file,
        // and --follow drops an end from the file.
        let follow = if self.follow {
            true
        } else if self.no_follow || self.end.is_some() {
            false
        } else {
            file.follow.unwrap_or(false)
        };
        let end = if self.follow {
            self.end
        } else {
            self.end.or(file.end)
        };
        let target = match (follow, end) {
            (true, Some(_)) => bail!("--follow and --end cannot be used together"),
            (true, None) => ScanTarget::Follow {
                poll_interval: self
                    .poll_interval
                    .or(file.poll_interval_secs)
                    .map_or(DEFAULT_POLL_INTERVAL, Duration::from_secs),
            },
            (false, Some(end)) => ScanTarget::Until(end),
            (false, None) => ScanTarget::TreeSize,
        };

        let defaults = FetchOptions::default();
        let batch_size = self
            .batch_size
            .or(file.batch_size)
            .unwrap_or(DEFAULT_BATCH_SIZE);
        ensure!(batch_size >= 1, "batch size must be at least 1");
        let parallelism = self
            .parallelism
            .or(file.parallelism)
            .unwrap_or(defaults.parallelism);
        ensure!(parallelism >= 1, "parallelism must be at least 1");
        let max_attempts = self
            .max_attempts
            .or(file.max_attempts)
            .unwrap_or(defaults.retry.max_attempts);
        ensure!(max_attempts >= 1, "max attempts must be at least 1");

        let data_dir = self
            .data_dir
            .or(file.data_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        let sink = match self.sink.or(file.sink).unwrap_or_default() {
            SinkFormat::Csv => SinkKind::Csv { dir: data_dir },
            SinkFormat::Sqlite => SinkKind::Sqlite {
                path: self
                    .database
                    .or(file.database)
                    .unwrap_or_else(|| data_dir.join(DEFAULT_DATABASE)),
            },
        };

        let log_level = match (self.log_level, file.log_level) {
            (Some(level), _) => level,
            (None, Some(level)) => level
                .parse()
                .with_context(|| format!("invalid log level {level:?}"))?,
            (None, None) => LevelFilter::Info,
        };

        Ok(Settings {
            log,
            sink,
            scan: ScanOptions {
                start: self.start.or(file.start),
                target,
                fetch: FetchOptions {
                    batch_size,
                    parallelism,
                    retry: RetryPolicy {
                        max_attempts,
                        ..defaults.retry
                    },
                },
                progress_interval: self
                    .progress_interval
                    .or(file.progress_interval_secs)
                    .map_or(DEFAULT_PROGRESS_INTERVAL, Duration::from_secs),
            },
            log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("ct-dump").chain(args.iter().copied())).unwrap()
    }

    fn settings(args: &[&str]) -> anyhow::Result<Settings> {
        cli(args).merge(AppConfig::default())
    }

    #[test]
    fn test_command() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let s = settings(&["--log", "https://ct.example.com/2025h1"]).unwrap();
        assert_eq!(s.log.as_str(), "https://ct.example.com/2025h1");
        assert_eq!(
            s.sink,
            SinkKind::Csv {
                dir: PathBuf::from("data")
            }
        );
        assert_eq!(s.scan.start, None);
        assert_eq!(s.scan.target, ScanTarget::TreeSize);
        assert_eq!(s.scan.fetch.batch_size, 5000);
        assert!(s.scan.fetch.parallelism >= 1);
        assert_eq!(s.scan.progress_interval, DEFAULT_PROGRESS_INTERVAL);
    }

    #[test]
    fn test_flags() {
        let s = settings(&[
            "--log",
            "https://ct.example.com/",
            "--start",
            "100",
            "--end",
            "200",
            "--sink",
            "sqlite",
            "--data-dir",
            "/tmp/out",
            "--batch-size",
            "256",
            "--parallelism",
            "4",
            "--max-attempts",
            "2",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(s.scan.start, Some(100));
        assert_eq!(s.scan.target, ScanTarget::Until(200));
        assert_eq!(
            s.sink,
            SinkKind::Sqlite {
                path: PathBuf::from("/tmp/out/ct.db")
            }
        );
        assert_eq!(s.scan.fetch.batch_size, 256);
        assert_eq!(s.scan.fetch.parallelism, 4);
        assert_eq!(s.scan.fetch.retry.max_attempts, 2);
        assert_eq!(s.log_level, LevelFilter::Debug);
    }

    #[test]
    fn test_follow() {
        let s = settings(&["--follow", "--poll-interval", "5"]).unwrap();
        assert_eq!(
            s.scan.target,
            ScanTarget::Follow {
                poll_interval: Duration::from_secs(5)
            }
        );
        assert!(Cli::try_parse_from(["ct-dump", "--follow", "--end", "10"]).is_err());
    }

    #[test]
    fn test_validation() {
        assert!(settings(&["--batch-size", "0"]).is_err());
        assert!(settings(&["--parallelism", "0"]).is_err());
        assert!(settings(&["--max-attempts", "0"]).is_err());
        assert!(settings(&["--log", "ftp://ct.example.com/"]).is_err());
        assert!(Cli::try_parse_from(["ct-dump", "--log", "not a url"]).is_err());
        assert!(Cli::try_parse_from(["ct-dump", "--sink", "parquet"]).is_err());
    }

    #[test]
    fn test_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ct-dump.json");
        fs::write(
            &path,
            r#"{
                "log": "https://ct.example.com/2025h2",
                "sink": "sqlite",
                "database": "/var/lib/ct/2025h2.db",
                "batch_size": 1000,
                "follow": true,
                "poll_interval_secs": 60,
                "log_level": "warn"
            }"#,
        )
        .unwrap();

        let s = cli(&["--config", path.to_str().unwrap(), "--batch-size", "10"])
            .settings()
            .unwrap();
        assert_eq!(s.log.as_str(), "https://ct.example.com/2025h2");
        assert_eq!(
            s.sink,
            SinkKind::Sqlite {
                path: PathBuf::from("/var/lib/ct/2025h2.db")
            }
        );
        // The flag wins over the file.
        assert_eq!(s.scan.fetch.batch_size, 10);
        assert_eq!(
            s.scan.target,
            ScanTarget::Follow {
                poll_interval: Duration::from_secs(60)
            }
        );
        assert_eq!(s.log_level, LevelFilter::Warn);
    }

    #[test]
    fn test_flags_override_file_follow() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ct-dump.json");
        let config = path.to_str().unwrap();

        fs::write(&path, r#"{"follow": true}"#).unwrap();
        let s = cli(&["--config", config, "--no-follow"]).settings().unwrap();
        assert_eq!(s.scan.target, ScanTarget::TreeSize);
        let s = cli(&["--config", config, "--end", "10"]).settings().unwrap();
        assert_eq!(s.scan.target, ScanTarget::Until(10));
        let s = cli(&["--config", config]).settings().unwrap();
        assert!(matches!(s.scan.target, ScanTarget::Follow { .. }));

        fs::write(&path, r#"{"end": 10}"#).unwrap();
        let s = cli(&["--config", config, "--follow"]).settings().unwrap();
        assert!(matches!(s.scan.target, ScanTarget::Follow { .. }));

        // The last of --follow and --no-follow wins.
        let s = settings(&["--follow", "--no-follow"]).unwrap();
        assert_eq!(s.scan.target, ScanTarget::TreeSize);
        let s = settings(&["--no-follow", "--follow"]).unwrap();
        assert!(matches!(s.scan.target, ScanTarget::Follow { .. }));
    }

    #[test]
    fn test_bad_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ct-dump.json");

        fs::write(&path, r#"{"batch_sise": 10}"#).unwrap();
        assert!(AppConfig::load(&path).is_err());

        fs::write(&path, r#"{"follow": true, "end": 10}"#).unwrap();
        let config = AppConfig::load(&path).unwrap();
        assert!(cli(&[]).merge(config).is_err());

        assert!(AppConfig::load(&dir.path().join("missing.json")).is_err());
    }
}
