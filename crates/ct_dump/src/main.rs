// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! `ct-dump`: copy the entries of a Certificate Transparency log into local
//! CSV files or a SQLite database, resuming where the last run stopped.

mod config;
mod logging;
mod shutdown;

use anyhow::Context;
use clap::Parser;
use config::{Cli, Settings};
use ct_entry::Rfc6962Decoder;
use ct_ingest::{open_sink, HttpLogSource, IngestionRunner, RunOutcome};
use log::{error, info};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

/// Exit status for unusable settings, matching clap's own usage errors.
const USAGE_ERROR: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let settings = match Cli::parse().settings() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("ct-dump: {err:#}");
            return ExitCode::from(USAGE_ERROR);
        }
    };
    if let Err(err) = logging::init(settings.log_level) {
        eprintln!("ct-dump: {err:#}");
        return ExitCode::FAILURE;
    }

    match run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    shutdown::cancel_on_signal(cancel.clone());

    let source = HttpLogSource::new(&settings.log)?;
    let sink = open_sink(&settings.sink)
        .with_context(|| format!("failed to open {:?}", settings.sink))?;
    info!("dumping {} into {:?}", settings.log, settings.sink);

    let mut runner = IngestionRunner::new(source, sink, Rfc6962Decoder, settings.scan, cancel);
    let summary = runner
        .run()
        .await
        .with_context(|| format!("scan of {} failed", settings.log))?;
    if summary.outcome == RunOutcome::Cancelled {
        info!("stopped at {}; the next run resumes there", summary.next_index);
    }
    Ok(())
}
