// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! SIGINT/SIGTERM handling. The first signal cancels the scan, which stops
//! after the entry being committed; a second one exits immediately.

use log::{error, warn};
use std::{io, process};
use tokio_util::sync::CancellationToken;

/// Exit status used when a second signal forces an exit.
const FORCED_EXIT: i32 = 130;

pub fn cancel_on_signal(cancel: CancellationToken) {
    tokio::spawn(async move {
        if let Err(err) = wait_for_signal().await {
            error!("failed to listen for shutdown signals: {err}");
            return;
        }
        warn!("shutting down, waiting for in-flight requests (signal again to force)");
        cancel.cancel();

        if wait_for_signal().await.is_ok() {
            warn!("forced exit");
            process::exit(FORCED_EXIT);
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> io::Result<()> {
    tokio::signal::ctrl_c().await
}
