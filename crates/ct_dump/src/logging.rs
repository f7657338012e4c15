// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

use anyhow::Context;
use log::LevelFilter;
use std::io;

/// Log to stderr at `level`.
pub fn init(level: LevelFilter) -> anyhow::Result<()> {
    dispatch(level)
        .chain(io::stderr())
        .apply()
        .context("failed to initialize logging")
}

fn dispatch(level: LevelFilter) -> fern::Dispatch {
    // The HTTP stack is chatty below warn.
    let framework_level = level.min(LevelFilter::Warn);

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} {}:{} [{}] {}",
                chrono::Local::now().format("%Y/%m/%d %H:%M:%S%.6f"),
                record.file().unwrap_or_else(|| record.target()),
                record.line().unwrap_or(0),
                record.level(),
                message
            ));
        })
        .level(level)
        .level_for("h2", framework_level)
        .level_for("hyper", framework_level)
        .level_for("hyper_util", framework_level)
        .level_for("reqwest", framework_level)
        .level_for("rustls", framework_level)
}
