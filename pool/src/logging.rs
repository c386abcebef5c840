//! Log setup (§6 Environment: "logs written to `logs/{info,error,share,block}.log`").
//!
//! Four non-rotating `tracing-appender` file layers plus a stdout layer.
//! `share.log` and `block.log` are populated by the two call sites tagged
//! `target: "share"` / `target: "block"` (accepted shares, new minimum
//! block candidates, confirmed rewards); everything else lands in
//! `info.log`, and anything at `ERROR` level is additionally duplicated
//! into `error.log`.

use tracing_subscriber::filter::{filter_fn, LevelFilter};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. Returns the appender guards; these must
/// be held for the process lifetime or buffered log lines are lost on exit.
pub fn init(log_dir: &str) -> Vec<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(log_dir).ok();

    let mut guards = Vec::with_capacity(4);

    let stdout_layer = layer().with_target(false);

    let (info_writer, info_guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, "info.log"));
    guards.push(info_guard);
    let info_layer = layer()
        .with_writer(info_writer)
        .with_ansi(false)
        .with_filter(filter_fn(|meta| meta.target() != "share" && meta.target() != "block"));

    let (error_writer, error_guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, "error.log"));
    guards.push(error_guard);
    let error_layer = layer()
        .with_writer(error_writer)
        .with_ansi(false)
        .with_filter(LevelFilter::ERROR);

    let (share_writer, share_guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, "share.log"));
    guards.push(share_guard);
    let share_layer = layer()
        .with_writer(share_writer)
        .with_ansi(false)
        .with_filter(filter_fn(|meta| meta.target() == "share"));

    let (block_writer, block_guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, "block.log"));
    guards.push(block_guard);
    let block_layer = layer()
        .with_writer(block_writer)
        .with_ansi(false)
        .with_filter(filter_fn(|meta| meta.target() == "block"));

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(info_layer)
        .with(error_layer)
        .with(share_layer)
        .with(block_layer)
        .init();

    guards
}
