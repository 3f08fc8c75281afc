use std::fs::OpenOptions;
use std::io;
use std::path::Path;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

pub type FileFmtLayer =
    fmt::Layer<tracing_subscriber::Registry, fmt::format::DefaultFields, fmt::format::Format, BoxMakeWriter>;

pub type LogReloadHandle = reload::Handle<FileFmtLayer, tracing_subscriber::Registry>;

const DEFAULT_LOG_FILTER: &str = "info";
pub const ENV_VAR_LOG_FILE: &str = "NIPBR_LOG_FILE";

/// Creates a [`FileFmtLayer`] appending to the file at `log_path`.
///
/// Also used to reopen the log file after external rotation, in which case
/// the daemon receives `SIGHUP` and swaps the layer through a
/// [`LogReloadHandle`].
pub fn make_file_fmt_layer(log_path: &Path) -> io::Result<FileFmtLayer> {
    let file = OpenOptions::new().create(true).append(true).open(log_path)?;
    Ok(fmt::layer().with_writer(BoxMakeWriter::new(file)).with_ansi(false))
}

/// Initializes the global `tracing` subscriber with a reloadable file layer.
///
/// Verbosity is read from `RUST_LOG` and defaults to `"info"`.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn setup_log_file(log_path: &Path) -> io::Result<LogReloadHandle> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (reload_layer, reload_handle): (
        reload::Layer<FileFmtLayer, tracing_subscriber::Registry>,
        LogReloadHandle,
    ) = reload::Layer::new(make_file_fmt_layer(log_path)?);
    tracing_subscriber::registry().with(reload_layer).with(filter).init();
    tracing::debug!(log_file = %log_path.display(), "logging initialized with file output");
    Ok(reload_handle)
}

/// Initializes the global `tracing` subscriber writing to stdout.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn setup_stdout() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(fmt::layer().with_ansi(true))
        .with(filter)
        .init();
    tracing::debug!("logging initialized with stdout/stderr output");
}

/// Reopens the log file behind `handle`, e.g. after rotation.
pub fn reopen_log_file(handle: &LogReloadHandle, log_path: &Path) -> io::Result<()> {
    let layer = make_file_fmt_layer(log_path)?;
    handle
        .reload(layer)
        .map_err(|e| io::Error::other(format!("unable to swap log layer: {e}")))?;
    tracing::info!(log_file = %log_path.display(), "log file reopened");
    Ok(())
}
