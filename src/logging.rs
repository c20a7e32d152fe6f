//! Logger setup for the daemon and the management commands.
//!
//! The daemon is short-lived and its log file needs no rotation hooks;
//! stderr or a plain append-mode file is all there is to it.

use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::level_filters::LevelFilter;

/// `-1` errors only, `0` info, `1` debug, `2`+ trace.
pub fn level_for_verbosity(verbosity: i32) -> LevelFilter {
    match verbosity {
        i32::MIN..=-1 => LevelFilter::ERROR,
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Install the global subscriber, to stderr or an append-mode file.
pub fn init(log_file: Option<PathBuf>, verbosity: i32) -> io::Result<()> {
    let level = level_for_verbosity(verbosity);
    match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(io::stderr)
                .with_ansi(false)
                .init();
        }
    }
    Ok(())
}
