//! Logger setup with a reopenable file sink.
//!
//! Logs go to stderr or to `--log-file`. The file handle sits behind a
//! shared mutex so a SIGHUP (sent by logrotate after moving the file
//! aside) can reopen it without restarting the worker.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;

enum LogSink {
    Stderr,
    File { file: File, path: PathBuf },
}

/// Cloneable handle to the active log destination.
#[derive(Clone)]
pub struct LogWriter {
    sink: Arc<Mutex<LogSink>>,
}

impl LogWriter {
    pub fn stderr() -> Self {
        Self { sink: Arc::new(Mutex::new(LogSink::Stderr)) }
    }

    pub fn file(path: PathBuf) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { sink: Arc::new(Mutex::new(LogSink::File { file, path })) })
    }

    /// Close and reopen the log file (logrotate integration). A no-op for
    /// the stderr sink.
    pub fn reopen(&self) -> io::Result<()> {
        let mut sink = self.sink.lock().unwrap();
        if let LogSink::File { file, path } = &mut *sink {
            *file = OpenOptions::new().create(true).append(true).open(path)?;
        }
        Ok(())
    }

    /// Current size of the log file, `-1` when logging to stderr.
    pub fn file_size(&self) -> i64 {
        match &*self.sink.lock().unwrap() {
            LogSink::Stderr => -1,
            LogSink::File { path, .. } => {
                std::fs::metadata(path).map(|m| m.len() as i64).unwrap_or(-1)
            }
        }
    }

    pub fn file_path(&self) -> Option<PathBuf> {
        match &*self.sink.lock().unwrap() {
            LogSink::Stderr => None,
            LogSink::File { path, .. } => Some(path.clone()),
        }
    }
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut *self.sink.lock().unwrap() {
            LogSink::Stderr => io::stderr().write(buf),
            LogSink::File { file, .. } => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut *self.sink.lock().unwrap() {
            LogSink::Stderr => io::stderr().flush(),
            LogSink::File { file, .. } => file.flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for LogWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Map the numeric verbosity flag to a level filter: `-1` errors only,
/// `0` info, `1` debug, `2` and up trace.
pub fn level_for_verbosity(verbosity: i32) -> LevelFilter {
    match verbosity {
        i32::MIN..=-1 => LevelFilter::ERROR,
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Install the global subscriber. Returns the writer handle for reopening
/// and size queries.
pub fn init(log_file: Option<PathBuf>, verbosity: i32) -> io::Result<LogWriter> {
    let writer = match log_file {
        Some(path) => LogWriter::file(path)?,
        None => LogWriter::stderr(),
    };
    tracing_subscriber::fmt()
        .with_max_level(level_for_verbosity(verbosity))
        .with_writer(writer.clone())
        .with_ansi(false)
        .init();
    Ok(writer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_sink_survives_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.log");
        let mut writer = LogWriter::file(path.clone()).unwrap();
        writer.write_all(b"before\n").unwrap();

        // simulate logrotate: move the file aside, then reopen
        std::fs::rename(&path, dir.path().join("w.log.1")).unwrap();
        writer.reopen().unwrap();
        writer.write_all(b"after\n").unwrap();
        writer.flush().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"after\n");
        assert_eq!(
            std::fs::read(dir.path().join("w.log.1")).unwrap(),
            b"before\n"
        );
        assert_eq!(writer.file_size(), 6);
    }

    #[test]
    fn verbosity_mapping() {
        assert_eq!(level_for_verbosity(-1), LevelFilter::ERROR);
        assert_eq!(level_for_verbosity(0), LevelFilter::INFO);
        assert_eq!(level_for_verbosity(1), LevelFilter::DEBUG);
        assert_eq!(level_for_verbosity(5), LevelFilter::TRACE);
    }
}
