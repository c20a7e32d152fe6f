//! The local byte-stream socket between the wrapper and the daemon.
//!
//! The wrapper is a tiny native process: it takes an inter-process file
//! lock and spawns the daemon when no socket answers (retrying the
//! connect exactly once after spawning), then writes one request and
//! reads one reply. The framing is C-style strings:
//!
//! ```text
//! request:  {cwd}\b{arg0}\b{arg1}...\b\0      (\b never occurs in args)
//! reply:    {exit-code-ascii}\0{stdout}\0{stderr}\0
//! ```
//!
//! The daemon quits by itself after fifteen seconds without connections
//! and with no invocation in flight; the next wrapper spawns it again.

use std::io::{BufReader, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{error, info};

use crate::daemon::Daemon;
use crate::invocation::InvocationResult;

/// Where the wrapper looks for the daemon.
pub const DEFAULT_SOCK_PATH: &str = "/tmp/rcc.sock";

const IDLE_QUIT_AFTER: Duration = Duration::from_secs(15);
const IDLE_CHECK_EVERY: Duration = Duration::from_secs(5);

pub struct SockListener {
    daemon: Arc<Daemon>,
    active_connections: Arc<AtomicI32>,
    last_alive: Arc<Mutex<Instant>>,
    sock_path: PathBuf,
}

impl SockListener {
    pub fn new(daemon: Arc<Daemon>, sock_path: &Path) -> Self {
        Self {
            daemon,
            active_connections: Arc::new(AtomicI32::new(0)),
            last_alive: Arc::new(Mutex::new(Instant::now())),
            sock_path: sock_path.to_path_buf(),
        }
    }

    /// Bind the socket. Split from [`run`](Self::run) so the caller can
    /// report readiness to the spawning wrapper in between.
    pub fn bind(&self) -> std::io::Result<UnixListener> {
        let _ = std::fs::remove_file(&self.sock_path);
        UnixListener::bind(&self.sock_path)
    }

    /// Serve until the daemon decides to quit. Never returns normally:
    /// the idle watcher exits the process.
    pub fn run(&self, listener: UnixListener) {
        self.spawn_idle_watcher();

        for connection in listener.incoming() {
            if self.daemon.should_quit() {
                break;
            }
            match connection {
                Ok(stream) => {
                    *self.last_alive.lock().unwrap() = Instant::now();
                    let daemon = Arc::clone(&self.daemon);
                    let active = Arc::clone(&self.active_connections);
                    let last_alive = Arc::clone(&self.last_alive);
                    std::thread::spawn(move || {
                        handle_wrapper_connection(&daemon, stream, &active, &last_alive);
                    });
                }
                Err(e) => error!(error = %e, "accept failed"),
            }
        }
    }

    fn spawn_idle_watcher(&self) {
        let daemon = Arc::clone(&self.daemon);
        let active = Arc::clone(&self.active_connections);
        let last_alive = Arc::clone(&self.last_alive);
        let sock_path = self.sock_path.clone();
        std::thread::Builder::new()
            .name("idle-watcher".to_string())
            .spawn(move || loop {
                std::thread::sleep(IDLE_CHECK_EVERY);
                if daemon.should_quit() {
                    let _ = std::fs::remove_file(&sock_path);
                    std::process::exit(0);
                }
                let idle = last_alive.lock().unwrap().elapsed();
                if active.load(Ordering::SeqCst) == 0 && idle >= IDLE_QUIT_AFTER {
                    info!("no connections for a while, quitting");
                    daemon.quit_gracefully("idle");
                    let _ = std::fs::remove_file(&sock_path);
                    std::process::exit(0);
                }
            })
            .ok();
    }
}

fn handle_wrapper_connection(
    daemon: &Daemon,
    stream: UnixStream,
    active: &AtomicI32,
    last_alive: &Mutex<Instant>,
) {
    let mut reader = BufReader::new(match stream.try_clone() {
        Ok(s) => s,
        Err(_) => return,
    });
    let mut writer = stream;

    let Some((cwd, cmd_line)) = read_wrapper_request(&mut reader) else {
        // `rcc start` probing an already-running daemon sends nothing
        let _ = writer.write_all(b"\0");
        return;
    };

    active.fetch_add(1, Ordering::SeqCst);
    let result = daemon.handle_request(cwd, cmd_line);
    active.fetch_sub(1, Ordering::SeqCst);
    *last_alive.lock().unwrap() = Instant::now();

    let _ = write_wrapper_reply(&mut writer, &result);
}

/// Read `{cwd}\b{arg0}\b...\b\0`; `None` on anything malformed.
fn read_wrapper_request(reader: &mut impl Read) -> Option<(PathBuf, Vec<String>)> {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return None, // EOF before the terminator
            Ok(_) if byte[0] == 0 => break,
            Ok(_) => raw.push(byte[0]),
            Err(_) => return None,
        }
    }

    let text = String::from_utf8(raw).ok()?;
    let mut parts = text.split('\u{8}');
    let cwd = PathBuf::from(parts.next()?);
    let cmd_line: Vec<String> = parts.map(str::to_string).collect();
    // at least a compiler name and one argument
    if cmd_line.len() < 2 {
        return None;
    }
    Some((cwd, cmd_line))
}

fn write_wrapper_reply(writer: &mut impl Write, result: &InvocationResult) -> std::io::Result<()> {
    write!(writer, "{}\0", result.exit_code)?;
    writer.write_all(&result.stdout)?;
    writer.write_all(b"\0")?;
    writer.write_all(&result.stderr)?;
    writer.write_all(b"\0")?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_framing_parses() {
        let raw = b"/work\x08g++\x08-c\x08a.cpp\0trailing ignored";
        let (cwd, cmd) = read_wrapper_request(&mut &raw[..]).unwrap();
        assert_eq!(cwd, PathBuf::from("/work"));
        assert_eq!(cmd, vec!["g++", "-c", "a.cpp"]);
    }

    #[test]
    fn short_or_empty_requests_are_rejected() {
        assert!(read_wrapper_request(&mut &b"\0"[..]).is_none());
        assert!(read_wrapper_request(&mut &b"/work\x08g++\0"[..]).is_none());
        assert!(read_wrapper_request(&mut &b"no terminator"[..]).is_none());
    }

    #[test]
    fn reply_framing() {
        let result = InvocationResult {
            exit_code: 3,
            stdout: b"out".to_vec(),
            stderr: b"err".to_vec(),
            duration_ms: 0,
        };
        let mut wire = Vec::new();
        write_wrapper_reply(&mut wire, &result).unwrap();
        assert_eq!(wire, b"3\0out\0err\0");
    }
}
