//! One live compile request inside the daemon.
//!
//! An `Invocation` is born when a wrapper connection hands over a command
//! line, maps one-to-one to a worker session while compiling remotely,
//! and dies with the reply. It carries the two synchronization points the
//! remote flow blocks on — outstanding uploads and object reception — and
//! an idempotent force-interrupt that releases both with an error.

use std::path::PathBuf;
use std::sync::{Condvar, Mutex};
use std::time::Instant;

use crate::classify::ParsedInvocation;

/// Accumulated result of a compile, remote or local.
#[derive(Debug, Clone, Default)]
pub struct InvocationResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration_ms: u32,
}

#[derive(Default)]
struct WaitState {
    /// Files the worker asked for that are not yet acknowledged.
    uploads_left: usize,
    /// Latched once the object (or the compile error) arrived.
    recv_done: bool,
    /// First transport-level error; compiler failures never land here.
    error: Option<String>,
    result: InvocationResult,
}

pub struct Invocation {
    pub session_id: u32,
    pub created_at: Instant,
    pub cwd: PathBuf,
    pub parsed: ParsedInvocation,
    /// Worker host this invocation was pinned to, for log lines.
    pub remote_host: Mutex<String>,

    state: Mutex<WaitState>,
    cond: Condvar,
}

impl Invocation {
    pub fn new(session_id: u32, cwd: PathBuf, parsed: ParsedInvocation) -> Self {
        Self {
            session_id,
            created_at: Instant::now(),
            cwd,
            parsed,
            remote_host: Mutex::new(String::new()),
            state: Mutex::new(WaitState::default()),
            cond: Condvar::new(),
        }
    }

    pub fn expect_uploads(&self, n: usize) {
        self.state.lock().unwrap().uploads_left += n;
    }

    /// One upload finished (or failed). The last one releases
    /// [`wait_uploads`](Self::wait_uploads).
    pub fn upload_done(&self, error: Option<String>) {
        let mut state = self.state.lock().unwrap();
        if let Some(e) = error {
            state.error.get_or_insert(e);
        }
        state.uploads_left = state.uploads_left.saturating_sub(1);
        if state.uploads_left == 0 {
            self.cond.notify_all();
        }
    }

    /// Block until every requested upload is acknowledged; returns the
    /// first recorded error.
    pub fn wait_uploads(&self) -> Result<(), String> {
        let mut state = self.state.lock().unwrap();
        while state.uploads_left > 0 {
            state = self.cond.wait(state).unwrap();
        }
        match &state.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    pub fn set_result(&self, result: InvocationResult) {
        self.state.lock().unwrap().result = result;
    }

    /// The object arrived, or reception failed. Idempotent: the first
    /// call wins, later calls (force-interrupt racing a late chunk) are
    /// ignored.
    pub fn recv_done(&self, error: Option<String>) {
        let mut state = self.state.lock().unwrap();
        if state.recv_done {
            return;
        }
        state.recv_done = true;
        if let Some(e) = error {
            state.error.get_or_insert(e);
        }
        self.cond.notify_all();
    }

    /// Block until the object (or an error) arrived; returns the result
    /// or the first recorded error.
    pub fn wait_recv(&self) -> Result<InvocationResult, String> {
        let mut state = self.state.lock().unwrap();
        while !state.recv_done {
            state = self.cond.wait(state).unwrap();
        }
        match &state.error {
            Some(e) => Err(e.clone()),
            None => Ok(state.result.clone()),
        }
    }

    /// Cancel everything this invocation is waiting on. Used by the
    /// timeout sweeper and daemon shutdown; safe to call any number of
    /// times and concurrently with normal completion.
    pub fn force_interrupt(&self, error: String) {
        let mut state = self.state.lock().unwrap();
        state.error.get_or_insert(error);
        state.uploads_left = 0;
        state.recv_done = true;
        self.cond.notify_all();
    }

    pub fn has_failed(&self) -> bool {
        self.state.lock().unwrap().error.is_some()
    }
}

/// The daemon-wide table of in-flight invocations, keyed by session id.
/// Receive-stream threads dispatch incoming chunks through it; the
/// timeout sweeper walks it.
#[derive(Default)]
pub struct ActiveInvocations {
    map: std::sync::RwLock<std::collections::HashMap<u32, std::sync::Arc<Invocation>>>,
}

impl ActiveInvocations {
    pub fn insert(&self, invocation: std::sync::Arc<Invocation>) {
        self.map.write().unwrap().insert(invocation.session_id, invocation);
    }

    pub fn remove(&self, session_id: u32) {
        self.map.write().unwrap().remove(&session_id);
    }

    pub fn get(&self, session_id: u32) -> Option<std::sync::Arc<Invocation>> {
        self.map.read().unwrap().get(&session_id).cloned()
    }

    pub fn count(&self) -> usize {
        self.map.read().unwrap().len()
    }

    pub fn snapshot(&self) -> Vec<std::sync::Arc<Invocation>> {
        self.map.read().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::parse_invocation;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    fn invocation() -> Arc<Invocation> {
        let args: Vec<String> =
            ["g++", "-o", "a.o", "-c", "a.cpp"].iter().map(|s| s.to_string()).collect();
        let parsed = parse_invocation(Path::new("/work"), &args).unwrap();
        Arc::new(Invocation::new(1, PathBuf::from("/work"), parsed))
    }

    #[test]
    fn uploads_release_after_the_last_ack() {
        let inv = invocation();
        inv.expect_uploads(2);
        let waiter = {
            let inv = inv.clone();
            std::thread::spawn(move || inv.wait_uploads())
        };
        inv.upload_done(None);
        std::thread::sleep(Duration::from_millis(5));
        inv.upload_done(None);
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn upload_error_is_reported_after_all_acks() {
        let inv = invocation();
        inv.expect_uploads(2);
        inv.upload_done(Some("stream broke".into()));
        inv.upload_done(None);
        assert_eq!(inv.wait_uploads().unwrap_err(), "stream broke");
    }

    #[test]
    fn recv_carries_the_result() {
        let inv = invocation();
        inv.set_result(InvocationResult {
            exit_code: 2,
            stdout: b"out".to_vec(),
            stderr: b"err".to_vec(),
            duration_ms: 17,
        });
        inv.recv_done(None);
        let result = inv.wait_recv().unwrap();
        assert_eq!(result.exit_code, 2);
        assert_eq!(result.stderr, b"err");
    }

    #[test]
    fn force_interrupt_is_idempotent_and_wins_once() {
        let inv = invocation();
        inv.expect_uploads(5);
        inv.force_interrupt("timed out".into());
        inv.force_interrupt("second call".into());
        assert_eq!(inv.wait_uploads().unwrap_err(), "timed out");
        assert_eq!(inv.wait_recv().unwrap_err(), "timed out");
        // a late normal completion does not resurrect it
        inv.recv_done(None);
        assert!(inv.has_failed());
    }
}
