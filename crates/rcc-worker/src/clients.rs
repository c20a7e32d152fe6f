//! Connected clients and their per-file upload state machines.
//!
//! One running daemon == one client id == one [`Client`] record here. All
//! compile processes on that machine share the record: their dependency
//! sets overlap heavily, and the per-file state machine guarantees each
//! file is requested for upload at most once, no matter how many sessions
//! declare it concurrently.
//!
//! The file table, session table and pre-created-directory set are guarded
//! by a single per-client `RwLock`; it is a leaf lock, never held across
//! I/O on the upload path.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use rcc_protocol::digest::Digest256;
use thiserror::Error;
use tracing::{info, warn};

use crate::session::Session;

/// Upload state of one client file, with per-state data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    /// Declared by a session, not yet classified.
    JustCreated,
    /// The client was asked to upload it.
    Uploading { since: Instant },
    /// A previous upload failed; re-requested by the next session.
    UploadError,
    /// Present in the working directory (uploaded, restored from the
    /// source cache, or matched against a worker system header).
    Uploaded,
}

/// One file inside a client working directory. `(size, digest)` are fixed
/// at first declaration and never change for the life of the record.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub size: u64,
    pub digest: Digest256,
    /// Absolute path on the worker: the mirrored location, or the original
    /// absolute path for a matched system header.
    pub server_path: PathBuf,
    pub state: UploadState,
}

impl FileEntry {
    /// An upload is hung if it has been `Uploading` for longer than the
    /// size-dependent threshold (big precompiled headers travel slowly).
    pub fn is_upload_hung(&self, now: Instant) -> bool {
        match self.state {
            UploadState::Uploading { since } => {
                let limit = if self.size > 5 * 1024 * 1024 {
                    Duration::from_secs(60)
                } else {
                    Duration::from_secs(15)
                };
                now.duration_since(since) > limit
            }
            _ => false,
        }
    }
}

/// Why a session could not be created.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("file {path} was already declared with a different content hash")]
    DependencyConflict { path: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

struct ClientState {
    /// client path -> slot in `file_slots`.
    files: HashMap<String, usize>,
    file_slots: Vec<FileEntry>,
    sessions: HashMap<u32, Arc<Session>>,
    /// Directories already created under the working dir, to amortize
    /// `mkdir` across sessions.
    made_dirs: HashSet<PathBuf>,
}

/// Sessions whose result is ready to stream back, plus the disconnect
/// latch. Bounded; a sender blocked on a full queue is released when the
/// client disconnects.
pub struct ReadyQueue {
    inner: Mutex<ReadyInner>,
    cond: Condvar,
    capacity: usize,
}

struct ReadyInner {
    queue: VecDeque<Arc<Session>>,
    disconnected: bool,
}

impl ReadyQueue {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(ReadyInner { queue: VecDeque::new(), disconnected: false }),
            cond: Condvar::new(),
            capacity,
        }
    }

    /// Enqueue a finished session; a no-op after disconnect.
    pub fn push(&self, session: Arc<Session>) {
        let mut inner = self.inner.lock().unwrap();
        while inner.queue.len() >= self.capacity && !inner.disconnected {
            inner = self.cond.wait(inner).unwrap();
        }
        if inner.disconnected {
            return;
        }
        inner.queue.push_back(session);
        self.cond.notify_all();
    }

    /// Dequeue the next ready session. `None` means the client is gone.
    pub fn pop(&self) -> Option<Arc<Session>> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(session) = inner.queue.pop_front() {
                self.cond.notify_all();
                return Some(session);
            }
            if inner.disconnected {
                return None;
            }
            inner = self.cond.wait(inner).unwrap();
        }
    }

    pub fn disconnect(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.disconnected = true;
        inner.queue.clear();
        self.cond.notify_all();
    }

    pub fn is_disconnected(&self) -> bool {
        self.inner.lock().unwrap().disconnected
    }
}

/// A connected client machine.
pub struct Client {
    pub client_id: String,
    pub working_dir: PathBuf,
    pub disable_obj_cache: bool,
    pub ready: ReadyQueue,
    last_seen: Mutex<Instant>,
    state: RwLock<ClientState>,
}

impl Client {
    fn new(client_id: String, working_dir: PathBuf, disable_obj_cache: bool) -> Self {
        Self {
            client_id,
            working_dir,
            disable_obj_cache,
            ready: ReadyQueue::new(200),
            last_seen: Mutex::new(Instant::now()),
            state: RwLock::new(ClientState {
                files: HashMap::new(),
                file_slots: Vec::new(),
                sessions: HashMap::new(),
                made_dirs: HashSet::new(),
            }),
        }
    }

    /// `/proj/1.cpp` → `{working_dir}/proj/1.cpp`.
    pub fn map_client_path(&self, client_path: &str) -> PathBuf {
        rcc_protocol::pch::map_under_root(&self.working_dir, client_path)
    }

    /// The reverse mapping, for scrubbing worker paths out of user-facing
    /// output. Non-mirrored paths pass through unchanged.
    pub fn map_server_path(&self, server_path: &str) -> String {
        let prefix = self.working_dir.to_string_lossy();
        server_path.strip_prefix(prefix.as_ref()).unwrap_or(server_path).to_string()
    }

    pub fn touch(&self) {
        *self.last_seen.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().unwrap().elapsed()
    }

    /// Declare a file for a new session. First declaration creates the
    /// slot; a repeat declaration must match the recorded digest — a
    /// mismatch means an old session still pins a previous version of the
    /// file, which can only be resolved by failing the new session.
    pub fn declare_file(
        &self,
        client_path: &str,
        size: u64,
        digest: Digest256,
        server_path: PathBuf,
    ) -> Result<usize, SessionError> {
        let mut state = self.state.write().unwrap();
        if let Some(&slot) = state.files.get(client_path) {
            if state.file_slots[slot].digest != digest {
                return Err(SessionError::DependencyConflict { path: client_path.to_string() });
            }
            return Ok(slot);
        }
        let slot = state.file_slots.len();
        state.file_slots.push(FileEntry {
            size,
            digest,
            server_path,
            state: UploadState::JustCreated,
        });
        state.files.insert(client_path.to_string(), slot);
        Ok(slot)
    }

    /// Run `f` with mutable access to a file slot, under the write lock.
    pub fn with_file<R>(&self, slot: usize, f: impl FnOnce(&mut FileEntry) -> R) -> R {
        let mut state = self.state.write().unwrap();
        f(&mut state.file_slots[slot])
    }

    /// Snapshot of a file slot.
    pub fn file(&self, slot: usize) -> FileEntry {
        self.state.read().unwrap().file_slots[slot].clone()
    }

    pub fn register_session(&self, session: Arc<Session>) {
        let mut state = self.state.write().unwrap();
        state.sessions.insert(session.session_id, session);
    }

    pub fn session(&self, session_id: u32) -> Option<Arc<Session>> {
        self.state.read().unwrap().sessions.get(&session_id).cloned()
    }

    pub fn close_session(&self, session: &Session) {
        let mut state = self.state.write().unwrap();
        state.sessions.remove(&session.session_id);
        drop(state);
        let _ = fs::remove_file(&session.obj_out_path);
    }

    pub fn active_sessions_count(&self) -> usize {
        self.state.read().unwrap().sessions.len()
    }

    /// Sessions whose compilation has not started yet; re-scanned whenever
    /// a file becomes available.
    pub fn sessions_awaiting_files(&self) -> Vec<Arc<Session>> {
        let state = self.state.read().unwrap();
        state
            .sessions
            .values()
            .filter(|s| !s.compilation_started())
            .cloned()
            .collect()
    }

    /// Whether every file of the session is uploaded; evaluated under the
    /// client lock so no `uploaded` transition can race past the scan.
    pub fn all_files_uploaded(&self, session: &Session) -> bool {
        let state = self.state.read().unwrap();
        session
            .files
            .iter()
            .all(|&slot| state.file_slots[slot].state == UploadState::Uploaded)
    }

    pub fn files_count(&self) -> usize {
        self.state.read().unwrap().files.len()
    }

    /// Create every parent directory the session's files need, skipping
    /// the ones already made for this client.
    pub fn mkdir_all_for_session(&self, session: &Session) -> std::io::Result<()> {
        let mut wanted: Vec<PathBuf> = Vec::new();
        {
            let state = self.state.read().unwrap();
            let mut consider = |dir: &Path| {
                if dir.starts_with(&self.working_dir) && !state.made_dirs.contains(dir) {
                    wanted.push(dir.to_path_buf());
                }
            };
            for &slot in &session.files {
                if let Some(parent) = state.file_slots[slot].server_path.parent() {
                    consider(parent);
                }
            }
            // the compiler runs in the mirrored cwd even when no file
            // happens to live directly in it
            consider(&session.cwd);
        }
        if wanted.is_empty() {
            return Ok(());
        }
        wanted.sort();
        wanted.dedup();
        for dir in &wanted {
            fs::create_dir_all(dir)?;
        }
        let mut state = self.state.write().unwrap();
        state.made_dirs.extend(wanted);
        Ok(())
    }

    fn remove_working_dir(&self) {
        let mut state = self.state.write().unwrap();
        state.files.clear();
        state.file_slots.clear();
        state.made_dirs.clear();
        drop(state);

        // rename aside, delete in the background: disconnect must not wait
        // for a large tree removal
        let aside = self
            .working_dir
            .with_file_name(format!("{}.removing", self.client_id));
        if fs::rename(&self.working_dir, &aside).is_ok() {
            std::thread::spawn(move || {
                let _ = fs::remove_dir_all(&aside);
            });
        } else {
            let _ = fs::remove_dir_all(&self.working_dir);
        }
    }
}

/// All active clients, keyed by client id.
pub struct ClientsRegistry {
    table: RwLock<HashMap<String, Arc<Client>>>,
    clients_dir: PathBuf,
    inactive_timeout: Duration,
    completed_count: AtomicI64,
    last_purge: Mutex<Instant>,
    unique_remotes: Mutex<HashMap<String, String>>,
}

impl ClientsRegistry {
    pub fn new(clients_dir: impl Into<PathBuf>, inactive_timeout: Duration) -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
            clients_dir: clients_dir.into(),
            inactive_timeout,
            completed_count: AtomicI64::new(0),
            last_purge: Mutex::new(Instant::now()),
            unique_remotes: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<Client>> {
        self.table.read().unwrap().get(client_id).cloned()
    }

    /// Handle `start-client`. A live record under the same id means a
    /// previous daemon died uncleanly: it is deleted (working dir
    /// included) before the new one is accepted.
    pub fn on_client_connected(
        &self,
        client_id: &str,
        disable_obj_cache: bool,
    ) -> std::io::Result<Arc<Client>> {
        if let Some(stale) = self.get(client_id) {
            info!(client_id, "client reconnected, deleting the stale record");
            self.delete_client(&stale);
        }

        let working_dir = self.clients_dir.join(client_id);
        fs::create_dir_all(&working_dir)?;
        let client = Arc::new(Client::new(client_id.to_string(), working_dir, disable_obj_cache));
        self.table.write().unwrap().insert(client_id.to_string(), client.clone());
        Ok(client)
    }

    pub fn delete_client(&self, client: &Arc<Client>) {
        self.table.write().unwrap().remove(&client.client_id);
        self.completed_count.fetch_add(1, Ordering::Relaxed);
        client.ready.disconnect();
        client.remove_working_dir();
    }

    /// Purge clients idle beyond the timeout; runs at most once a minute.
    pub fn delete_inactive_clients(&self) {
        {
            let mut last = self.last_purge.lock().unwrap();
            if last.elapsed() < Duration::from_secs(60) {
                return;
            }
            *last = Instant::now();
        }
        loop {
            let inactive = self
                .table
                .read()
                .unwrap()
                .values()
                .find(|c| c.idle_for() > self.inactive_timeout)
                .cloned();
            let Some(client) = inactive else { break };
            warn!(
                client_id = %client.client_id,
                files = client.files_count(),
                "deleting inactive client"
            );
            self.delete_client(&client);
        }
    }

    /// Disconnect everyone without removing working dirs; the whole root
    /// is wiped on the next start anyway.
    pub fn stop_all_clients(&self) {
        let mut table = self.table.write().unwrap();
        for client in table.values() {
            client.ready.disconnect();
        }
        table.clear();
    }

    pub fn active_count(&self) -> i64 {
        self.table.read().unwrap().len() as i64
    }

    pub fn completed_count(&self) -> i64 {
        self.completed_count.load(Ordering::Relaxed)
    }

    pub fn active_sessions_count(&self) -> i64 {
        self.table.read().unwrap().values().map(|c| c.active_sessions_count() as i64).sum()
    }

    /// Record a client's configured remotes list; returns true the first
    /// time a given list is seen (a skewed list across a build fleet is
    /// worth a log line).
    pub fn remotes_list_first_seen(&self, all_remotes: &str, client_id: &str) -> bool {
        let mut seen = self.unique_remotes.lock().unwrap();
        if seen.contains_key(all_remotes) {
            return false;
        }
        seen.insert(all_remotes.to_string(), client_id.to_string());
        true
    }

    pub fn unique_remotes_info(&self) -> Vec<String> {
        let seen = self.unique_remotes.lock().unwrap();
        seen.iter()
            .map(|(remotes, client_id)| {
                format!("(n={}) client {} : {}", remotes.split(',').count(), client_id, remotes)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;

    fn test_registry(dir: &Path) -> ClientsRegistry {
        ClientsRegistry::new(dir.join("clients"), Duration::from_secs(300))
    }

    fn dummy_session(client: &Client, id: u32, files: Vec<usize>) -> Arc<Session> {
        Arc::new(Session::new(
            id,
            client.client_id.clone(),
            client.working_dir.join("proj/main.cpp"),
            client.working_dir.join(format!("out.{id}.o")),
            client.working_dir.clone(),
            "g++".to_string(),
            vec![],
            files,
        ))
    }

    #[test]
    fn path_mapping_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path());
        let client = registry.on_client_connected("abc", false).unwrap();

        let mapped = client.map_client_path("/home/alice/1.cpp");
        assert!(mapped.starts_with(&client.working_dir));
        assert_eq!(
            client.map_server_path(mapped.to_str().unwrap()),
            "/home/alice/1.cpp"
        );
        assert_eq!(client.map_server_path("/usr/include/math.h"), "/usr/include/math.h");
    }

    #[test]
    fn second_digest_for_same_path_is_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path());
        let client = registry.on_client_connected("abc", false).unwrap();

        let d1 = Digest256::of_bytes(b"v1");
        let d2 = Digest256::of_bytes(b"v2");
        let server = client.map_client_path("/proj/a.h");

        let slot = client.declare_file("/proj/a.h", 2, d1, server.clone()).unwrap();
        assert_eq!(client.declare_file("/proj/a.h", 2, d1, server.clone()).unwrap(), slot);
        assert!(matches!(
            client.declare_file("/proj/a.h", 2, d2, server),
            Err(SessionError::DependencyConflict { .. })
        ));
    }

    #[test]
    fn upload_hang_thresholds_depend_on_size() {
        let past = Instant::now() - Duration::from_secs(30);
        let small = FileEntry {
            size: 1024,
            digest: Digest256::default(),
            server_path: PathBuf::from("/x"),
            state: UploadState::Uploading { since: past },
        };
        let big = FileEntry { size: 50 * 1024 * 1024, ..small.clone() };
        let now = Instant::now();
        assert!(small.is_upload_hung(now));
        assert!(!big.is_upload_hung(now));

        let done = FileEntry { state: UploadState::Uploaded, ..small };
        assert!(!done.is_upload_hung(now));
    }

    #[test]
    fn reconnect_replaces_the_stale_record() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path());

        let first = registry.on_client_connected("abc", false).unwrap();
        let marker = first.working_dir.join("marker");
        fs::write(&marker, b"x").unwrap();

        let second = registry.on_client_connected("abc", false).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(first.ready.is_disconnected());
        assert!(!second.ready.is_disconnected());
        assert!(!marker.exists());
        assert_eq!(registry.active_count(), 1);
        assert_eq!(registry.completed_count(), 1);
    }

    #[test]
    fn ready_queue_unblocks_on_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path());
        let client = registry.on_client_connected("abc", false).unwrap();
        let session = dummy_session(&client, 1, vec![]);

        client.ready.push(session.clone());
        assert_eq!(client.ready.pop().unwrap().session_id, 1);

        let waiter = {
            let client = client.clone();
            std::thread::spawn(move || client.ready.pop())
        };
        std::thread::sleep(Duration::from_millis(30));
        client.ready.disconnect();
        assert!(waiter.join().unwrap().is_none());

        // pushes after disconnect are dropped
        client.ready.push(session);
        assert!(client.ready.pop().is_none());
    }

    #[test]
    fn mkdir_is_amortized_across_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path());
        let client = registry.on_client_connected("abc", false).unwrap();

        let s1 = client.map_client_path("/deep/tree/a.h");
        let slot = client.declare_file("/deep/tree/a.h", 1, Digest256::of_bytes(b"a"), s1).unwrap();
        let session = dummy_session(&client, 1, vec![slot]);
        client.mkdir_all_for_session(&session).unwrap();
        assert!(client.working_dir.join("deep/tree").is_dir());

        // second call sees everything memoized
        client.mkdir_all_for_session(&session).unwrap();
    }
}
