//! One compilation session — the worker-side counterpart of a client
//! invocation.
//!
//! A session is created by `start-session`, waits until every dependency
//! is present in the working directory, runs the compiler once, and is
//! closed after its result has been streamed back. All of that can be
//! skipped when the object cache already holds the result.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use rcc_protocol::digest::Digest256;

use crate::clients::Client;

/// Result of one compiler run. A non-zero exit code is a perfectly valid
/// result to deliver, not a worker error.
#[derive(Debug, Clone, Default)]
pub struct CompileResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u32,
}

pub struct Session {
    pub session_id: u32,
    pub client_id: String,
    /// Input translation unit, as an absolute worker path.
    pub input_server_path: PathBuf,
    /// Unique scratch path the object lands at (a fresh hard link from the
    /// object cache on a hit). Unlinked when the session closes.
    pub obj_out_path: PathBuf,
    /// Mirrored client cwd the compiler runs in.
    pub cwd: PathBuf,
    pub compiler_name: String,
    /// Fully rewritten argument list, `-o` and input included.
    pub cmd_line: Vec<String>,
    /// Slots into the owning client's file table, in declaration order.
    pub files: Vec<usize>,

    obj_cache_key: Mutex<Option<Digest256>>,
    compilation_started: AtomicBool,
    result: Mutex<Option<CompileResult>>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: u32,
        client_id: String,
        input_server_path: PathBuf,
        obj_out_path: PathBuf,
        cwd: PathBuf,
        compiler_name: String,
        cmd_line: Vec<String>,
        files: Vec<usize>,
    ) -> Self {
        Self {
            session_id,
            client_id,
            input_server_path,
            obj_out_path,
            cwd,
            compiler_name,
            cmd_line,
            files,
            obj_cache_key: Mutex::new(None),
            compilation_started: AtomicBool::new(false),
            result: Mutex::new(None),
        }
    }

    /// Latch the start of compilation. Only the one caller that flips the
    /// latch may launch the compiler (or serve the cached object).
    pub fn try_start_compilation(&self) -> bool {
        !self.compilation_started.swap(true, Ordering::SeqCst)
    }

    pub fn compilation_started(&self) -> bool {
        self.compilation_started.load(Ordering::SeqCst)
    }

    pub fn set_obj_cache_key(&self, key: Digest256) {
        *self.obj_cache_key.lock().unwrap() = Some(key);
    }

    pub fn obj_cache_key(&self) -> Option<Digest256> {
        *self.obj_cache_key.lock().unwrap()
    }

    pub fn set_result(&self, result: CompileResult) {
        *self.result.lock().unwrap() = Some(result);
    }

    /// The stored result; a default zero result for cache-hit sessions
    /// that never ran a compiler.
    pub fn take_result(&self) -> CompileResult {
        self.result.lock().unwrap().clone().unwrap_or_default()
    }
}

/// Build the compiler command line for the worker side.
///
/// Include-dir argument pairs arrive in client-absolute form and their
/// value parts are remapped into the working directory; plain args pass
/// through except for `-ffile-prefix-map` (below); output and input are
/// appended last and never participate in the object-cache key.
pub fn build_server_cmd_line(
    client: &Client,
    args: &[String],
    include_dir_args: &[String],
    obj_out_path: &Path,
    input_server_path: &Path,
) -> Vec<String> {
    let mut cmd = Vec::with_capacity(args.len() + include_dir_args.len() + 3);
    let mut it = include_dir_args.iter();
    while let Some(flag) = it.next() {
        let Some(value) = it.next() else { break };
        cmd.push(flag.clone());
        cmd.push(client.map_client_path(value).to_string_lossy().into_owned());
    }
    for arg in args {
        cmd.push(rewrite_prefix_map(client, arg));
    }
    cmd.push("-o".to_string());
    cmd.push(obj_out_path.to_string_lossy().into_owned());
    cmd.push(input_server_path.to_string_lossy().into_owned());
    cmd
}

/// `-ffile-prefix-map=/abs/src=dst` maps a path the *client* knows; after
/// mirroring, the compiler sees `{working_dir}/abs/src` instead, so the
/// working-dir prefix is prepended to keep the mapping effective.
fn rewrite_prefix_map(client: &Client, arg: &str) -> String {
    const OPTION: &str = "-ffile-prefix-map";
    if !arg.starts_with(OPTION) {
        return arg.to_string();
    }
    let mut parts: Vec<&str> = arg.split('=').collect();
    if parts.len() < 2 || !parts[1].starts_with('/') {
        return arg.to_string();
    }
    let mapped = client.map_client_path(parts[1]).to_string_lossy().into_owned();
    parts[1] = &mapped;
    parts.join("=")
}
