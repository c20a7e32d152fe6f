//! The compiler launcher.
//!
//! All compiler invocations on the worker go through one bounded
//! semaphore so peak load never oversubscribes the machine; sessions
//! waiting for a slot queue implicitly by blocking on it.

use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use tracing::{debug, error, info};

use crate::clients::Client;
use crate::server::Worker;
use crate::session::{CompileResult, Session};

/// A plain counting semaphore with RAII permits.
pub struct Semaphore {
    available: Mutex<usize>,
    cond: Condvar,
}

pub struct Permit<'a>(&'a Semaphore);

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self { available: Mutex::new(permits), cond: Condvar::new() }
    }

    pub fn acquire(&self) -> Permit<'_> {
        let mut available = self.available.lock().unwrap();
        while *available == 0 {
            available = self.cond.wait(available).unwrap();
        }
        *available -= 1;
        Permit(self)
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut available = self.0.available.lock().unwrap();
        *available += 1;
        self.0.cond.notify_one();
    }
}

#[derive(Default)]
struct LauncherCounters {
    waiting: AtomicI64,
    now_compiling: AtomicI64,
    total_calls: AtomicI64,
    total_duration_ms: AtomicI64,
    more_10s: AtomicI64,
    more_30s: AtomicI64,
    nonzero_exits: AtomicI64,
}

pub struct CxxLauncher {
    throttle: Semaphore,
    counters: LauncherCounters,
}

impl CxxLauncher {
    pub fn new(max_parallel: usize) -> Self {
        Self {
            throttle: Semaphore::new(max_parallel.max(1)),
            counters: LauncherCounters::default(),
        }
    }

    /// Compile a ready session, blocking on the throttle first. Called on
    /// a dedicated thread per session; ends by pushing the session onto
    /// its client's ready queue.
    pub fn compile_session(&self, worker: &Worker, client: &Arc<Client>, session: &Arc<Session>) {
        let c = &self.counters;
        c.waiting.fetch_add(1, Ordering::Relaxed);
        let permit = self.throttle.acquire();
        c.waiting.fetch_sub(1, Ordering::Relaxed);
        let parallel = c.now_compiling.fetch_add(1, Ordering::Relaxed) + 1;

        debug!(
            session_id = session.session_id,
            client_id = %session.client_id,
            parallel,
            input = %session.input_server_path.display(),
            "launch compiler"
        );
        let mut result =
            run_compiler(&session.compiler_name, &session.cmd_line, &session.cwd);

        c.now_compiling.fetch_sub(1, Ordering::Relaxed);
        c.total_calls.fetch_add(1, Ordering::Relaxed);
        c.total_duration_ms.fetch_add(i64::from(result.duration_ms), Ordering::Relaxed);
        if result.exit_code != 0 {
            c.nonzero_exits.fetch_add(1, Ordering::Relaxed);
            error!(
                session_id = session.session_id,
                exit_code = result.exit_code,
                input = %session.input_server_path.display(),
                stderr = %result.stderr.trim(),
                "compiler exited with a non-zero code"
            );
        } else if result.duration_ms > 30_000 {
            c.more_30s.fetch_add(1, Ordering::Relaxed);
            info!(
                session_id = session.session_id,
                duration_ms = result.duration_ms,
                input = %session.input_server_path.display(),
                "compiled a very heavy file"
            );
        } else if result.duration_ms > 10_000 {
            c.more_10s.fetch_add(1, Ordering::Relaxed);
        }

        // cache the object, but only for a perfectly clean compile: stray
        // warnings would be lost on replay from cache
        if let Some(key) = session.obj_cache_key() {
            if result.exit_code == 0 && result.stdout.is_empty() && result.stderr.is_empty() {
                if let Ok(meta) = std::fs::metadata(&session.obj_out_path) {
                    let base = session
                        .input_server_path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    if let Err(e) = worker.obj_cache.cache.store(
                        &session.obj_out_path,
                        &format!("{base}.o"),
                        key,
                        meta.len(),
                    ) {
                        error!(session_id = session.session_id, error = %e, "obj cache store failed");
                    }
                }
            }
        }

        let wd = client.working_dir.to_string_lossy();
        result.stdout = result.stdout.replace(wd.as_ref(), "");
        result.stderr = result.stderr.replace(wd.as_ref(), "");
        session.set_result(result);

        drop(permit);
        client.ready.push(session.clone());
    }

    /// Run the compiler for a precompiled header, synchronously. Unlike
    /// object compiles, a failure here is an error the uploader must see.
    pub fn compile_pch(
        &self,
        compiler_name: &str,
        cmd_line: &[String],
        cwd: &Path,
    ) -> Result<(), String> {
        let result = run_compiler(compiler_name, cmd_line, cwd);
        if result.exit_code != 0 {
            return Err(format!(
                "compiler exited with code {} while building a pch\n{}{}",
                result.exit_code, result.stdout, result.stderr
            ));
        }
        Ok(())
    }

    pub fn now_compiling(&self) -> i64 {
        self.counters.now_compiling.load(Ordering::Relaxed)
    }

    pub fn waiting_in_queue(&self) -> i64 {
        self.counters.waiting.load(Ordering::Relaxed)
    }

    pub fn total_calls(&self) -> i64 {
        self.counters.total_calls.load(Ordering::Relaxed)
    }

    pub fn total_duration_ms(&self) -> i64 {
        self.counters.total_duration_ms.load(Ordering::Relaxed)
    }

    pub fn more_10s_count(&self) -> i64 {
        self.counters.more_10s.load(Ordering::Relaxed)
    }

    pub fn more_30s_count(&self) -> i64 {
        self.counters.more_30s.load(Ordering::Relaxed)
    }

    pub fn nonzero_exit_count(&self) -> i64 {
        self.counters.nonzero_exits.load(Ordering::Relaxed)
    }
}

fn run_compiler(compiler_name: &str, cmd_line: &[String], cwd: &Path) -> CompileResult {
    let started = Instant::now();
    let output = Command::new(compiler_name).args(cmd_line).current_dir(cwd).output();
    let duration_ms = started.elapsed().as_millis() as u32;

    match output {
        Ok(out) => CompileResult {
            exit_code: out.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            duration_ms,
        },
        Err(e) => CompileResult {
            exit_code: -1,
            stdout: String::new(),
            stderr: format!("failed to launch {compiler_name}: {e}\n"),
            duration_ms,
        },
    }
}
