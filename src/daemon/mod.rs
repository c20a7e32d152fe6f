//! The client daemon.
//!
//! Spawned lazily by the first wrapper invocation, gone after fifteen
//! idle seconds. It keeps one connection bundle per configured worker,
//! an include cache per compiler, the table of in-flight invocations and
//! the local-compile throttle — everything worth sharing across the tens
//! of thousands of compiler invocations of one build.

pub mod socket;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use rcc_protocol::digest::fnv1a_32;
use rcc_protocol::messages::ErrorCode;
use tracing::{debug, error, info, warn};

use crate::classify::{parse_invocation, InvokeKind};
use crate::invocation::{ActiveInvocations, Invocation, InvocationResult};
use crate::local::run_local_compiler;
use crate::pch_gen::generate_own_pch;
use crate::remote::{self, compile_remotely, ConnectInfo, RemoteConnection, TransportError};
use crate::resolver::cache::{CachedFileInfo, IncludesCache};
use crate::sync::Semaphore;

/// How long an invocation may stay alive before the sweeper kills it.
pub const DEFAULT_FORCE_INTERRUPT: Duration = Duration::from_secs(8 * 60);

static GOT_SIGTERM: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigterm(_: libc::c_int) {
    GOT_SIGTERM.store(true, Ordering::SeqCst);
}

pub struct DaemonSettings {
    pub servers: Vec<String>,
    pub client_id: Option<String>,
    pub disable_obj_cache: bool,
    pub disable_own_includes: bool,
    /// Local-compile parallelism; zero disables the local fallback.
    pub local_parallelism: usize,
    pub force_interrupt_after: Duration,
}

pub struct Daemon {
    pub client_id: String,
    pub host_user: String,
    pub start_time: Instant,
    /// One slot per configured worker; `None` means the connect failed
    /// and everything hashed onto it runs locally. The slot order is the
    /// hash space — it must not depend on availability.
    remotes: Vec<Option<Arc<RemoteConnection>>>,
    remote_hosts: Vec<String>,
    pub active: Arc<ActiveInvocations>,
    local_throttle: Option<Semaphore>,
    disable_own_includes: bool,
    force_interrupt_after: Duration,
    session_seq: AtomicU32,
    includes_caches: Mutex<HashMap<String, Arc<IncludesCache>>>,
    quit: AtomicBool,
}

/// A stable-but-unique client id: controlled by the environment for
/// test setups, random otherwise (a restarted daemon is a new client).
fn generate_client_id() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(1)
        ^ (std::process::id() as u64) << 32;
    (0..8)
        .map(|_| {
            // xorshift is plenty for an identifier
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            ALPHABET[(seed % ALPHABET.len() as u64) as usize] as char
        })
        .collect()
}

fn detect_host_user() -> String {
    std::env::var("USER").unwrap_or_else(|_| "unknown".to_string())
}

impl Daemon {
    /// Connect to every configured worker in parallel and stand up the
    /// daemon. Connection failures are logged, not fatal: those workers
    /// stay unavailable and their share of the build compiles locally.
    pub fn new(settings: DaemonSettings) -> Arc<Daemon> {
        let client_id = settings.client_id.unwrap_or_else(generate_client_id);
        let active = Arc::new(ActiveInvocations::default());

        let all_remotes = settings
            .servers
            .iter()
            .map(|hp| remote::host_without_port(hp))
            .collect::<Vec<_>>()
            .join(",");
        let info = ConnectInfo {
            client_id: client_id.clone(),
            host_user: detect_host_user(),
            disable_obj_cache: settings.disable_obj_cache,
            all_remotes,
        };

        let handles: Vec<_> = settings
            .servers
            .iter()
            .map(|host_port| {
                let host_port = host_port.clone();
                let info = info.clone();
                let active = Arc::clone(&active);
                std::thread::spawn(move || {
                    match RemoteConnection::connect(&host_port, &info, active) {
                        Ok(connection) => Some(Arc::new(connection)),
                        Err(e) => {
                            error!(remote = %host_port, error = %e, "can't connect to worker");
                            None
                        }
                    }
                })
            })
            .collect();
        let remotes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap_or(None)).collect();

        info!(
            client_id = %client_id,
            user = %info.host_user,
            workers = remotes.len(),
            connected = remotes.iter().filter(|r| r.is_some()).count(),
            version = rcc_protocol::VERSION,
            "daemon started"
        );

        let daemon = Arc::new(Daemon {
            client_id,
            host_user: info.host_user,
            start_time: Instant::now(),
            remotes,
            remote_hosts: settings.servers.clone(),
            active,
            local_throttle: (settings.local_parallelism > 0)
                .then(|| Semaphore::new(settings.local_parallelism)),
            disable_own_includes: settings.disable_own_includes,
            force_interrupt_after: settings.force_interrupt_after,
            session_seq: AtomicU32::new(0),
            includes_caches: Mutex::new(HashMap::new()),
            quit: AtomicBool::new(false),
        });

        unsafe {
            libc::signal(libc::SIGTERM, on_sigterm as libc::sighandler_t);
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }
        {
            let daemon = Arc::clone(&daemon);
            std::thread::Builder::new()
                .name("sweeper".to_string())
                .spawn(move || daemon.sweep_hung_invocations())
                .ok();
        }
        daemon
    }

    pub fn should_quit(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    /// Stop accepting work, notify every worker, release every waiter.
    pub fn quit_gracefully(&self, reason: &str) {
        if self.quit.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(reason, "daemon quitting");
        for remote in self.remotes.iter().flatten() {
            remote.send_stop_client();
        }
        for invocation in self.active.snapshot() {
            invocation.force_interrupt(format!("daemon quit: {reason}"));
        }
    }

    /// Serve one wrapper request from start to finish.
    pub fn handle_request(&self, cwd: PathBuf, cmd_line: Vec<String>) -> InvocationResult {
        let parsed = match parse_invocation(&cwd, &cmd_line) {
            Ok(parsed) => parsed,
            Err(e) => return self.fallback_to_local(&cwd, &cmd_line, Some(e.to_string())),
        };

        match parsed.kind {
            InvokeKind::Link => {
                // linking is normally filtered by the wrapper; harmless
                // to see it here, but it never goes remote
                debug!("local compile for a linking invocation");
                self.fallback_to_local(&cwd, &cmd_line, None)
            }
            InvokeKind::CompilePch => self.handle_pch_generation(&cwd, &cmd_line, parsed),
            InvokeKind::CompileCpp => self.handle_cpp_compilation(cwd, cmd_line, parsed),
        }
    }

    fn handle_cpp_compilation(
        &self,
        cwd: PathBuf,
        cmd_line: Vec<String>,
        parsed: crate::classify::ParsedInvocation,
    ) -> InvocationResult {
        if self.remotes.is_empty() {
            return self.fallback_to_local(
                &cwd,
                &cmd_line,
                Some("no remote workers configured; set RCC_SERVERS".to_string()),
            );
        }

        let slot = self.worker_slot_for(&parsed.input_path);
        let Some(remote) = &self.remotes[slot] else {
            return self.fallback_to_local(
                &cwd,
                &cmd_line,
                Some(format!("worker {} is unavailable", self.remote_hosts[slot])),
            );
        };
        if remote.shared.is_unavailable() {
            return self.fallback_to_local(
                &cwd,
                &cmd_line,
                Some(format!("worker {} is unavailable", remote.shared.host)),
            );
        }

        let includes_cache = self.includes_cache_for(&parsed.compiler_name, &parsed.stdlib_args);
        let session_id = self.session_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let invocation = Arc::new(Invocation::new(session_id, cwd, parsed));
        *invocation.remote_host.lock().unwrap() = remote.shared.host.clone();

        self.active.insert(Arc::clone(&invocation));
        let outcome =
            compile_remotely(remote, &invocation, &includes_cache, self.disable_own_includes);
        self.active.remove(session_id);

        match outcome {
            Ok(result) => {
                debug!(
                    session_id,
                    exit_code = result.exit_code,
                    duration_ms = result.duration_ms,
                    remote = %remote.shared.host,
                    input = %invocation.parsed.input_path,
                    "compiled remotely"
                );
                result
            }
            Err(e) => {
                // transport-level failure, not a compiler failure; a dead
                // control stream (or a worker that forgot us) cannot heal
                // within this daemon's lifetime
                match &e {
                    TransportError::Io(_) | TransportError::Frame(_) => {
                        remote.shared.mark_unavailable(&e.to_string());
                    }
                    TransportError::Remote(w) if w.code == ErrorCode::Unauthenticated => {
                        remote.shared.mark_unavailable(&e.to_string());
                    }
                    _ => {}
                }
                self.fallback_to_local(&invocation.cwd, &cmd_line, Some(e.to_string()))
            }
        }
    }

    fn handle_pch_generation(
        &self,
        cwd: &std::path::Path,
        cmd_line: &[String],
        parsed: crate::classify::ParsedInvocation,
    ) -> InvocationResult {
        let includes_cache = self.includes_cache_for(&parsed.compiler_name, &parsed.stdlib_args);
        // records cached before this point may describe the previous
        // generation of the sibling containers
        includes_cache.clear();

        let own_pch = match generate_own_pch(&parsed, cwd, &includes_cache) {
            Ok(own_pch) => own_pch,
            Err(e) => return self.fallback_to_local(cwd, cmd_line, Some(e.to_string())),
        };
        let size = match own_pch.save() {
            Ok(size) => size,
            Err(e) => {
                return self.fallback_to_local(
                    cwd,
                    cmd_line,
                    Some(format!("failed to save the pch container: {e}")),
                )
            }
        };
        let pch_path = own_pch.own_pch_path.to_string_lossy().into_owned();
        includes_cache.add_file_info(
            &pch_path,
            CachedFileInfo { size: size as i64, digest: own_pch.fingerprint, nested: vec![] },
        );
        info!(path = %pch_path, size, "saved pch container");

        if !self.all_remotes_available() {
            // some compiles will run locally; they need the real pch
            info!("also compiling a real pch for local compilations");
            return self.fallback_to_local(cwd, cmd_line, None);
        }

        InvocationResult {
            exit_code: 0,
            stdout: format!("[rcc] saved pch container to {pch_path}\n").into_bytes(),
            ..Default::default()
        }
    }

    /// The local queue. Whatever the reason, local compiles all pass
    /// through one semaphore sized to this machine.
    pub fn fallback_to_local(
        &self,
        cwd: &std::path::Path,
        cmd_line: &[String],
        reason: Option<String>,
    ) -> InvocationResult {
        if let Some(reason) = reason {
            warn!(reason = %reason, "compiling locally");
        }
        let Some(throttle) = &self.local_throttle else {
            return InvocationResult {
                exit_code: 1,
                stderr: b"local compilation is disabled\n".to_vec(),
                ..Default::default()
            };
        };
        let _permit = throttle.acquire();
        run_local_compiler(cwd, cmd_line)
    }

    /// Deterministic worker choice: the same translation unit always
    /// lands on the same worker, so rebuilds (even from a moved
    /// checkout) reuse that worker's caches.
    fn worker_slot_for(&self, input_path: &str) -> usize {
        let base = input_path.rsplit('/').next().unwrap_or(input_path);
        fnv1a_32(base.as_bytes()) as usize % self.remotes.len()
    }

    fn all_remotes_available(&self) -> bool {
        !self.remotes.is_empty()
            && self.remotes.iter().all(|r| matches!(r, Some(r) if !r.shared.is_unavailable()))
    }

    /// One include cache per (compiler, -stdlib) pair, living as long as
    /// the daemon.
    pub fn includes_cache_for(
        &self,
        compiler_name: &str,
        stdlib_args: &[String],
    ) -> Arc<IncludesCache> {
        let key = format!("{compiler_name} {}", stdlib_args.join(" "));
        let mut caches = self.includes_caches.lock().unwrap();
        Arc::clone(
            caches
                .entry(key)
                .or_insert_with(|| Arc::new(IncludesCache::discover(compiler_name, stdlib_args))),
        )
    }

    /// Periodic pass: force-interrupt invocations alive beyond the
    /// timeout, react to SIGTERM.
    fn sweep_hung_invocations(&self) {
        loop {
            for _ in 0..100 {
                std::thread::sleep(Duration::from_millis(100));
                if GOT_SIGTERM.swap(false, Ordering::SeqCst) {
                    self.quit_gracefully("got SIGTERM");
                    std::process::exit(0);
                }
                if self.should_quit() {
                    return;
                }
            }
            for invocation in self.active.snapshot() {
                let age = invocation.created_at.elapsed();
                if age > self.force_interrupt_after {
                    invocation.force_interrupt(format!(
                        "interrupted after {} sec; worker {}",
                        age.as_secs(),
                        invocation.remote_host.lock().unwrap(),
                    ));
                }
            }
        }
    }
}

/// Parse the `;`-joined servers environment form.
pub fn parse_servers_list(joined: &str) -> Vec<String> {
    joined
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a servers file: one `host:port` per line, `#` comments.
pub fn parse_servers_file(contents: &str) -> Vec<String> {
    contents
        .lines()
        .filter_map(|line| {
            let host = line.split('#').next().unwrap_or("").trim_matches([';', ',', ' ', '\t']);
            (!host.is_empty()).then(|| host.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn servers_list_forms() {
        assert_eq!(
            parse_servers_list("h1:43210; h2:43210 ;;"),
            vec!["h1:43210", "h2:43210"]
        );
        assert!(parse_servers_list("").is_empty());
    }

    #[test]
    fn servers_file_skips_comments() {
        let contents = "\
# build fleet, rack 3
h1:43210
h2:43210  # the slow one
 ; h3:43210

";
        assert_eq!(
            parse_servers_file(contents),
            vec!["h1:43210", "h2:43210", "h3:43210"]
        );
    }

    #[test]
    fn generated_ids_are_distinct_enough() {
        let a = generate_client_id();
        let b = generate_client_id();
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_alphabetic()));
        assert_ne!(a, b);
    }

    #[test]
    fn worker_slot_is_stable_across_paths() {
        let daemon_remotes: Vec<Option<Arc<RemoteConnection>>> = vec![None, None, None];
        // the hashing contract, tested through the public digest fn:
        // same basename => same slot, regardless of the directory
        let slot = |path: &str| {
            let base = path.rsplit('/').next().unwrap_or(path);
            fnv1a_32(base.as_bytes()) as usize % daemon_remotes.len()
        };
        assert_eq!(slot("/home/alice/proj/foo.cpp"), slot("/ci/build-7/proj/foo.cpp"));
    }
}
