//! End-to-end tests: a real worker on a loopback TCP port, a real daemon
//! talking to it, and a stand-in compiler script so no actual toolchain
//! is needed. The "compiler" copies its input to its output and records
//! every invocation, which makes cache hits directly observable.

use std::fs;
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rcc::daemon::{Daemon, DaemonSettings};
use rcc::depfile::DepFile;
use rcc_worker::clients::ClientsRegistry;
use rcc_worker::cxx::CxxLauncher;
use rcc_worker::file_cache::{ObjCache, SrcCache};
use rcc_worker::logging::LogWriter;
use rcc_worker::pch_store::PchStore;
use rcc_worker::server::Worker;
use rcc_worker::stats::Stats;
use rcc_worker::system_headers::SystemHeaders;

fn start_worker(root: &Path) -> (String, Arc<Worker>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let host_port = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());

    let worker = Arc::new(Worker {
        start_time: Instant::now(),
        args: vec!["rcc-worker".to_string()],
        clients: ClientsRegistry::new(root.join("clients"), Duration::from_secs(300)),
        cxx: CxxLauncher::new(2),
        pch: PchStore::new(root.join("pch")).unwrap(),
        system_headers: SystemHeaders::new(),
        src_cache: SrcCache::new(root.join("src-cache"), 1 << 30).unwrap(),
        obj_cache: ObjCache::new(root.join("obj-cache"), root.join("cxx-out"), 1 << 30).unwrap(),
        stats: Stats::new(None).unwrap(),
        log: LogWriter::stderr(),
    });

    let serving = Arc::clone(&worker);
    std::thread::spawn(move || {
        let _ = serving.serve(listener);
    });
    (host_port, worker)
}

fn make_daemon(servers: &[String], client_id: &str) -> Arc<Daemon> {
    Daemon::new(DaemonSettings {
        servers: servers.to_vec(),
        client_id: Some(client_id.to_string()),
        disable_obj_cache: false,
        disable_own_includes: false,
        local_parallelism: 2,
        force_interrupt_after: Duration::from_secs(8 * 60),
    })
}

/// A stand-in compiler: records its command line, then copies the first
/// existing source/header argument into whatever `-o` names.
fn fake_compiler(dir: &Path, log: &Path) -> String {
    let script = format!(
        r#"#!/bin/sh
echo "cc $*" >> "{log}"
out=""; in=""; prev=""
for a in "$@"; do
  if [ "$prev" = "-o" ]; then out="$a"; fi
  case "$a" in
    *.cpp|*.h) if [ -f "$a" ] && [ -z "$in" ]; then in="$a"; fi;;
  esac
  prev="$a"
done
if [ -z "$out" ]; then exit 1; fi
if [ -n "$in" ]; then cp "$in" "$out"; else echo OBJ > "$out"; fi
"#,
        log = log.display()
    );
    let path = dir.join("fakecc");
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path.to_str().unwrap().to_string()
}

/// A stand-in compiler that always fails like a broken translation unit.
fn failing_compiler(dir: &Path, log: &Path) -> String {
    let script = format!(
        "#!/bin/sh\necho \"cc $*\" >> \"{}\"\necho 'foo.cpp:1:1: error: boom' >&2\nexit 3\n",
        log.display()
    );
    let path = dir.join("failcc");
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path.to_str().unwrap().to_string()
}

/// Invocations of the stand-in compiler, not counting the daemon's
/// one-time default-include-dirs discovery run (`-Wp,-v`).
fn compile_count(log: &Path) -> usize {
    fs::read_to_string(log)
        .map(|s| s.lines().filter(|l| !l.contains("-Wp,-v")).count())
        .unwrap_or(0)
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("timed out waiting for {what}");
}

fn write_project(proj: &Path) {
    fs::create_dir_all(proj).unwrap();
    let filler = "// filler to make the file a realistic size\n".repeat(4);
    fs::write(proj.join("foo.h"), format!("#pragma once\nint foo_value();\n{filler}")).unwrap();
    fs::write(
        proj.join("foo.cpp"),
        format!("#include \"foo.h\"\nint foo_value() {{ return 42; }}\n{filler}"),
    )
    .unwrap();
}

#[test]
fn cache_warming_compiles_once_then_serves_from_cache() {
    let tmp = tempfile::tempdir().unwrap();
    let (host_port, worker) = start_worker(&tmp.path().join("worker"));
    let proj = tmp.path().join("proj");
    write_project(&proj);
    let log = tmp.path().join("cc.log");
    let cc = fake_compiler(tmp.path(), &log);

    let daemon = make_daemon(&[host_port.clone()], "client-warm");
    let result =
        daemon.handle_request(proj.clone(), args(&[&cc, "-c", "foo.cpp", "-o", "foo.o"]));
    assert_eq!(result.exit_code, 0, "stderr: {}", String::from_utf8_lossy(&result.stderr));
    assert_eq!(
        fs::read(proj.join("foo.o")).unwrap(),
        fs::read(proj.join("foo.cpp")).unwrap()
    );
    assert_eq!(compile_count(&log), 1);
    // both files were uploaded into the source cache, the object landed
    // in the object cache
    assert_eq!(worker.src_cache.0.files_count(), 2);
    assert_eq!(worker.obj_cache.cache.files_count(), 1);

    // same unit, different output path: a pure object-cache hit
    let result =
        daemon.handle_request(proj.clone(), args(&[&cc, "-c", "foo.cpp", "-o", "bar.o"]));
    assert_eq!(result.exit_code, 0);
    assert_eq!(
        fs::read(proj.join("bar.o")).unwrap(),
        fs::read(proj.join("foo.cpp")).unwrap()
    );
    assert_eq!(compile_count(&log), 1, "the object cache should have answered");

    // a different client benefits from the same caches
    daemon.quit_gracefully("test handover");
    let other = make_daemon(&[host_port], "client-warm-2");
    let result = other.handle_request(proj.clone(), args(&[&cc, "-c", "foo.cpp", "-o", "baz.o"]));
    assert_eq!(result.exit_code, 0);
    assert_eq!(compile_count(&log), 1);
}

#[test]
fn unavailable_worker_means_local_compilation() {
    let tmp = tempfile::tempdir().unwrap();
    let proj = tmp.path().join("proj");
    write_project(&proj);
    let log = tmp.path().join("cc.log");
    let cc = fake_compiler(tmp.path(), &log);

    // nothing listens on port 9
    let daemon = make_daemon(&["127.0.0.1:9".to_string()], "client-lonely");
    let result =
        daemon.handle_request(proj.clone(), args(&[&cc, "-c", "foo.cpp", "-o", "foo.o"]));
    assert_eq!(result.exit_code, 0);
    assert_eq!(
        fs::read(proj.join("foo.o")).unwrap(),
        fs::read(proj.join("foo.cpp")).unwrap()
    );
    // exactly one local run, no remote anything
    assert_eq!(compile_count(&log), 1);
}

#[test]
fn depfile_is_generated_client_side() {
    let tmp = tempfile::tempdir().unwrap();
    let (host_port, _worker) = start_worker(&tmp.path().join("worker"));
    let proj = tmp.path().join("proj");
    write_project(&proj);
    let log = tmp.path().join("cc.log");
    let cc = fake_compiler(tmp.path(), &log);

    let daemon = make_daemon(&[host_port], "client-dep");
    let result = daemon.handle_request(
        proj.clone(),
        args(&[
            &cc, "-MD", "-MT", "foo.cpp.o", "-MF", "foo.cpp.o.d", "-o", "foo.cpp.o", "-c",
            "foo.cpp", "-MP",
        ]),
    );
    assert_eq!(result.exit_code, 0);

    // the depfile is written on its own thread, alongside the compile
    let dep_path = proj.join("foo.cpp.o.d");
    wait_for("the depfile", || dep_path.exists());
    let parsed = DepFile::parse(&fs::read_to_string(&dep_path).unwrap()).unwrap();

    let deps = parsed.find_deps_of("foo.cpp.o").expect("main target present");
    assert_eq!(deps[0], "foo.cpp");
    let header = proj.join("foo.h").to_str().unwrap().to_string();
    assert!(deps.contains(&header), "deps: {deps:?}");
    // -MP: a phony empty target per non-main dependency
    assert!(parsed.find_deps_of(&header).is_some_and(|d| d.is_empty()));
}

#[test]
fn conflicting_header_hash_falls_back_locally() {
    let tmp = tempfile::tempdir().unwrap();
    let (host_port, worker) = start_worker(&tmp.path().join("worker"));
    let proj = tmp.path().join("proj");
    write_project(&proj);
    let log = tmp.path().join("cc.log");
    let cc = fake_compiler(tmp.path(), &log);

    let daemon = make_daemon(&[host_port], "client-conflict");
    let result =
        daemon.handle_request(proj.clone(), args(&[&cc, "-c", "foo.cpp", "-o", "foo.o"]));
    assert_eq!(result.exit_code, 0);
    assert_eq!(compile_count(&log), 1);

    // the header changes under the same client: the new digest conflicts
    // with the still-registered old one, so this invocation goes local
    fs::write(proj.join("foo.h"), "#pragma once\nint foo_value();\n// edited\n").unwrap();
    let result =
        daemon.handle_request(proj.clone(), args(&[&cc, "-c", "foo.cpp", "-o", "foo2.o"]));
    assert_eq!(result.exit_code, 0);
    assert!(proj.join("foo2.o").exists());
    assert_eq!(compile_count(&log), 2, "the second compile must have run locally");
    assert_eq!(
        worker.stats.sessions_failed_open.load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

#[test]
fn compiler_errors_are_results_not_fallbacks() {
    let tmp = tempfile::tempdir().unwrap();
    let (host_port, _worker) = start_worker(&tmp.path().join("worker"));
    let proj = tmp.path().join("proj");
    write_project(&proj);
    let log = tmp.path().join("cc.log");
    let cc = failing_compiler(tmp.path(), &log);

    let daemon = make_daemon(&[host_port], "client-err");
    let result =
        daemon.handle_request(proj.clone(), args(&[&cc, "-c", "foo.cpp", "-o", "foo.o"]));
    assert_eq!(result.exit_code, 3);
    assert!(String::from_utf8_lossy(&result.stderr).contains("error: boom"));
    // exactly one remote run; a fallback would have made it two
    assert_eq!(compile_count(&log), 1);
    assert!(!proj.join("foo.o").exists());
}

#[test]
fn large_files_travel_in_many_chunks() {
    let tmp = tempfile::tempdir().unwrap();
    let (host_port, _worker) = start_worker(&tmp.path().join("worker"));
    let proj = tmp.path().join("proj");
    fs::create_dir_all(&proj).unwrap();
    // several 64 KiB chunks in both directions (the object is a copy)
    let big = format!("#include \"foo.h\"\n{}", "// ballast line\n".repeat(20_000));
    fs::write(proj.join("big.cpp"), &big).unwrap();
    fs::write(proj.join("foo.h"), "#pragma once\n").unwrap();
    let log = tmp.path().join("cc.log");
    let cc = fake_compiler(tmp.path(), &log);

    let daemon = make_daemon(&[host_port], "client-big");
    let result =
        daemon.handle_request(proj.clone(), args(&[&cc, "-c", "big.cpp", "-o", "big.o"]));
    assert_eq!(result.exit_code, 0);
    assert_eq!(fs::read(proj.join("big.o")).unwrap(), big.as_bytes());
}

#[test]
fn own_pch_is_compiled_remotely_exactly_once() {
    let tmp = tempfile::tempdir().unwrap();
    let (host_port, worker) = start_worker(&tmp.path().join("worker"));
    let proj = tmp.path().join("proj");
    fs::create_dir_all(&proj).unwrap();
    fs::write(proj.join("inner.h"), "#pragma once\nint inner;\n").unwrap();
    fs::write(proj.join("all.h"), "#include \"inner.h\"\n").unwrap();
    fs::write(proj.join("main.cpp"), "#include \"all.h\"\nint main() { return 0; }\n").unwrap();
    fs::write(proj.join("other.cpp"), "#include \"all.h\"\nint other() { return 1; }\n").unwrap();
    let log = tmp.path().join("cc.log");
    let cc = fake_compiler(tmp.path(), &log);

    let daemon = make_daemon(&[host_port], "client-pch");

    // "generate a pch": what lands on disk is the portable container
    let result = daemon.handle_request(
        proj.clone(),
        args(&[&cc, "-x", "c++-header", "all.h", "-o", "all.h.gch"]),
    );
    assert_eq!(result.exit_code, 0, "stderr: {}", String::from_utf8_lossy(&result.stderr));
    assert!(proj.join("all.h.rcc-pch").exists());
    assert!(!proj.join("all.h.gch").exists(), "no real pch client-side");
    assert_eq!(compile_count(&log), 0, "nothing compiled yet");

    // first dependent compile uploads the container; the worker builds
    // the real pch once, then the unit itself
    let result =
        daemon.handle_request(proj.clone(), args(&[&cc, "-c", "main.cpp", "-o", "main.o"]));
    assert_eq!(result.exit_code, 0, "stderr: {}", String::from_utf8_lossy(&result.stderr));
    assert!(proj.join("main.o").exists());
    let pch_compiles = || {
        fs::read_to_string(&log)
            .unwrap_or_default()
            .lines()
            .filter(|l| l.contains("c++-header"))
            .count()
    };
    assert_eq!(pch_compiles(), 1);

    // the second dependent compile reuses the compiled pch
    let result =
        daemon.handle_request(proj.clone(), args(&[&cc, "-c", "other.cpp", "-o", "other.o"]));
    assert_eq!(result.exit_code, 0);
    assert_eq!(pch_compiles(), 1, "the pch must not be recompiled");
    assert_eq!(
        worker.stats.pch_compilations.load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

#[test]
fn reconnect_with_the_same_client_id_replaces_the_stale_record() {
    let tmp = tempfile::tempdir().unwrap();
    let (host_port, worker) = start_worker(&tmp.path().join("worker"));
    let proj = tmp.path().join("proj");
    write_project(&proj);
    let log = tmp.path().join("cc.log");
    let cc = fake_compiler(tmp.path(), &log);

    // first daemon dies without a stop-client
    let first = make_daemon(&[host_port.clone()], "client-X");
    let result =
        first.handle_request(proj.clone(), args(&[&cc, "-c", "foo.cpp", "-o", "foo.o"]));
    assert_eq!(result.exit_code, 0);
    drop(first);

    // the worker eventually purges the silent client (the inactivity GC
    // path); the stale daemon's streams die with the record
    let stale = worker.clients.get("client-X").expect("record still present");
    worker.clients.delete_client(&stale);
    std::thread::sleep(Duration::from_millis(300));

    // a new daemon under the same id is accepted and fully functional
    let second = make_daemon(&[host_port], "client-X");
    let result =
        second.handle_request(proj.clone(), args(&[&cc, "-c", "foo.cpp", "-o", "foo2.o"]));
    assert_eq!(result.exit_code, 0);
    assert!(proj.join("foo2.o").exists());
    assert_eq!(worker.clients.active_count(), 1);
}
