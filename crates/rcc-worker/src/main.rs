//! rcc-worker entry point.

use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use rcc_worker::clients::ClientsRegistry;
use rcc_worker::cxx::CxxLauncher;
use rcc_worker::file_cache::{ObjCache, SrcCache};
use rcc_worker::pch_store::PchStore;
use rcc_worker::server::Worker;
use rcc_worker::stats::Stats;
use rcc_worker::system_headers::SystemHeaders;
use rcc_worker::{cron, logging};
use tracing::info;

/// Compilation worker of the distributed C/C++ build cache.
#[derive(Parser)]
#[command(name = "rcc-worker", version)]
struct Cli {
    /// Binding address.
    #[arg(long, default_value = "0.0.0.0", env = "RCC_HOST")]
    host: String,

    /// Listening port.
    #[arg(long, default_value_t = 43210, env = "RCC_PORT")]
    port: u16,

    /// Root directory for working dirs and caches. Renamed aside and
    /// wiped on every start: caches are deliberately volatile.
    #[arg(long, default_value = "/tmp/rcc-worker", env = "RCC_WORKING_DIR")]
    working_dir: PathBuf,

    /// Source cache hard limit, in bytes (soft limit is 80% of this).
    #[arg(long, default_value_t = 4 * 1024 * 1024 * 1024, env = "RCC_SRC_CACHE_LIMIT")]
    src_cache_limit: i64,

    /// Object cache hard limit, in bytes (soft limit is 80% of this).
    #[arg(long, default_value_t = 16 * 1024 * 1024 * 1024, env = "RCC_OBJ_CACHE_LIMIT")]
    obj_cache_limit: i64,

    /// Log file; stderr when omitted. SIGHUP reopens it.
    #[arg(long, env = "RCC_LOG_FILENAME")]
    log_filename: Option<PathBuf>,

    /// Verbosity: -1 errors only, 0 info, 1 debug, 2 trace.
    #[arg(long, default_value_t = 0, env = "RCC_LOG_VERBOSITY")]
    log_verbosity: i32,

    /// statsd udp endpoint (host:port); stats are not exported when
    /// omitted.
    #[arg(long, env = "RCC_STATSD")]
    statsd: Option<String>,

    /// Maximum parallel compiler processes; defaults to the CPU count.
    #[arg(long, env = "RCC_MAX_PARALLEL_CXX")]
    max_parallel_cxx: Option<usize>,

    /// Seconds a silent client survives before its working dir is purged.
    #[arg(long, default_value_t = 900, env = "RCC_INACTIVE_CLIENT_TIMEOUT")]
    inactive_client_timeout: u64,
}

/// Make sure the working root exists and is empty. A pre-existing tree is
/// renamed to an `.old.{timestamp}` sibling and deleted in the background
/// so startup stays fast even after an unclean shutdown.
fn cleanup_working_dir(root: &Path) -> std::io::Result<()> {
    if root.exists() {
        let aside = root.with_file_name(format!(
            "{}.old.{}",
            root.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
            chrono::Utc::now().timestamp(),
        ));
        fs::rename(root, &aside)?;
        std::thread::spawn(move || {
            let _ = fs::remove_dir_all(&aside);
        });
    }
    fs::create_dir_all(root)
}

fn failed_start(message: &str, e: impl std::fmt::Display) -> ! {
    eprintln!("failed to start rcc-worker: {message}: {e}");
    std::process::exit(1);
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = cleanup_working_dir(&cli.working_dir) {
        failed_start("can't prepare the working directory", e);
    }
    let log = match logging::init(cli.log_filename.clone(), cli.log_verbosity) {
        Ok(log) => log,
        Err(e) => failed_start("can't init the logger", e),
    };

    let max_parallel = cli.max_parallel_cxx.unwrap_or_else(|| {
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    });

    let clients = ClientsRegistry::new(
        cli.working_dir.join("clients"),
        Duration::from_secs(cli.inactive_client_timeout),
    );
    if let Err(e) = fs::create_dir_all(cli.working_dir.join("clients")) {
        failed_start("can't create the clients directory", e);
    }
    let src_cache = match SrcCache::new(cli.working_dir.join("src-cache"), cli.src_cache_limit) {
        Ok(c) => c,
        Err(e) => failed_start("can't init the src cache", e),
    };
    let obj_cache = match ObjCache::new(
        cli.working_dir.join("obj-cache"),
        cli.working_dir.join("cxx-out"),
        cli.obj_cache_limit,
    ) {
        Ok(c) => c,
        Err(e) => failed_start("can't init the obj cache", e),
    };
    let pch = match PchStore::new(cli.working_dir.join("pch")) {
        Ok(p) => p,
        Err(e) => failed_start("can't init the pch store", e),
    };
    let stats = match Stats::new(cli.statsd.as_deref()) {
        Ok(s) => s,
        Err(e) => failed_start("can't connect to statsd", e),
    };

    let worker = Arc::new(Worker {
        start_time: Instant::now(),
        args: std::env::args().collect(),
        clients,
        cxx: CxxLauncher::new(max_parallel),
        pch,
        system_headers: SystemHeaders::new(),
        src_cache,
        obj_cache,
        stats,
        log,
    });

    cron::install_signal_handlers();
    cron::spawn(Arc::clone(&worker));

    let bind_addr = format!("{}:{}", cli.host, cli.port);
    let listener = match TcpListener::bind(&bind_addr) {
        Ok(l) => l,
        Err(e) => failed_start(&format!("can't listen on {bind_addr}"), e),
    };
    info!(
        addr = %bind_addr,
        max_parallel_cxx = max_parallel,
        version = rcc_protocol::VERSION,
        "rcc-worker started"
    );

    if let Err(e) = worker.serve(listener) {
        failed_start("accept loop failed", e);
    }
}
