//! Background maintenance and signal handling.
//!
//! One thread ticks every five seconds: statsd emission, eviction of both
//! caches down to their soft limits, inactive-client GC. The same thread
//! watches the process signal flags — SIGTERM stops the worker
//! gracefully, SIGHUP reopens the log file for logrotate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info};

use crate::server::Worker;

static GOT_SIGTERM: AtomicBool = AtomicBool::new(false);
static GOT_SIGHUP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(sig: libc::c_int) {
    // async-signal-safe: flags only, the cron thread does the work
    match sig {
        libc::SIGTERM => GOT_SIGTERM.store(true, Ordering::SeqCst),
        libc::SIGHUP => GOT_SIGHUP.store(true, Ordering::SeqCst),
        _ => {}
    }
}

/// Install the signal handlers; call once at startup.
pub fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGHUP, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

const TICK: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(200);

/// Run the maintenance loop on a background thread.
pub fn spawn(worker: Arc<Worker>) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("cron".to_string())
        .spawn(move || run(worker))
        .unwrap_or_else(|e| panic!("can't spawn the cron thread: {e}"))
}

fn run(worker: Arc<Worker>) {
    loop {
        let tick_started = Instant::now();

        worker.stats.emit(&worker);
        worker.src_cache.0.evict_to_soft_limit();
        worker.obj_cache.cache.evict_to_soft_limit();
        worker.clients.delete_inactive_clients();

        while tick_started.elapsed() < TICK {
            if GOT_SIGHUP.swap(false, Ordering::SeqCst) {
                match worker.log.reopen() {
                    Ok(()) => info!("log file reopened"),
                    Err(e) => error!(error = %e, "could not reopen the log file"),
                }
            }
            if GOT_SIGTERM.swap(false, Ordering::SeqCst) {
                info!("got SIGTERM, stopping gracefully");
                worker.clients.stop_all_clients();
                worker.stats.emit(&worker);
                std::process::exit(0);
            }
            std::thread::sleep(POLL);
        }
    }
}
