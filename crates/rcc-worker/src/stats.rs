//! Worker counters and statsd emission.
//!
//! Counters are plain atomics bumped from the hot paths; the cron loop
//! flushes a gauge snapshot to a statsd UDP endpoint every few seconds.
//! Without a configured endpoint everything still counts (the `status`
//! RPC reads the same numbers), it just is not exported.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicI64, Ordering};

use tracing::warn;

use crate::server::Worker;

#[derive(Default)]
pub struct Stats {
    statsd: Option<UdpSocket>,

    pub sessions_count: AtomicI64,
    pub sessions_failed_open: AtomicI64,
    pub sessions_from_obj_cache: AtomicI64,
    pub clients_unauthenticated: AtomicI64,
    pub files_received: AtomicI64,
    pub bytes_received: AtomicI64,
    pub files_sent: AtomicI64,
    pub bytes_sent: AtomicI64,
    pub pch_compilations: AtomicI64,
    pub pch_compilations_failed: AtomicI64,
}

impl Stats {
    /// `endpoint` is a `host:port` for statsd, or `None` to keep stats
    /// local-only.
    pub fn new(endpoint: Option<&str>) -> std::io::Result<Self> {
        let statsd = match endpoint {
            Some(addr) if !addr.is_empty() => {
                let socket = UdpSocket::bind("0.0.0.0:0")?;
                socket.connect(addr)?;
                Some(socket)
            }
            _ => None,
        };
        Ok(Self { statsd, ..Default::default() })
    }

    pub fn inc(counter: &AtomicI64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicI64, v: i64) {
        counter.fetch_add(v, Ordering::Relaxed);
    }

    /// Send the gauge snapshot. Called from cron.
    pub fn emit(&self, worker: &Worker) {
        let Some(socket) = &self.statsd else {
            return;
        };
        let datagram = self.render_gauges(worker);
        if let Err(e) = socket.send(datagram.as_bytes()) {
            warn!(error = %e, "statsd send failed");
        }
    }

    fn render_gauges(&self, worker: &Worker) -> String {
        let g = |name: &str, value: i64| format!("rcc.worker.{name}:{value}|g\n");
        let mut out = String::with_capacity(1024);
        out.push_str(&g("clients.active", worker.clients.active_count()));
        out.push_str(&g("clients.completed", worker.clients.completed_count()));
        out.push_str(&g("sessions.total", self.sessions_count.load(Ordering::Relaxed)));
        out.push_str(&g("sessions.active", worker.clients.active_sessions_count()));
        out.push_str(&g(
            "sessions.from_obj_cache",
            self.sessions_from_obj_cache.load(Ordering::Relaxed),
        ));
        out.push_str(&g(
            "sessions.failed_open",
            self.sessions_failed_open.load(Ordering::Relaxed),
        ));
        out.push_str(&g("cxx.calls", worker.cxx.total_calls()));
        out.push_str(&g("cxx.now_compiling", worker.cxx.now_compiling()));
        out.push_str(&g("cxx.waiting", worker.cxx.waiting_in_queue()));
        out.push_str(&g("cxx.duration_ms", worker.cxx.total_duration_ms()));
        out.push_str(&g("cxx.nonzero_exits", worker.cxx.nonzero_exit_count()));
        out.push_str(&g("src_cache.bytes", worker.src_cache.0.bytes_on_disk()));
        out.push_str(&g("src_cache.files", worker.src_cache.0.files_count()));
        out.push_str(&g("src_cache.purged", worker.src_cache.0.purged_count()));
        out.push_str(&g("obj_cache.bytes", worker.obj_cache.cache.bytes_on_disk()));
        out.push_str(&g("obj_cache.files", worker.obj_cache.cache.files_count()));
        out.push_str(&g("obj_cache.purged", worker.obj_cache.cache.purged_count()));
        out.push_str(&g("files.received", self.files_received.load(Ordering::Relaxed)));
        out.push_str(&g("bytes.received", self.bytes_received.load(Ordering::Relaxed)));
        out.push_str(&g("files.sent", self.files_sent.load(Ordering::Relaxed)));
        out.push_str(&g("bytes.sent", self.bytes_sent.load(Ordering::Relaxed)));
        out.push_str(&g("pch.compilations", self.pch_compilations.load(Ordering::Relaxed)));
        out.push_str(&g(
            "pch.compilations_failed",
            self.pch_compilations_failed.load(Ordering::Relaxed),
        ));
        out
    }
}
