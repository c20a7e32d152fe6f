//! Management commands that talk to workers without starting a daemon:
//! status queries, log dumps and cache drops across the whole fleet.

use std::io::Write;
use std::path::Path;

use rcc_protocol::framing;
use rcc_protocol::messages::{
    ControlRequest, DropCachesReply, LogChunk, Reply, StatusReply, StreamHello, StreamKind,
};
use serde::de::DeserializeOwned;

use crate::remote::{host_without_port, open_stream, TransportError};

const MANAGEMENT_CLIENT_ID: &str = "management";

/// One request/response over a fresh control stream.
fn management_rpc<R: DeserializeOwned + Default>(
    host_port: &str,
    request: &ControlRequest,
) -> Result<R, TransportError> {
    let (mut reader, mut writer) =
        open_stream(host_port, StreamKind::Control, MANAGEMENT_CLIENT_ID)?;
    framing::write_message(&mut writer, request)?;
    let reply: Reply<R> = framing::read_message(&mut reader)?;
    Ok(reply.into_result()?)
}

/// `rcc check-servers`: print every worker's status.
pub fn check_servers(servers: &[String]) {
    for host_port in servers {
        println!("--- {host_port}");
        match management_rpc::<StatusReply>(host_port, &ControlRequest::Status) {
            Ok(status) => print_status(&status),
            Err(e) => println!("  unavailable: {e}"),
        }
    }
}

fn print_status(status: &StatusReply) {
    println!("  version {}, uptime {} sec", status.version, status.uptime_sec);
    println!("  args {:?}", status.args);
    println!("  uname {}; ulimit -n {}", status.uname, status.ulimit_nofile);
    println!("  g++: {}", status.gcc_version);
    println!("  clang: {}", status.clang_version);
    println!(
        "  src cache: {} files, {} bytes; obj cache: {} files, {} bytes",
        status.src_cache_files, status.src_cache_bytes, status.obj_cache_files,
        status.obj_cache_bytes,
    );
    println!(
        "  sessions: {} total, {} active; cxx calls {} (>10s: {}, >30s: {})",
        status.sessions_total, status.sessions_active, status.cxx_calls, status.cxx_more_10s,
        status.cxx_more_30s,
    );
    for remotes in &status.unique_remotes {
        println!("  remotes list {remotes}");
    }
}

/// `rcc drop-caches`: wipe the src and obj caches on every worker.
pub fn drop_all_caches(servers: &[String]) {
    for host_port in servers {
        match management_rpc::<DropCachesReply>(host_port, &ControlRequest::DropAllCaches) {
            Ok(dropped) => println!(
                "{host_port}: dropped {} src files, {} obj files",
                dropped.dropped_src_files, dropped.dropped_obj_files
            ),
            Err(e) => println!("{host_port}: unavailable: {e}"),
        }
    }
}

/// `rcc dump-logs`: fetch every worker's log files into `out_dir`,
/// named `{host}{ext}`.
pub fn dump_server_logs(servers: &[String], out_dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(out_dir)?;
    for host_port in servers {
        match dump_one(host_port, out_dir) {
            Ok(bytes) => println!("{host_port}: dumped {bytes} bytes"),
            Err(e) => println!("{host_port}: unavailable: {e}"),
        }
    }
    Ok(())
}

fn dump_one(host_port: &str, out_dir: &Path) -> Result<u64, TransportError> {
    let (mut reader, mut writer) =
        open_stream(host_port, StreamKind::Control, MANAGEMENT_CLIENT_ID)?;
    framing::write_message(&mut writer, &ControlRequest::DumpLogs)?;

    let host = host_without_port(host_port);
    let mut total = 0u64;
    let mut current: Option<(String, std::fs::File)> = None;
    loop {
        let chunk: LogChunk = framing::read_message(&mut reader)?;
        if chunk.ext.is_empty() {
            return Ok(total);
        }
        let payload = framing::read_payload(&mut reader, chunk.payload_len)?;
        let needs_new = current.as_ref().map(|(ext, _)| ext != &chunk.ext).unwrap_or(true);
        if needs_new {
            let file = std::fs::File::create(out_dir.join(format!("{host}{}", chunk.ext)))
                .map_err(TransportError::Io)?;
            current = Some((chunk.ext.clone(), file));
        }
        if let Some((_, file)) = &mut current {
            file.write_all(&payload).map_err(TransportError::Io)?;
        }
        total += chunk.payload_len;
    }
}
