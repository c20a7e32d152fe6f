//! The per-worker receive stream.
//!
//! One thread per worker waits for the worker to push finished sessions:
//! a metadata frame (exit code, outputs, object size) and, for clean
//! compiles, the object body in chunks. Frames are routed to invocations
//! by session id through the daemon-wide table. A broken stream fails at
//! most the one invocation named in the worker's error frame — everything
//! else keeps waiting and survives the stream's recreation.

use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rcc_protocol::framing::{self, CHUNK_SIZE};
use rcc_protocol::messages::{ErrorCode, ObjHeader, RecvFrame, StreamKind};
use tracing::{debug, error, info};

use crate::invocation::{ActiveInvocations, InvocationResult};
use crate::remote::{open_stream, RemoteShared};

type Stream = (BufReader<TcpStream>, BufWriter<TcpStream>);

const RECREATE_PAUSE: Duration = Duration::from_millis(100);

/// Thread body. Runs until the worker is marked unavailable.
pub fn run_receiver(
    shared: Arc<RemoteShared>,
    active: Arc<ActiveInvocations>,
    mut stream: Option<Stream>,
) {
    let mut chunk_buf = vec![0u8; CHUNK_SIZE];
    loop {
        let (reader, _writer) = match stream.take() {
            Some(s) => s,
            None => {
                std::thread::sleep(RECREATE_PAUSE);
                match open_stream(&shared.host_port, StreamKind::Receive, &shared.client_id) {
                    Ok(fresh) => fresh,
                    Err(e) => {
                        shared.mark_unavailable(&format!("can't recreate the receive stream: {e}"));
                        return;
                    }
                }
            }
        };

        match drain_stream(&shared, &active, reader, &mut chunk_buf) {
            StreamEnd::Recreate => {} // loop around with stream = None
            StreamEnd::GiveUp => return,
        }
    }
}

enum StreamEnd {
    Recreate,
    GiveUp,
}

fn drain_stream(
    shared: &RemoteShared,
    active: &ActiveInvocations,
    mut reader: BufReader<TcpStream>,
    chunk_buf: &mut [u8],
) -> StreamEnd {
    loop {
        let frame: RecvFrame = match framing::read_message(&mut reader) {
            Ok(frame) => frame,
            Err(e) => {
                error!(remote = %shared.host, error = %e, "receive stream broke");
                return StreamEnd::Recreate;
            }
        };

        match frame {
            RecvFrame::Err(wire_error) => {
                // the worker names the one session this failure concerns
                if let Some(session_id) = wire_error.session_id {
                    if let Some(invocation) = active.get(session_id) {
                        invocation.recv_done(Some(wire_error.to_string()));
                    }
                }
                if wire_error.code == ErrorCode::Unauthenticated {
                    shared.mark_unavailable(&wire_error.to_string());
                    return StreamEnd::GiveUp;
                }
                return StreamEnd::Recreate;
            }
            RecvFrame::More(chunk) => {
                error!(
                    session_id = chunk.session_id,
                    "stray continuation chunk, recreating the stream"
                );
                return StreamEnd::Recreate;
            }
            RecvFrame::Obj(header) => {
                match handle_obj(shared, active, &mut reader, header, chunk_buf) {
                    Ok(()) => {} // next session on the same stream
                    Err(e) => {
                        error!(remote = %shared.host, error = %e, "object reception failed");
                        return StreamEnd::Recreate;
                    }
                }
            }
        }
    }
}

/// Receive one session's result. A transport-level `Err` from here means
/// the stream position is unknown and it must be recreated; write
/// problems on the local object file fail only the invocation.
fn handle_obj(
    shared: &RemoteShared,
    active: &ActiveInvocations,
    reader: &mut BufReader<TcpStream>,
    header: ObjHeader,
    chunk_buf: &mut [u8],
) -> Result<(), String> {
    let invocation = active.get(header.session_id);
    if invocation.is_none() {
        debug!(session_id = header.session_id, "object for an unknown invocation, draining");
    }

    if let Some(invocation) = &invocation {
        invocation.set_result(InvocationResult {
            exit_code: header.exit_code,
            stdout: header.stdout.clone().into_bytes(),
            stderr: header.stderr.clone().into_bytes(),
            duration_ms: header.duration_ms,
        });
        if header.exit_code != 0 {
            info!(
                session_id = header.session_id,
                exit_code = header.exit_code,
                remote = %shared.host,
                "remote compiler exited with a non-zero code"
            );
        }
    }

    // a failed compile carries no body: the outputs in the header are
    // the whole result, and no local fallback follows
    if header.exit_code != 0 {
        if let Some(invocation) = invocation {
            invocation.recv_done(None);
        }
        return Ok(());
    }

    let dest = invocation
        .as_ref()
        .map(|inv| PathBuf::from(inv.parsed.output_abs(&inv.cwd)));
    let write_result = receive_body(reader, &header, dest.as_deref(), chunk_buf)?;

    if let Some(invocation) = invocation {
        invocation.recv_done(write_result.err());
        debug!(session_id = header.session_id, "object received");
    }
    Ok(())
}

/// Pull the object body off the stream. The outer `Result` is the stream
/// (mismatched chunks, short reads); the inner one is the local write.
fn receive_body(
    reader: &mut BufReader<TcpStream>,
    header: &ObjHeader,
    dest: Option<&std::path::Path>,
    chunk_buf: &mut [u8],
) -> Result<Result<(), String>, String> {
    let read_payload = |reader: &mut BufReader<TcpStream>, len: u64, buf: &mut [u8]| {
        framing::read_payload_into(reader, &mut buf[..len as usize]).map_err(|e| e.to_string())
    };

    // single-chunk fast path: most objects fit one chunk
    if header.payload_len >= header.file_size {
        read_payload(reader, header.payload_len, chunk_buf)?;
        let write_result = match dest {
            Some(dest) => fs::write(dest, &chunk_buf[..header.payload_len as usize])
                .map_err(|e| e.to_string()),
            None => Ok(()),
        };
        return Ok(write_result);
    }

    // multi-chunk: spool into a temp sibling, rename when complete
    let mut tmp: Option<(fs::File, PathBuf, PathBuf)> = None;
    let mut write_error: Option<String> = None;
    if let Some(dest) = dest {
        let tmp_path = dest.with_file_name(format!(
            "{}.part{}",
            dest.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
            std::process::id(),
        ));
        match fs::File::create(&tmp_path) {
            Ok(file) => tmp = Some((file, tmp_path, dest.to_path_buf())),
            Err(e) => write_error = Some(e.to_string()),
        }
    }

    let mut received = 0u64;
    let mut payload_len = header.payload_len;
    loop {
        read_payload(reader, payload_len, chunk_buf)?;
        if write_error.is_none() {
            if let Some((file, _, _)) = &mut tmp {
                if let Err(e) = file.write_all(&chunk_buf[..payload_len as usize]) {
                    write_error = Some(e.to_string());
                }
            }
        }
        received += payload_len;
        if received >= header.file_size {
            break;
        }
        let next: RecvFrame = framing::read_message(reader).map_err(|e| e.to_string())?;
        match next {
            RecvFrame::More(chunk) if chunk.session_id == header.session_id => {
                payload_len = chunk.payload_len;
            }
            _ => return Err("inconsistent stream, chunks mismatch".to_string()),
        }
    }

    if let Some((file, tmp_path, dest)) = tmp {
        drop(file);
        if write_error.is_none() {
            if let Err(e) = fs::rename(&tmp_path, &dest) {
                write_error = Some(e.to_string());
            }
        }
        let _ = fs::remove_file(&tmp_path);
    }
    Ok(match write_error {
        Some(e) => Err(e),
        None => Ok(()),
    })
}
