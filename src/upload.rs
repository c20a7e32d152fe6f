//! The per-worker upload stream.
//!
//! One thread per worker drains a bounded queue of files and pipes them
//! over a single long-lived stream, one file after another, 64 KiB
//! chunks each. On any stream error the affected invocation fails (and
//! will compile locally); the stream itself is recreated for the next
//! file after a short pause. There are deliberately no upload retries:
//! a failed invocation falling back locally is simpler and cannot
//! poison caches.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::TcpStream;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

use rcc_protocol::framing::{self, CHUNK_SIZE};
use rcc_protocol::messages::{FileMeta, StreamKind, UploadAck, UploadChunk};
use tracing::{debug, info};

use crate::invocation::Invocation;
use crate::remote::{open_stream, RemoteShared};

/// One file of one invocation, queued for upload.
pub struct UploadRequest {
    pub invocation: Arc<Invocation>,
    pub file: FileMeta,
    pub file_index: u32,
}

type Stream = (BufReader<TcpStream>, BufWriter<TcpStream>);

const RECREATE_PAUSE: Duration = Duration::from_millis(100);

/// Thread body. Exits when the daemon drops the queue sender.
pub fn run_uploader(shared: Arc<RemoteShared>, queue: Receiver<UploadRequest>, mut stream: Option<Stream>) {
    let mut chunk_buf = vec![0u8; CHUNK_SIZE];

    while let Ok(request) = queue.recv() {
        if shared.is_unavailable() {
            request
                .invocation
                .upload_done(Some(format!("worker {} is unavailable", shared.host)));
            continue;
        }

        let connection = match &mut stream {
            Some(connection) => connection,
            None => {
                std::thread::sleep(RECREATE_PAUSE);
                match open_stream(&shared.host_port, StreamKind::Upload, &shared.client_id) {
                    Ok(fresh) => stream.insert(fresh),
                    Err(e) => {
                        shared.mark_unavailable(&format!("can't recreate the upload stream: {e}"));
                        request.invocation.upload_done(Some(e.to_string()));
                        continue;
                    }
                }
            }
        };

        debug!(
            size = request.file.size,
            path = %request.file.client_path,
            "uploading"
        );
        if request.file.size > CHUNK_SIZE as u64 {
            info!(size = request.file.size, path = %request.file.client_path, "uploading a large file");
        }

        match upload_one(connection, &shared, &request, &mut chunk_buf) {
            Ok(()) => request.invocation.upload_done(None),
            Err(UploadOneError::Rejected(ack_error)) => {
                // the worker refused the file (conflict, bad pch...);
                // the stream is past it and stays usable
                request.invocation.upload_done(Some(ack_error));
            }
            Err(UploadOneError::Stream(e)) => {
                // the stream may be mid-file; drop it and start fresh
                stream = None;
                request.invocation.upload_done(Some(e.clone()));
                if e.contains("UNAUTHENTICATED") {
                    shared.mark_unavailable(&e);
                }
            }
        }
    }
}

enum UploadOneError {
    /// Clean per-file rejection from the worker.
    Rejected(String),
    /// The stream itself broke.
    Stream(String),
}

fn upload_one(
    (reader, writer): &mut Stream,
    shared: &RemoteShared,
    request: &UploadRequest,
    chunk_buf: &mut [u8],
) -> Result<(), UploadOneError> {
    let stream_err = |e: &dyn std::fmt::Display| UploadOneError::Stream(e.to_string());

    let mut file = File::open(&request.file.client_path)
        .map_err(|e| UploadOneError::Rejected(format!("{}: {e}", request.file.client_path)))?;

    // an empty file is one zero-length chunk; anything else is as many
    // chunks as it takes, in order, until EOF
    let mut sent_any = false;
    loop {
        let n = file.read(chunk_buf).map_err(|e| stream_err(&e))?;
        if n == 0 && sent_any {
            break;
        }
        framing::write_message(
            writer,
            &UploadChunk {
                client_id: shared.client_id.clone(),
                session_id: request.invocation.session_id,
                file_index: request.file_index,
                payload_len: n as u64,
            },
        )
        .map_err(|e| stream_err(&e))?;
        writer
            .write_all(&chunk_buf[..n])
            .and_then(|()| writer.flush())
            .map_err(|e| stream_err(&e))?;
        sent_any = true;
        if n == 0 {
            break;
        }
    }

    let ack: UploadAck = framing::read_message(reader).map_err(|e| stream_err(&e))?;
    if ack.ok {
        return Ok(());
    }
    // the worker abandons the stream after any error ack, so every
    // rejection also means "recreate before the next file"
    match ack.error {
        Some(e) => Err(UploadOneError::Stream(e.to_string())),
        None => Err(UploadOneError::Stream("upload rejected".to_string())),
    }
}
