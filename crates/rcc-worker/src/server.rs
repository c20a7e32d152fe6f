//! The worker service: TCP accept loop and the three stream handlers.
//!
//! Every connection starts with a hello frame declaring its role:
//! - `control` — request/response RPCs (client lifecycle, session setup,
//!   management);
//! - `upload` — client-to-worker file chunks, many files per stream;
//! - `receive` — worker-to-client compiled objects, pushed as sessions
//!   finish.
//!
//! A daemon keeps one connection of each kind per worker for its whole
//! life; broken streams are recreated client-side.

use std::fs;
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::Instant;

use rcc_protocol::framing::{self, FrameError, CHUNK_SIZE};
use rcc_protocol::messages::{
    ControlRequest, DropCachesReply, ErrorCode, LogChunk, ObjChunk, ObjHeader, RecvFrame, Reply,
    SessionStarted, StartClientRequest, StartSessionRequest, StatusReply, StreamHello, StreamKind,
    UploadAck, UploadChunk, WireError,
};
use rcc_protocol::VERSION;
use tracing::{debug, error, info, warn};

use crate::clients::{Client, ClientsRegistry, UploadState};
use crate::cxx::CxxLauncher;
use crate::file_cache::{make_obj_cache_key, ObjCache, SrcCache};
use crate::logging::LogWriter;
use crate::pch_store::PchStore;
use crate::session::{build_server_cmd_line, Session};
use crate::stats::Stats;
use crate::system_headers::SystemHeaders;

/// Everything the worker owns. One instance per process, shared by all
/// connection threads behind an `Arc`.
pub struct Worker {
    pub start_time: Instant,
    pub args: Vec<String>,
    pub clients: ClientsRegistry,
    pub cxx: CxxLauncher,
    pub pch: PchStore,
    pub system_headers: SystemHeaders,
    pub src_cache: SrcCache,
    pub obj_cache: ObjCache,
    pub stats: Stats,
    pub log: LogWriter,
}

impl Worker {
    /// Accept connections forever, one thread per stream.
    pub fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!("worker is accepting connections");
        loop {
            let (stream, peer) = listener.accept()?;
            let worker = Arc::clone(&self);
            std::thread::Builder::new()
                .name("conn".to_string())
                .spawn(move || {
                    if let Err(e) = handle_connection(&worker, stream) {
                        match e {
                            ConnError::Frame(FrameError::Eof) => {}
                            e => debug!(%peer, error = %e, "connection closed"),
                        }
                    }
                })
                .map_err(|e| std::io::Error::other(format!("can't spawn: {e}")))?;
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum ConnError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Protocol(String),
}

fn handle_connection(worker: &Arc<Worker>, stream: TcpStream) -> Result<(), ConnError> {
    stream.set_nodelay(true)?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);

    let hello: StreamHello = framing::read_message(&mut reader)?;
    match hello.kind {
        StreamKind::Control => control_loop(worker, &mut reader, &mut writer),
        StreamKind::Upload => upload_loop(worker, &hello.client_id, &mut reader, &mut writer),
        StreamKind::Receive => receive_loop(worker, &hello.client_id, &mut writer),
    }
}

// ---------------------------------------------------------------- control

fn control_loop(
    worker: &Arc<Worker>,
    reader: &mut BufReader<TcpStream>,
    writer: &mut BufWriter<TcpStream>,
) -> Result<(), ConnError> {
    loop {
        let request: ControlRequest = framing::read_message(reader)?;
        match request {
            ControlRequest::StartClient(req) => {
                let reply = handle_start_client(worker, req);
                framing::write_message(writer, &reply)?;
            }
            ControlRequest::StartSession(req) => {
                let reply = match handle_start_session(worker, req) {
                    Ok(started) => Reply::success(started),
                    Err(e) => Reply::failure(e),
                };
                framing::write_message(writer, &reply)?;
            }
            ControlRequest::StopClient { client_id } => {
                if let Some(client) = worker.clients.get(&client_id) {
                    info!(client_id = %client_id, n_clients = worker.clients.active_count() - 1,
                          "client disconnected");
                    let registry_client = client.clone();
                    let worker = Arc::clone(worker);
                    // removing a big working dir takes a while; reply now
                    std::thread::spawn(move || {
                        worker.clients.delete_client(&registry_client);
                    });
                }
                framing::write_message(writer, &Reply::success(()))?;
            }
            ControlRequest::Status => {
                framing::write_message(writer, &Reply::success(build_status(worker)))?;
            }
            ControlRequest::DumpLogs => {
                dump_logs(worker, writer)?;
            }
            ControlRequest::DropAllCaches => {
                info!("dropping all caches by request");
                let reply = DropCachesReply {
                    dropped_src_files: worker.src_cache.0.drop_all(),
                    dropped_obj_files: worker.obj_cache.cache.drop_all(),
                };
                framing::write_message(writer, &Reply::success(reply))?;
            }
        }
    }
}

fn handle_start_client(worker: &Arc<Worker>, req: StartClientRequest) -> Reply<()> {
    match worker.clients.on_client_connected(&req.client_id, req.disable_obj_cache) {
        Ok(client) => {
            info!(
                client_id = %client.client_id,
                version = %req.client_version,
                user = %req.host_user,
                n_clients = worker.clients.active_count(),
                "new client"
            );
            if !req.all_remotes.is_empty()
                && worker.clients.remotes_list_first_seen(&req.all_remotes, &req.client_id)
            {
                info!(client_id = %req.client_id, remotes = %req.all_remotes, "new remotes list");
            }
            Reply::success(())
        }
        Err(e) => Reply::failure(WireError::new(
            ErrorCode::Internal,
            format!("can't create the client working dir: {e}"),
        )),
    }
}

fn handle_start_session(
    worker: &Arc<Worker>,
    req: StartSessionRequest,
) -> Result<SessionStarted, WireError> {
    let Some(client) = worker.clients.get(&req.client_id) else {
        Stats::inc(&worker.stats.clients_unauthenticated);
        warn!(client_id = %req.client_id, "unauthenticated client on session start");
        return Err(WireError::new(
            ErrorCode::Unauthenticated,
            format!("client {} not found; the worker was probably restarted", req.client_id),
        ));
    };
    client.touch();

    // declare every file, deciding mirrored vs worker-local system path
    let mut slots = Vec::with_capacity(req.required_files.len());
    for meta in &req.required_files {
        let server_path =
            if worker.system_headers.matches(&meta.client_path, meta.size, &meta.digest) {
                PathBuf::from(&meta.client_path)
            } else {
                client.map_client_path(&meta.client_path)
            };
        match client.declare_file(&meta.client_path, meta.size, meta.digest, server_path) {
            Ok(slot) => slots.push(slot),
            Err(e) => {
                Stats::inc(&worker.stats.sessions_failed_open);
                error!(session_id = req.session_id, error = %e, "failed to open session");
                return Err(WireError::for_session(
                    ErrorCode::DependencyConflict,
                    e.to_string(),
                    req.session_id,
                ));
            }
        }
    }
    Stats::inc(&worker.stats.sessions_count);

    let cwd = client.map_client_path(&req.cwd);
    // the input is one of the required files (the client lists it last);
    // its server path follows that entry — the mirror, or the worker's
    // own file for a matched system path
    let input_abs = if req.input_path.starts_with('/') {
        req.input_path.clone()
    } else {
        format!("{}/{}", req.cwd.trim_end_matches('/'), req.input_path)
    };
    let input_server_path = req
        .required_files
        .iter()
        .position(|m| m.client_path == input_abs)
        .map(|i| client.file(slots[i]).server_path)
        .unwrap_or_else(|| client.map_client_path(&input_abs));
    let obj_out_path =
        worker.obj_cache.obj_out_path(&client.client_id, req.session_id, &req.input_path);
    let cmd_line = build_server_cmd_line(
        &client,
        &req.args,
        &req.include_dir_args,
        &obj_out_path,
        &input_server_path,
    );
    let session = Arc::new(Session::new(
        req.session_id,
        client.client_id.clone(),
        input_server_path,
        obj_out_path,
        cwd,
        req.compiler_name.clone(),
        cmd_line,
        slots,
    ));

    // optimistic path: the object was compiled before (maybe for another
    // client) — no uploads, no compiler, stream it right away
    if !client.disable_obj_cache {
        let deps: Vec<_> = req.required_files.iter().map(|m| (m.size, m.digest)).collect();
        let key = make_obj_cache_key(&req.compiler_name, &req.args, &deps, &req.input_path);
        session.set_obj_cache_key(key);
        if worker.obj_cache.cache.restore_hard_link(&session.obj_out_path, &key) {
            session.try_start_compilation();
            client.register_session(session.clone());
            Stats::inc(&worker.stats.sessions_from_obj_cache);
            info!(
                session_id = req.session_id,
                client_id = %client.client_id,
                input = %req.input_path,
                "session started from the obj cache"
            );
            client.ready.push(session);
            return Ok(SessionStarted::default());
        }
    }

    client.mkdir_all_for_session(&session).map_err(|e| {
        WireError::for_session(
            ErrorCode::Internal,
            format!("mkdir failed: {e}"),
            req.session_id,
        )
    })?;

    // classify every file; a file is requested for upload at most once
    // across all concurrent sessions of this client
    let now = Instant::now();
    let mut upload_indices = Vec::new();
    for (index, &slot) in session.files.iter().enumerate() {
        let mut restored_pch: Option<PathBuf> = None;
        client.with_file(slot, |file| match file.state {
            UploadState::JustCreated => {
                if !file.server_path.starts_with(&client.working_dir) {
                    // the worker's own system header serves this path
                    file.state = UploadState::Uploaded;
                } else if worker.src_cache.0.restore_hard_link(&file.server_path, &file.digest) {
                    debug!(path = %file.server_path.display(), "restored from src cache");
                    file.state = UploadState::Uploaded;
                    if file.server_path.extension().is_some_and(|e| e == "rcc-pch") {
                        restored_pch = Some(file.server_path.clone());
                    }
                } else {
                    file.state = UploadState::Uploading { since: now };
                    upload_indices.push(index as u32);
                }
            }
            UploadState::Uploading { .. } => {
                if file.is_upload_hung(now) {
                    warn!(
                        session_id = req.session_id,
                        path = %file.server_path.display(),
                        "upload hung, re-requesting"
                    );
                    file.state = UploadState::Uploading { since: now };
                    upload_indices.push(index as u32);
                }
            }
            UploadState::UploadError => {
                file.state = UploadState::Uploading { since: now };
                upload_indices.push(index as u32);
            }
            UploadState::Uploaded => {}
        });
        if let Some(pch_path) = restored_pch {
            // the container is back; the compiled real pch may already be
            // registered from its first upload
            if let Ok(own) = rcc_protocol::pch::OwnPch::parse(&pch_path) {
                if let Err(e) = worker.pch.link_real_pch(&pch_path, &own.fingerprint) {
                    debug!(error = %e, "real pch not linkable yet");
                }
            }
        }
    }
    if !session.input_server_path.starts_with(&client.working_dir)
        && session.input_server_path.starts_with("/")
    {
        // the input itself is served by a worker-local system file
        symlink_system_deps_into_mirror(&client, &session);
    }

    info!(
        session_id = req.session_id,
        client_id = %client.client_id,
        uploads = upload_indices.len(),
        input = %req.input_path,
        "session started"
    );
    client.register_session(session);
    // files restored from cache may have completed other sessions too
    scan_and_launch(worker, &client);

    Ok(SessionStarted { upload_indices })
}

/// When the input itself is served by a worker-local system path, the
/// compiler never enters the mirror for it — but rewritten `-I` dirs still
/// point into the mirror. Any dependency that was *not* mirrored (another
/// system match) is symlinked into its mirror position so those lookups
/// resolve.
fn symlink_system_deps_into_mirror(client: &Arc<Client>, session: &Session) {
    for &slot in &session.files {
        let file = client.file(slot);
        if !file.server_path.starts_with(&client.working_dir) {
            let mirror = client.map_client_path(&file.server_path.to_string_lossy());
            if let Some(parent) = mirror.parent() {
                let _ = fs::create_dir_all(parent);
            }
            #[cfg(unix)]
            let _ = std::os::unix::fs::symlink(&file.server_path, &mirror);
        }
    }
}

/// Launch the compiler for every session of this client whose dependency
/// set just became complete. Fired after each upload and session start.
pub fn scan_and_launch(worker: &Arc<Worker>, client: &Arc<Client>) {
    for session in client.sessions_awaiting_files() {
        if client.all_files_uploaded(&session) && session.try_start_compilation() {
            let worker = Arc::clone(worker);
            let client = Arc::clone(client);
            std::thread::Builder::new()
                .name(format!("cxx-{}", session.session_id))
                .spawn(move || worker.cxx.compile_session(&worker, &client, &session))
                .ok();
        }
    }
}

// ----------------------------------------------------------------- upload

fn upload_loop(
    worker: &Arc<Worker>,
    client_id: &str,
    reader: &mut BufReader<TcpStream>,
    writer: &mut BufWriter<TcpStream>,
) -> Result<(), ConnError> {
    let Some(client) = worker.clients.get(client_id) else {
        Stats::inc(&worker.stats.clients_unauthenticated);
        let err = WireError::new(ErrorCode::Unauthenticated, format!("client {client_id} not found"));
        framing::write_message(writer, &UploadAck { ok: false, error: Some(err) })?;
        return Ok(());
    };

    static UPLOAD_SEQ: AtomicI64 = AtomicI64::new(0);
    let mut chunk_buf = vec![0u8; CHUNK_SIZE];

    loop {
        let first: UploadChunk = framing::read_message(reader)?;
        client.touch();

        let (slot, file) = match lookup_upload_target(&client, &first) {
            Ok(pair) => pair,
            Err(message) => {
                error!(session_id = first.session_id, %message, "bad upload chunk");
                let err = WireError::for_session(
                    ErrorCode::InvalidRequest,
                    message,
                    first.session_id,
                );
                framing::write_message(writer, &UploadAck { ok: false, error: Some(err) })?;
                return Ok(());
            }
        };

        let seq = UPLOAD_SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let received = receive_file(reader, &first, file.size, &file.server_path, seq, &mut chunk_buf);
        if let Err(e) = received {
            client.with_file(slot, |f| f.state = UploadState::UploadError);
            error!(
                session_id = first.session_id,
                path = %file.server_path.display(),
                error = %e,
                "upload failed"
            );
            let err = WireError::for_session(
                ErrorCode::InvalidRequest,
                format!("can't receive {}: {e}", client.map_server_path(&file.server_path.to_string_lossy())),
                first.session_id,
            );
            framing::write_message(writer, &UploadAck { ok: false, error: Some(err) })?;
            return Ok(());
        }

        // a freshly uploaded pch container is compiled eagerly, before the
        // sessions depending on it are released
        if file.server_path.extension().is_some_and(|e| e == "rcc-pch") {
            Stats::inc(&worker.stats.pch_compilations);
            if let Err(e) = worker.pch.compile_uploaded(&worker.cxx, &file.server_path) {
                Stats::inc(&worker.stats.pch_compilations_failed);
                client.with_file(slot, |f| f.state = UploadState::UploadError);
                error!(path = %file.server_path.display(), error = %e, "pch compilation failed");
                let err = WireError::for_session(
                    ErrorCode::Internal,
                    format!("can't compile pch: {e}"),
                    first.session_id,
                );
                framing::write_message(writer, &UploadAck { ok: false, error: Some(err) })?;
                return Ok(());
            }
        }

        client.with_file(slot, |f| f.state = UploadState::Uploaded);
        debug!(
            session_id = first.session_id,
            size = file.size,
            path = %file.server_path.display(),
            "file uploaded"
        );
        // other sessions of this client may be waiting on this very file
        scan_and_launch(worker, &client);
        framing::write_message(writer, &UploadAck { ok: true, error: None })?;

        let hint = file
            .server_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Err(e) = worker.src_cache.0.store(&file.server_path, &hint, file.digest, file.size) {
            warn!(path = %file.server_path.display(), error = %e, "src cache store failed");
        }
        Stats::inc(&worker.stats.files_received);
        Stats::add(&worker.stats.bytes_received, file.size as i64);
    }
}

fn lookup_upload_target(
    client: &Arc<Client>,
    chunk: &UploadChunk,
) -> Result<(usize, crate::clients::FileEntry), String> {
    let session = client
        .session(chunk.session_id)
        .ok_or_else(|| format!("unknown session {}", chunk.session_id))?;
    let slot = *session
        .files
        .get(chunk.file_index as usize)
        .ok_or_else(|| format!("file index {} out of range", chunk.file_index))?;
    Ok((slot, client.file(slot)))
}

/// Stream one file's chunks into a temp sibling, then rename into place.
/// The temp file prevents a half-written file from being visible under the
/// final name when a slow upload is re-requested concurrently.
fn receive_file(
    reader: &mut BufReader<TcpStream>,
    first: &UploadChunk,
    expected_size: u64,
    server_path: &std::path::Path,
    seq: i64,
    chunk_buf: &mut Vec<u8>,
) -> Result<(), ConnError> {
    let tmp_path = server_path.with_file_name(format!(
        "{}.upl{}",
        server_path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
        seq,
    ));

    let result = (|| -> Result<(), ConnError> {
        let mut out = fs::File::create(&tmp_path)?;
        let mut received = 0u64;
        let mut chunk = first.clone();
        loop {
            let len = chunk.payload_len as usize;
            if chunk_buf.len() < len {
                chunk_buf.resize(len, 0);
            }
            framing::read_payload_into(reader, &mut chunk_buf[..len])?;
            out.write_all(&chunk_buf[..len])?;
            received += chunk.payload_len;
            if received >= expected_size {
                break;
            }
            chunk = framing::read_message(reader)?;
            if chunk.session_id != first.session_id || chunk.file_index != first.file_index {
                return Err(ConnError::Protocol("inconsistent stream, chunks mismatch".into()));
            }
        }
        out.flush()?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            fs::rename(&tmp_path, server_path)?;
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp_path);
            Err(e)
        }
    }
}

// ---------------------------------------------------------------- receive

fn receive_loop(
    worker: &Arc<Worker>,
    client_id: &str,
    writer: &mut BufWriter<TcpStream>,
) -> Result<(), ConnError> {
    let Some(client) = worker.clients.get(client_id) else {
        Stats::inc(&worker.stats.clients_unauthenticated);
        let err = WireError::new(ErrorCode::Unauthenticated, format!("client {client_id} not found"));
        framing::write_message(writer, &RecvFrame::Err(err))?;
        return Ok(());
    };

    let mut chunk_buf = vec![0u8; CHUNK_SIZE];
    while let Some(session) = client.ready.pop() {
        client.touch();
        let result = session.take_result();

        let sent = if result.exit_code != 0 {
            framing::write_message(
                writer,
                &RecvFrame::Obj(ObjHeader {
                    session_id: session.session_id,
                    exit_code: result.exit_code,
                    stdout: result.stdout.clone(),
                    stderr: result.stderr.clone(),
                    duration_ms: result.duration_ms,
                    file_size: 0,
                    payload_len: 0,
                }),
            )
            .map_err(ConnError::from)
        } else {
            send_obj_file(writer, &session, &result, &mut chunk_buf).map(|size| {
                Stats::inc(&worker.stats.files_sent);
                Stats::add(&worker.stats.bytes_sent, size as i64);
            })
        };

        if let Err(e) = sent {
            error!(
                session_id = session.session_id,
                client_id = %client.client_id,
                error = %e,
                "can't stream the compiled object"
            );
            // best effort: tell the client which invocation is dead, then
            // let it recreate the stream
            let err = WireError::for_session(
                ErrorCode::Internal,
                format!("can't send obj: {e}"),
                session.session_id,
            );
            let _ = framing::write_message(writer, &RecvFrame::Err(err));
            client.close_session(&session);
            return Ok(());
        }

        debug!(session_id = session.session_id, "session closed");
        client.close_session(&session);
    }
    Ok(())
}

fn send_obj_file(
    writer: &mut BufWriter<TcpStream>,
    session: &Session,
    result: &crate::session::CompileResult,
    chunk_buf: &mut [u8],
) -> Result<u64, ConnError> {
    let mut file = fs::File::open(&session.obj_out_path)?;
    let file_size = file.metadata()?.len();

    let first_len = file.read(chunk_buf)?;
    framing::write_message(
        writer,
        &RecvFrame::Obj(ObjHeader {
            session_id: session.session_id,
            exit_code: result.exit_code,
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            duration_ms: result.duration_ms,
            file_size,
            payload_len: first_len as u64,
        }),
    )?;
    writer.write_all(&chunk_buf[..first_len])?;

    let mut sent = first_len as u64;
    while sent < file_size {
        let n = file.read(chunk_buf)?;
        if n == 0 {
            return Err(ConnError::Protocol("object file shrank while streaming".into()));
        }
        framing::write_message(
            writer,
            &RecvFrame::More(ObjChunk {
                session_id: session.session_id,
                payload_len: n as u64,
            }),
        )?;
        writer.write_all(&chunk_buf[..n])?;
        sent += n as u64;
    }
    writer.flush()?;
    Ok(file_size)
}

// ------------------------------------------------------------- management

fn build_status(worker: &Arc<Worker>) -> StatusReply {
    let version_line = |raw: &[u8]| {
        String::from_utf8_lossy(raw)
            .lines()
            .find(|l| l.contains(" version "))
            .unwrap_or("not found")
            .trim()
            .to_string()
    };
    let combined = |name: &str, args: &[&str]| {
        Command::new(name)
            .args(args)
            .output()
            .map(|o| {
                let mut all = o.stdout;
                all.extend_from_slice(&o.stderr);
                all
            })
            .unwrap_or_default()
    };

    StatusReply {
        version: VERSION.to_string(),
        args: worker.args.clone(),
        uptime_sec: worker.start_time.elapsed().as_secs(),
        gcc_version: version_line(&combined("g++", &["-v"])),
        clang_version: version_line(&combined("clang", &["-v"])),
        uname: String::from_utf8_lossy(&combined("uname", &["-rv"])).trim().to_string(),
        ulimit_nofile: nofile_limit(),
        log_file_size: worker.log.file_size(),
        src_cache_bytes: worker.src_cache.0.bytes_on_disk(),
        src_cache_files: worker.src_cache.0.files_count(),
        obj_cache_bytes: worker.obj_cache.cache.bytes_on_disk(),
        obj_cache_files: worker.obj_cache.cache.files_count(),
        sessions_total: worker.stats.sessions_count.load(std::sync::atomic::Ordering::Relaxed),
        sessions_active: worker.clients.active_sessions_count(),
        cxx_calls: worker.cxx.total_calls(),
        cxx_more_10s: worker.cxx.more_10s_count(),
        cxx_more_30s: worker.cxx.more_30s_count(),
        unique_remotes: worker.clients.unique_remotes_info(),
    }
}

fn nofile_limit() -> i64 {
    let mut limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } == 0 {
        limit.rlim_cur as i64
    } else {
        -1
    }
}

/// Stream the current log file (and a rotated `.1.gz` sibling if present)
/// back over the control stream; an empty `ext` chunk terminates.
fn dump_logs(
    worker: &Arc<Worker>,
    writer: &mut BufWriter<TcpStream>,
) -> Result<(), ConnError> {
    info!("requested to dump logs");
    if let Some(path) = worker.log.file_path() {
        send_log_file(writer, &path, ".log")?;
        let rotated = PathBuf::from(format!("{}.1.gz", path.display()));
        if rotated.exists() {
            send_log_file(writer, &rotated, ".log.1.gz")?;
        }
    }
    framing::write_message(writer, &LogChunk { ext: String::new(), payload_len: 0 })?;
    Ok(())
}

fn send_log_file(
    writer: &mut BufWriter<TcpStream>,
    path: &std::path::Path,
    ext: &str,
) -> Result<(), ConnError> {
    let mut file = match fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return Ok(()),
    };
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        framing::write_message(
            writer,
            &LogChunk { ext: ext.to_string(), payload_len: n as u64 },
        )?;
        writer.write_all(&buf[..n])?;
    }
}
