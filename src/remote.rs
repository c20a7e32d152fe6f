//! One worker, as seen from the daemon.
//!
//! A [`RemoteConnection`] bundles the three long-lived streams to one
//! worker — control (request/response), upload and receive — plus the
//! "unavailable" latch: a worker that cannot be reached, or answers
//! `UNAUTHENTICATED`, stays written off until the daemon dies, and every
//! invocation pinned to it compiles locally instead.

use std::io::{BufReader, BufWriter};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rcc_protocol::framing::{self, FrameError};
use rcc_protocol::messages::{
    ControlRequest, DropCachesReply, FileMeta, Reply, SessionStarted,
    StartClientRequest, StartSessionRequest, StatusReply, StreamHello, StreamKind, WireError,
};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{error, info};

use crate::invocation::{ActiveInvocations, Invocation, InvocationResult};
use crate::receive;
use crate::resolver::cache::IncludesCache;
use crate::resolver::{collect_dependencies, compiler, ResolveError};
use crate::upload::{self, UploadRequest};

/// How long connecting to a worker may take before it is written off.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Remote(#[from] WireError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("worker {0} is unavailable")]
    Unavailable(String),

    #[error("{0}")]
    Stream(String),
}

/// State shared with the stream threads.
pub struct RemoteShared {
    pub host_port: String,
    /// Just the host, prettier in logs.
    pub host: String,
    pub client_id: String,
    unavailable: AtomicBool,
}

impl RemoteShared {
    pub fn is_unavailable(&self) -> bool {
        self.unavailable.load(Ordering::SeqCst)
    }

    pub fn mark_unavailable(&self, reason: &str) {
        if !self.unavailable.swap(true, Ordering::SeqCst) {
            error!(remote = %self.host_port, reason, "worker became unavailable");
        }
    }
}

pub fn host_without_port(host_port: &str) -> &str {
    host_port.split(':').next().unwrap_or(host_port)
}

/// Open one TCP stream to a worker and send its hello frame.
pub fn open_stream(
    host_port: &str,
    kind: StreamKind,
    client_id: &str,
) -> Result<(BufReader<TcpStream>, BufWriter<TcpStream>), TransportError> {
    let addr = host_port
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| TransportError::Stream(format!("can't resolve {host_port}")))?;
    let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
    stream.set_nodelay(true)?;
    let reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);
    framing::write_message(
        &mut writer,
        &StreamHello { kind, client_id: client_id.to_string() },
    )?;
    Ok((reader, writer))
}

struct ControlStream {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

/// Identity the daemon presents on connect.
#[derive(Clone)]
pub struct ConnectInfo {
    pub client_id: String,
    pub host_user: String,
    pub disable_obj_cache: bool,
    pub all_remotes: String,
}

pub struct RemoteConnection {
    pub shared: Arc<RemoteShared>,
    control: Mutex<ControlStream>,
    upload_tx: SyncSender<UploadRequest>,
}

impl RemoteConnection {
    /// Connect all three streams and announce the client. Any failure
    /// here leaves the worker unavailable for the daemon's lifetime.
    pub fn connect(
        host_port: &str,
        info: &ConnectInfo,
        active: Arc<ActiveInvocations>,
    ) -> Result<RemoteConnection, TransportError> {
        let shared = Arc::new(RemoteShared {
            host_port: host_port.to_string(),
            host: host_without_port(host_port).to_string(),
            client_id: info.client_id.clone(),
            unavailable: AtomicBool::new(false),
        });

        let (reader, writer) = open_stream(host_port, StreamKind::Control, &info.client_id)?;
        let mut control = ControlStream { reader, writer };
        let _: () = rpc_on(
            &mut control,
            &ControlRequest::StartClient(StartClientRequest {
                client_id: info.client_id.clone(),
                host_user: info.host_user.clone(),
                client_version: rcc_protocol::VERSION.to_string(),
                disable_obj_cache: info.disable_obj_cache,
                all_remotes: info.all_remotes.clone(),
            }),
        )?;

        let upload_stream = open_stream(host_port, StreamKind::Upload, &info.client_id)?;
        let (upload_tx, upload_rx) = sync_channel::<UploadRequest>(50);
        {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("upload-{}", shared.host))
                .spawn(move || upload::run_uploader(shared, upload_rx, Some(upload_stream)))
                .map_err(|e| TransportError::Stream(format!("can't spawn uploader: {e}")))?;
        }

        let recv_stream = open_stream(host_port, StreamKind::Receive, &info.client_id)?;
        {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("recv-{}", shared.host))
                .spawn(move || receive::run_receiver(shared, active, Some(recv_stream)))
                .map_err(|e| TransportError::Stream(format!("can't spawn receiver: {e}")))?;
        }

        Ok(RemoteConnection { shared, control: Mutex::new(control), upload_tx })
    }

    fn rpc<R: DeserializeOwned + Default>(&self, request: &ControlRequest) -> Result<R, TransportError> {
        let mut control = self.control.lock().unwrap();
        rpc_on(&mut control, request)
    }

    /// Announce a session: ship the metadata of every required file, get
    /// back the indices the worker wants uploaded.
    pub fn start_session(
        &self,
        invocation: &Invocation,
        args: Vec<String>,
        include_dir_args: Vec<String>,
        required_files: Vec<FileMeta>,
    ) -> Result<Vec<u32>, TransportError> {
        if self.shared.is_unavailable() {
            return Err(TransportError::Unavailable(self.shared.host.clone()));
        }
        let started: SessionStarted =
            self.rpc(&ControlRequest::StartSession(StartSessionRequest {
                client_id: self.shared.client_id.clone(),
                session_id: invocation.session_id,
                cwd: invocation.cwd.to_string_lossy().into_owned(),
                input_path: invocation.parsed.input_path.clone(),
                compiler_name: invocation.parsed.compiler_name.clone(),
                args,
                include_dir_args,
                required_files,
            }))?;
        Ok(started.upload_indices)
    }

    pub fn queue_upload(&self, request: UploadRequest) {
        if let Err(failed) = self.upload_tx.send(request) {
            // uploader thread is gone; fail the invocation rather than
            // leaving its upload latch waiting
            self.shared.mark_unavailable("upload queue closed");
            failed.0.invocation.upload_done(Some("upload queue closed".to_string()));
        }
    }

    pub fn send_stop_client(&self) {
        if self.shared.is_unavailable() {
            return;
        }
        let _: Result<(), _> = self.rpc(&ControlRequest::StopClient {
            client_id: self.shared.client_id.clone(),
        });
    }

    pub fn query_status(&self) -> Result<StatusReply, TransportError> {
        self.rpc(&ControlRequest::Status)
    }

    pub fn drop_all_caches(&self) -> Result<DropCachesReply, TransportError> {
        self.rpc(&ControlRequest::DropAllCaches)
    }
}

fn rpc_on<R: DeserializeOwned + Default>(
    control: &mut ControlStream,
    request: &ControlRequest,
) -> Result<R, TransportError> {
    framing::write_message(&mut control.writer, request)?;
    let reply: Reply<R> = framing::read_message(&mut control.reader)?;
    Ok(reply.into_result()?)
}

/// The whole remote-compilation sequence for one invocation: collect
/// dependencies, start the session, upload what the worker asks for,
/// wait for the object. Any `Err` means "compile locally instead"; a
/// non-zero compiler exit comes back as `Ok`.
pub fn compile_remotely(
    remote: &RemoteConnection,
    invocation: &Arc<Invocation>,
    includes_cache: &IncludesCache,
    disable_own_includes: bool,
) -> Result<InvocationResult, TransportError> {
    let parsed = &invocation.parsed;
    let input_abs = parsed.input_abs(&invocation.cwd);

    // 1. the dependency set: everything the worker needs to mirror
    let (input_record, deps) = if disable_own_includes {
        compiler::collect_deps_by_preprocessor(
            includes_cache,
            &invocation.cwd,
            &parsed.compiler_name,
            &input_abs,
            &parsed.args,
            &parsed.include_dirs,
        )?
    } else {
        let mut merged = parsed.include_dirs.clone();
        merged.merge(&includes_cache.default_dirs);
        collect_dependencies(includes_cache, &input_abs, &merged, true)?
    };

    // 2. the depfile is a client-side artifact; write it alongside the
    // remote compile, not after it
    if parsed.dep_flags.should_generate() {
        let dep_flags = parsed.dep_flags.clone();
        let output_abs = parsed.output_abs(&invocation.cwd);
        let system_dirs = includes_cache.default_dirs.clone();
        let deps = deps.clone();
        std::thread::spawn(move || {
            match dep_flags.generate_and_save(&output_abs, &system_dirs, &deps) {
                Ok(path) => tracing::debug!(path = %path, "saved depfile"),
                Err(e) => error!(error = %e, "error generating depfile"),
            }
        });
    }

    let mut required_files: Vec<FileMeta> = deps
        .iter()
        .map(|d| FileMeta { client_path: d.path.clone(), size: d.size, digest: d.digest })
        .collect();
    required_files.push(FileMeta {
        client_path: input_record.path.clone(),
        size: input_record.size,
        digest: input_record.digest,
    });

    // 3. announce the session; the worker answers with what is missing
    let mut include_dir_args = parsed.include_dirs.as_args();
    include_dir_args.extend(includes_cache.default_dirs.as_args());
    let upload_indices = remote.start_session(
        invocation,
        parsed.args.clone(),
        include_dir_args,
        required_files.clone(),
    )?;
    info!(
        session_id = invocation.session_id,
        remote = %remote.shared.host,
        uploads = upload_indices.len(),
        of = required_files.len(),
        input = %parsed.input_path,
        "session started remotely"
    );

    // 4. feed the upload stream and wait until every file is acked
    invocation.expect_uploads(upload_indices.len());
    for index in upload_indices {
        remote.queue_upload(UploadRequest {
            invocation: Arc::clone(invocation),
            file: required_files[index as usize].clone(),
            file_index: index,
        });
    }
    invocation.wait_uploads().map_err(TransportError::Stream)?;

    // 5. the object arrives on the receive stream when the worker is done
    invocation.wait_recv().map_err(TransportError::Stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_split() {
        assert_eq!(host_without_port("10.1.2.3:43210"), "10.1.2.3");
        assert_eq!(host_without_port("worker7"), "worker7");
    }

    #[test]
    fn unavailable_latch_is_one_way() {
        let shared = RemoteShared {
            host_port: "w:1".into(),
            host: "w".into(),
            client_id: "c".into(),
            unavailable: AtomicBool::new(false),
        };
        assert!(!shared.is_unavailable());
        shared.mark_unavailable("test");
        shared.mark_unavailable("again");
        assert!(shared.is_unavailable());
    }
}
