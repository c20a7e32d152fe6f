//! Typed payloads for every RPC method.
//!
//! The worker exposes one streaming surface with four groups of methods:
//! client lifecycle (`start-client` / `stop-client`), session setup
//! (`start-session`), the two long-lived file streams (upload, receive),
//! and management (`status` / `dump-logs` / `drop-all-caches`).
//!
//! A connection announces its role with a [`StreamHello`] as its first
//! frame; everything after that depends on the declared kind.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::digest::Digest256;

/// What a freshly opened connection is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Request/response RPCs.
    Control,
    /// Client-to-worker file chunks.
    Upload,
    /// Worker-to-client compiled objects.
    Receive,
}

/// First frame on every connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamHello {
    pub kind: StreamKind,
    pub client_id: String,
}

/// Stable error codes, used by the client to decide between retrying a
/// stream and writing a worker off entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The worker does not know this client id (restart or timeout GC).
    /// Never retried: the worker stays unavailable for the daemon's life.
    Unauthenticated,
    /// The same client path was declared with two different digests.
    DependencyConflict,
    /// Malformed frame or unknown session/file index.
    InvalidRequest,
    /// Anything that went wrong on the worker itself.
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthenticated => write!(f, "UNAUTHENTICATED"),
            Self::DependencyConflict => write!(f, "DEPENDENCY_CONFLICT"),
            Self::InvalidRequest => write!(f, "INVALID_REQUEST"),
            Self::Internal => write!(f, "INTERNAL"),
        }
    }
}

/// Error details attached to a failed reply or a failing stream.
///
/// `session_id` lets the client map a stream-level failure back to the one
/// invocation it concerns, instead of failing everything in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u32>,
}

impl WireError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), session_id: None }
    }

    pub fn for_session(code: ErrorCode, message: impl Into<String>, session_id: u32) -> Self {
        Self { code, message: message.into(), session_id: Some(session_id) }
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for WireError {}

/// Reply envelope for control RPCs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl<T> Reply<T> {
    pub fn success(payload: T) -> Self {
        Self { ok: true, payload: Some(payload), error: None }
    }

    pub fn failure(error: WireError) -> Self {
        Self { ok: false, payload: None, error: Some(error) }
    }
}

impl<T: Default> Reply<T> {
    /// Unwrap into a result. A successful reply without a payload decays
    /// to the default (the unit payload of acks serializes as `null`).
    pub fn into_result(self) -> Result<T, WireError> {
        match (self.ok, self.payload, self.error) {
            (true, payload, _) => Ok(payload.unwrap_or_default()),
            (false, _, Some(error)) => Err(error),
            (false, _, None) => Err(WireError::new(ErrorCode::Internal, "empty error reply")),
        }
    }
}

/// Metadata for one required file of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMeta {
    /// Absolute path on the client file system.
    pub client_path: String,
    pub size: u64,
    pub digest: Digest256,
}

/// Control requests, dispatched by the `op` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    StartClient(StartClientRequest),
    StartSession(StartSessionRequest),
    StopClient { client_id: String },
    Status,
    DumpLogs,
    DropAllCaches,
}

/// Sent once per daemon lifetime, before any session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartClientRequest {
    pub client_id: String,
    pub host_user: String,
    pub client_version: String,
    pub disable_obj_cache: bool,
    /// The full worker list this daemon was configured with, comma-joined.
    /// Logged worker-side to spot clients with a skewed server list.
    pub all_remotes: String,
}

/// One compile request: the input, the command line split into plain args
/// and include-dir args, and metadata for every dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionRequest {
    pub client_id: String,
    pub session_id: u32,
    pub cwd: String,
    /// Input path as given on the client command line.
    pub input_path: String,
    pub compiler_name: String,
    /// Args except include dirs, output and input.
    pub args: Vec<String>,
    /// Flattened `-I dir` / `-iquote dir` / `-isystem dir` / `-include file`
    /// pairs, in client-absolute form; the worker rewrites the dir parts.
    pub include_dir_args: Vec<String>,
    pub required_files: Vec<FileMeta>,
}

/// Reply to `start-session`: indices into `required_files` that the worker
/// wants uploaded. Empty on an object-cache hit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStarted {
    pub upload_indices: Vec<u32>,
}

/// Header of one upload chunk. `file_index` points into the session's
/// `required_files`; chunks of one file arrive in order on one stream and
/// the worker keeps reading until the declared file size is reached (an
/// empty file is a single zero-length chunk).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadChunk {
    pub client_id: String,
    pub session_id: u32,
    pub file_index: u32,
    pub payload_len: u64,
}

/// Per-file acknowledgement on the upload stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadAck {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

/// First frame for one finished session on the receive stream.
///
/// A non-zero `exit_code` carries no object: compiler failure is a result,
/// not a transport error. Otherwise `file_size` bytes of object follow,
/// split into [`ObjChunk`] continuations after the first payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjHeader {
    pub session_id: u32,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u32,
    pub file_size: u64,
    pub payload_len: u64,
}

/// Continuation chunk of an object body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjChunk {
    pub session_id: u32,
    pub payload_len: u64,
}

/// Frames the worker writes on the receive stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecvFrame {
    Obj(ObjHeader),
    More(ObjChunk),
    /// Sent just before the worker abandons the stream; `session_id`
    /// inside tells the client which invocation to fail.
    Err(WireError),
}

/// One chunk of a dumped log file; an empty `ext` terminates the dump.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogChunk {
    pub ext: String,
    pub payload_len: u64,
}

/// Reply to `status`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusReply {
    pub version: String,
    pub args: Vec<String>,
    pub uptime_sec: u64,
    pub gcc_version: String,
    pub clang_version: String,
    pub uname: String,
    pub ulimit_nofile: i64,
    pub log_file_size: i64,
    pub src_cache_bytes: i64,
    pub src_cache_files: i64,
    pub obj_cache_bytes: i64,
    pub obj_cache_files: i64,
    pub sessions_total: i64,
    pub sessions_active: i64,
    pub cxx_calls: i64,
    pub cxx_more_10s: i64,
    pub cxx_more_30s: i64,
    pub unique_remotes: Vec<String>,
}

/// Reply to `drop-all-caches`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DropCachesReply {
    pub dropped_src_files: i64,
    pub dropped_obj_files: i64,
}
