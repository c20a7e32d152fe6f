//! Wire surface shared by the rcc client daemon and the rcc worker.
//!
//! This crate carries everything both sides must agree on:
//! - [`digest`]: the 256-bit content digest used to identify files,
//!   objects and precompiled headers;
//! - [`framing`]: the binary-framed message codec (one JSON header line,
//!   then an optional raw payload);
//! - [`messages`]: typed request/response payloads for every RPC method;
//! - [`pch`]: the portable precompiled-header container format.

pub mod digest;
pub mod framing;
pub mod messages;
pub mod pch;

pub use digest::{fnv1a_32, Digest256};
pub use framing::{read_message, read_payload, write_message, FrameError, CHUNK_SIZE};
pub use messages::{
    ControlRequest, DropCachesReply, ErrorCode, FileMeta, LogChunk, ObjChunk, ObjHeader,
    RecvFrame, Reply, SessionStarted, StartClientRequest, StartSessionRequest, StatusReply,
    StreamHello, StreamKind, UploadAck, UploadChunk, WireError,
};
pub use pch::{OwnPch, PchDep, PchError, PCH_SUFFIX};

/// Version string reported by both binaries and in `start-client`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
