//! rcc worker — the remote side of the distributed C/C++ compilation
//! cache.
//!
//! A long-running service that mirrors client file trees into per-client
//! working directories, deduplicates uploads through a content-addressed
//! source cache, schedules bounded-parallelism compiler runs, reuses
//! whole compilation results through an object cache, and streams objects
//! back over long-lived connections.

pub mod clients;
pub mod cron;
pub mod cxx;
pub mod file_cache;
pub mod logging;
pub mod pch_store;
pub mod server;
pub mod session;
pub mod stats;
pub mod system_headers;

pub use clients::{Client, ClientsRegistry, FileEntry, SessionError, UploadState};
pub use cxx::{CxxLauncher, Semaphore};
pub use file_cache::{make_obj_cache_key, CacheError, FileCache, ObjCache, SrcCache};
pub use pch_store::{PchStore, PchStoreError};
pub use server::Worker;
pub use session::{CompileResult, Session};
pub use stats::Stats;
pub use system_headers::{is_system_header_path, SystemHeaders};
