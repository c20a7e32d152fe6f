//! rcc — client side of the distributed C/C++ compilation cache.
//!
//! A build driver invokes the thin `rcc` wrapper exactly as it would
//! invoke `g++`; the wrapper pipes the command line to a shared daemon
//! over a local socket. The daemon classifies the invocation, walks the
//! `#include` closure without running a preprocessor, pins the unit to a
//! worker by input basename, uploads whatever that worker is missing,
//! and writes back the object the worker returns — falling back to a
//! throttled local compile whenever the remote path cannot help.

pub mod classify;
pub mod daemon;
pub mod depfile;
pub mod include_dirs;
pub mod invocation;
pub mod local;
pub mod logging;
pub mod manage;
pub mod pch_gen;
pub mod receive;
pub mod remote;
pub mod resolver;
pub mod sync;
pub mod upload;

pub use classify::{parse_invocation, ClassifyError, InvokeKind, ParsedInvocation};
pub use daemon::{Daemon, DaemonSettings};
pub use depfile::{DepFile, DepFlags};
pub use include_dirs::IncludeDirs;
pub use invocation::{ActiveInvocations, Invocation, InvocationResult};
pub use resolver::{collect_dependencies, DepRecord, ResolveError};
