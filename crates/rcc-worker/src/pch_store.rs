//! Compiled precompiled headers, one per fingerprint.
//!
//! When a `.rcc-pch` container is uploaded, its embedded sources are
//! extracted under a per-fingerprint root and the real `.gch`/`.pch` is
//! compiled there, once; every dependent session afterwards gets the real
//! header pair by hard link only. Unlike the file caches there is no LRU
//! here — a build rarely has more than a handful of precompiled headers.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rcc_protocol::digest::Digest256;
use rcc_protocol::pch::{map_under_root, OwnPch, PchError};
use thiserror::Error;
use tracing::{error, info};

use crate::cxx::CxxLauncher;

#[derive(Debug, Error)]
pub enum PchStoreError {
    #[error(transparent)]
    Format(#[from] PchError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    CompilerFailed(String),

    #[error("no compiled pch registered for fingerprint {0}")]
    NotCompiled(String),
}

struct CompiledPch {
    /// The re-created plain header inside the fingerprint root.
    real_header: PathBuf,
    /// The compiled `.gch`/`.pch` next to it.
    real_pch: PathBuf,
    orig_header: String,
    orig_pch: String,
}

pub struct PchStore {
    pch_root: PathBuf,
    compiled: Mutex<HashMap<Digest256, CompiledPch>>,
}

impl PchStore {
    pub fn new(pch_root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let pch_root = pch_root.into();
        fs::create_dir_all(&pch_root)?;
        Ok(Self { pch_root, compiled: Mutex::new(HashMap::new()) })
    }

    fn fingerprint_root(&self, pch: &OwnPch) -> PathBuf {
        let base = pch.orig_header.rsplit('/').next().unwrap_or(&pch.orig_header);
        self.pch_root.join(format!("{}-{}", base, pch.fingerprint.to_short_hex()))
    }

    /// Handle a freshly uploaded container at `own_pch_path`: make sure a
    /// real pch exists for its fingerprint (compiling it if this is the
    /// first time), then hard-link the real header pair next to the
    /// container so a plain `#include` of the original header resolves.
    pub fn compile_uploaded(
        &self,
        launcher: &CxxLauncher,
        own_pch_path: &Path,
    ) -> Result<(), PchStoreError> {
        let mut pch = OwnPch::parse(own_pch_path)?;
        let root = self.fingerprint_root(&pch);

        // an existing root means another session got here first: wait for
        // its registration instead of compiling twice
        if root.exists() {
            info!(fingerprint = %pch.fingerprint.to_long_hex(), "pch is being compiled elsewhere, waiting");
            if self.wait_until_compiled(&pch.fingerprint) {
                return self.link_real_pch(own_pch_path, &pch.fingerprint);
            }
            error!(root = %root.display(), "waited too long for a concurrent pch compile, redoing");
            let _ = fs::remove_dir_all(&root);
        }

        pch.extract_deps_into(&root)?;

        info!(
            fingerprint = %pch.fingerprint.to_long_hex(),
            header = %pch.orig_header,
            "compiling a precompiled header"
        );
        let cmd_line = rewrite_pch_cmd_line(&pch, &root);
        launcher
            .compile_pch(&pch.compiler_name, &cmd_line, &root)
            .map_err(PchStoreError::CompilerFailed)?;

        let item = CompiledPch {
            real_header: map_under_root(&root, &pch.orig_header),
            real_pch: map_under_root(&root, &pch.orig_pch),
            orig_header: pch.orig_header.clone(),
            orig_pch: pch.orig_pch.clone(),
        };
        self.compiled.lock().unwrap().insert(pch.fingerprint, item);

        self.link_real_pch(own_pch_path, &pch.fingerprint)
    }

    /// Hard-link the real `.h` + `.gch`/`.pch` beside an already-present
    /// container (e.g. one restored from the source cache).
    pub fn link_real_pch(
        &self,
        own_pch_path: &Path,
        fingerprint: &Digest256,
    ) -> Result<(), PchStoreError> {
        let compiled = self.compiled.lock().unwrap();
        let Some(item) = compiled.get(fingerprint) else {
            return Err(PchStoreError::NotCompiled(fingerprint.to_long_hex()));
        };

        let dir = own_pch_path.parent().unwrap_or_else(|| Path::new("/"));
        let header_dest = dir.join(base_name(&item.orig_header));
        let pch_dest = dir.join(base_name(&item.orig_pch));
        link_ignoring_existing(&item.real_header, &header_dest)?;
        link_ignoring_existing(&item.real_pch, &pch_dest)?;
        Ok(())
    }

    pub fn is_compiled(&self, fingerprint: &Digest256) -> bool {
        self.compiled.lock().unwrap().contains_key(fingerprint)
    }

    /// Poll for a concurrent compile of the same fingerprint, for up to
    /// 10 seconds.
    fn wait_until_compiled(&self, fingerprint: &Digest256) -> bool {
        let started = Instant::now();
        while started.elapsed() < Duration::from_secs(10) {
            std::thread::sleep(Duration::from_millis(20));
            if self.is_compiled(fingerprint) {
                return true;
            }
        }
        false
    }
}

/// Include dirs and `-include` values inside the container are
/// client-absolute; remap them under the fingerprint root, then append the
/// output (`.gch`/`.pch`) and the input header, both under the root too.
fn rewrite_pch_cmd_line(pch: &OwnPch, root: &Path) -> Vec<String> {
    let mut cmd =
        Vec::with_capacity(pch.include_dir_args.len() + pch.compiler_args.len() + 3);
    let mut it = pch.include_dir_args.iter();
    while let Some(flag) = it.next() {
        let Some(value) = it.next() else { break };
        cmd.push(flag.clone());
        cmd.push(map_under_root(root, value).to_string_lossy().into_owned());
    }
    cmd.extend(pch.compiler_args.iter().cloned());
    cmd.push("-o".to_string());
    cmd.push(map_under_root(root, &pch.orig_pch).to_string_lossy().into_owned());
    cmd.push(map_under_root(root, &pch.orig_header).to_string_lossy().into_owned());
    cmd
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn link_ignoring_existing(src: &Path, dest: &Path) -> std::io::Result<()> {
    match fs::hard_link(src, dest) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}
