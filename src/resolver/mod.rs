//! Dependency resolver: every header a translation unit needs, without
//! running a preprocessor.
//!
//! Two engines share one contract — given an input file, the include-dir
//! configuration and the per-compiler cache, produce the input's size and
//! digest plus an ordered, deduplicated dependency list:
//!
//! - the lexical engine here walks `#include` directives itself (fast
//!   path, the default);
//! - [`compiler::collect_deps_by_preprocessor`] delegates to `cxx -M`
//!   (slow path, for macro-based includes the lexer cannot see).
//!
//! The lexical engine may return a superset of the preprocessor's list
//! (unreachable `#if` branches); returning less than the preprocessor
//! would be a correctness bug, returning more only costs an upload.

pub mod cache;
pub mod compiler;
pub mod lexer;

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use rcc_protocol::digest::Digest256;
use rcc_protocol::pch::{OwnPch, PCH_SUFFIX};
use thiserror::Error;
use tracing::warn;

use crate::include_dirs::IncludeDirs;
use self::cache::{CachedFileInfo, CachedResolve, IncludesCache};
use self::lexer::{scan_include_directives, IncludeArg};

/// One resolved dependency: an absolute path with its size and digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepRecord {
    pub path: String,
    pub size: u64,
    pub digest: Digest256,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("can't read {path}: {source}")]
    Io { path: String, source: io::Error },

    #[error("preprocessor failed: {0}")]
    Preprocessor(String),
}

/// Collect the input file's record and its full include closure with the
/// lexical engine. `include_dirs` must already contain the compiler's
/// default search dirs (merged after the command-line ones).
/// `search_pch` enables `.rcc-pch` substitution, which applies when
/// compiling a source file (not when generating a pch from a header).
pub fn collect_dependencies(
    includes_cache: &IncludesCache,
    input_abs: &str,
    include_dirs: &IncludeDirs,
    search_pch: bool,
) -> Result<(DepRecord, Vec<DepRecord>), ResolveError> {
    let mut resolver = Resolver {
        dirs: include_dirs,
        cache: includes_cache,
        seen: HashMap::new(),
        deps: Vec::new(),
    };

    // g++ injects <stdc-predef.h> into every unit on glibc systems
    resolver.on_include(input_abs, &IncludeArg::angle("stdc-predef.h"), false)?;

    // `-include {file}` behaves like an include before the first line;
    // clang also names precompiled headers this way, hence the pch probe
    for file in &include_dirs.files_i {
        resolver.on_include(input_abs, &IncludeArg::angle(file.clone()), search_pch)?;
    }

    let content = fs::read(input_abs)
        .map_err(|source| ResolveError::Io { path: input_abs.to_string(), source })?;
    let input_record = DepRecord {
        path: input_abs.to_string(),
        size: content.len() as u64,
        digest: Digest256::of_bytes_with_crc64_header(&content),
    };

    // a precompiled header can only replace the first include of the unit
    for (idx, directive) in scan_include_directives(&content).iter().enumerate() {
        resolver.on_include(input_abs, directive, idx == 0 && search_pch)?;
    }

    Ok((input_record, resolver.deps))
}

struct Resolver<'a> {
    dirs: &'a IncludeDirs,
    cache: &'a IncludesCache,
    /// Every absolute path probed so far → whether it exists (and is
    /// therefore already in `deps`).
    seen: HashMap<String, bool>,
    deps: Vec<DepRecord>,
}

impl Resolver<'_> {
    /// Resolve one directive and recurse into the file it names.
    /// Returns the resolved absolute path, or `None` if nothing matched.
    fn on_include(
        &mut self,
        current_file: &str,
        arg: &IncludeArg,
        try_pch: bool,
    ) -> Result<Option<String>, ResolveError> {
        let is_angle = !arg.quoted && !arg.include_next;

        if is_angle {
            if let Some(cached) = self.cache.get_resolve(&arg.name) {
                return match cached {
                    CachedResolve::Found(path) => {
                        if self.try_candidate(&path, try_pch)? {
                            Ok(Some(path))
                        } else {
                            Ok(None)
                        }
                    }
                    CachedResolve::NotFound => Ok(None),
                };
            }
        } else if arg.name.starts_with('/') {
            // an absolute argument leaves no directories to traverse
            return if self.try_candidate(&arg.name, try_pch)? {
                Ok(Some(arg.name.clone()))
            } else {
                Ok(None)
            };
        }

        // search order: (current dir, -iquote) for the quoted form only,
        // then -I, then -isystem + compiler defaults
        let mut search_dirs: Vec<String> = Vec::new();
        if arg.quoted {
            search_dirs.push(dir_of(current_file).to_string());
            search_dirs.extend(self.dirs.dirs_iquote.iter().cloned());
        }
        search_dirs.extend(self.dirs.dirs_i.iter().cloned());
        search_dirs.extend(self.dirs.dirs_isystem.iter().cloned());

        // #include_next resumes the search after the directory holding
        // the current file
        let mut skipping = arg.include_next;

        for dir in &search_dirs {
            let candidate = join_path(dir, &arg.name);
            if skipping {
                let dir_prefix = &candidate[..candidate.len() - arg.name.len()];
                if current_file.starts_with(dir_prefix) {
                    skipping = false;
                }
                continue;
            }
            if self.try_candidate(&candidate, try_pch)? {
                if is_angle && self.should_cache(&candidate) {
                    self.cache.add_resolve(&arg.name, CachedResolve::Found(candidate.clone()));
                }
                return Ok(Some(candidate));
            }
        }

        if is_angle {
            // negative results are worth remembering too: a missing
            // <header> would otherwise be re-probed by every unit
            self.cache.add_resolve(&arg.name, CachedResolve::NotFound);
        }
        Ok(None)
    }

    /// Probe one absolute path; on first sight, read it, record it as a
    /// dependency and recurse into its own includes.
    fn try_candidate(&mut self, path: &str, try_pch: bool) -> Result<bool, ResolveError> {
        if let Some(&exists) = self.seen.get(path) {
            return Ok(exists);
        }

        if try_pch {
            if let Some(pch_dep) = locate_own_pch(path, self.cache) {
                // the container replaces the header: the header itself and
                // its transitive deps must not be uploaded
                self.seen.insert(path.to_string(), true);
                self.seen.insert(pch_dep.path.clone(), true);
                self.deps.push(pch_dep);
                return Ok(true);
            }
        }

        let should_cache = self.should_cache(path);
        if should_cache {
            if let Some(info) = self.cache.get_file_info(path) {
                if info.size < 0 {
                    self.seen.insert(path.to_string(), false);
                    return Ok(false);
                }
                self.seen.insert(path.to_string(), true);
                self.deps.push(DepRecord {
                    path: path.to_string(),
                    size: info.size as u64,
                    digest: info.digest,
                });
                for nested in &info.nested {
                    self.on_include(path, &IncludeArg::angle(nested.clone()), false)?;
                }
                return Ok(true);
            }
        }

        let content = match fs::read(path) {
            Ok(content) => content,
            Err(e) if probe_miss(&e) => {
                self.seen.insert(path.to_string(), false);
                return Ok(false);
            }
            Err(source) => return Err(ResolveError::Io { path: path.to_string(), source }),
        };

        let digest = Digest256::of_bytes_with_crc64_header(&content);
        self.seen.insert(path.to_string(), true);
        self.deps.push(DepRecord { path: path.to_string(), size: content.len() as u64, digest });

        let directives = scan_include_directives(&content);
        if should_cache {
            let mut nested = Vec::with_capacity(directives.len());
            for directive in &directives {
                if let Some(resolved) = self.on_include(path, directive, false)? {
                    nested.push(resolved);
                }
            }
            self.cache.add_file_info(
                path,
                CachedFileInfo { size: content.len() as i64, digest, nested },
            );
        } else {
            for directive in &directives {
                self.on_include(path, directive, false)?;
            }
        }
        Ok(true)
    }

    /// A file record may live in the daemon-wide cache only if its
    /// resolution cannot change between invocations: under a system dir
    /// and not shadowable by a `-I` dir (those differ per target and
    /// would leave stale nested lists behind).
    fn should_cache(&self, path: &str) -> bool {
        if self.dirs.dirs_i.iter().any(|dir| path.starts_with(dir.as_str())) {
            return false;
        }
        self.dirs.dirs_isystem.iter().any(|dir| path.starts_with(dir.as_str()))
    }
}

fn probe_miss(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::IsADirectory)
        || e.raw_os_error() == Some(libc::EISDIR)
}

/// Probe for a `.rcc-pch` sibling of a header. Results (both ways) are
/// memoized in the includes cache for the daemon's life.
pub fn locate_own_pch(header_path: &str, cache: &IncludesCache) -> Option<DepRecord> {
    let pch_path = format!("{header_path}{PCH_SUFFIX}");
    if let Some(info) = cache.get_file_info(&pch_path) {
        if info.size < 0 {
            return None;
        }
        return Some(DepRecord { path: pch_path, size: info.size as u64, digest: info.digest });
    }

    let negative = CachedFileInfo { size: -1, digest: Digest256::default(), nested: vec![] };
    let Ok(meta) = fs::metadata(&pch_path) else {
        cache.add_file_info(&pch_path, negative);
        return None;
    };
    match OwnPch::parse(Path::new(&pch_path)) {
        Ok(own) => {
            // the container's identity is its fingerprint, not a content
            // hash: equal build agents produce equal uploads
            cache.add_file_info(
                &pch_path,
                CachedFileInfo {
                    size: meta.len() as i64,
                    digest: own.fingerprint,
                    nested: vec![],
                },
            );
            Some(DepRecord { path: pch_path, size: meta.len(), digest: own.fingerprint })
        }
        Err(e) => {
            warn!(path = %pch_path, error = %e, "ignoring an unreadable pch container");
            cache.add_file_info(&pch_path, negative);
            None
        }
    }
}

fn dir_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(pos) => &path[..pos],
        None => ".",
    }
}

fn join_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}
