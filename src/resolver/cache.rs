//! The per-compiler include cache, kept in memory for the daemon's life.
//!
//! Two maps: how `<name>` tokens resolve to absolute paths (negative
//! results included), and per-file records (size, digest, nested include
//! list) for files whose location cannot change between invocations.
//! Together they turn the resolver's disk walks into hash lookups for the
//! hot 99% — system headers included by every translation unit.

use std::collections::HashMap;
use std::sync::RwLock;

use rcc_protocol::digest::Digest256;
use tracing::warn;

use crate::include_dirs::IncludeDirs;
use crate::resolver::compiler;

/// A memoized `<name>` resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedResolve {
    Found(String),
    NotFound,
}

/// A memoized file record. `size == -1` marks a file known to not exist
/// (used for `.rcc-pch` sibling probes).
#[derive(Debug, Clone)]
pub struct CachedFileInfo {
    pub size: i64,
    pub digest: Digest256,
    /// Resolved absolute paths of this file's own includes, in order.
    pub nested: Vec<String>,
}

pub struct IncludesCache {
    pub compiler_name: String,
    /// The compiler's built-in search dirs, discovered once per compiler.
    pub default_dirs: IncludeDirs,
    resolves: RwLock<HashMap<String, CachedResolve>>,
    files: RwLock<HashMap<String, CachedFileInfo>>,
}

impl IncludesCache {
    /// Discover the compiler's default include dirs and start empty.
    /// Discovery failure (no such compiler on this machine) degrades to
    /// empty defaults: resolution still works for project-local includes.
    pub fn discover(compiler_name: &str, stdlib_args: &[String]) -> Self {
        let default_dirs = match compiler::default_include_dirs(compiler_name, stdlib_args) {
            Ok(dirs) => dirs,
            Err(e) => {
                warn!(compiler = compiler_name, error = %e, "can't discover default include dirs");
                IncludeDirs::default()
            }
        };
        Self::with_default_dirs(compiler_name, default_dirs)
    }

    pub fn with_default_dirs(compiler_name: &str, default_dirs: IncludeDirs) -> Self {
        Self {
            compiler_name: compiler_name.to_string(),
            default_dirs,
            resolves: RwLock::new(HashMap::new()),
            files: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_resolve(&self, token: &str) -> Option<CachedResolve> {
        if token.starts_with('/') {
            return Some(CachedResolve::Found(token.to_string()));
        }
        self.resolves.read().unwrap().get(token).cloned()
    }

    pub fn add_resolve(&self, token: &str, resolve: CachedResolve) {
        self.resolves.write().unwrap().insert(token.to_string(), resolve);
    }

    pub fn get_file_info(&self, path: &str) -> Option<CachedFileInfo> {
        self.files.read().unwrap().get(path).cloned()
    }

    pub fn add_file_info(&self, path: &str, info: CachedFileInfo) {
        self.files.write().unwrap().insert(path.to_string(), info);
    }

    pub fn files_count(&self) -> usize {
        self.files.read().unwrap().len()
    }

    /// Forget everything. Done when a pch is (re)generated: records may
    /// now point at a stale sibling set.
    pub fn clear(&self) {
        self.resolves.write().unwrap().clear();
        self.files.write().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_tokens_resolve_to_themselves() {
        let cache = IncludesCache::with_default_dirs("g++", IncludeDirs::default());
        assert_eq!(
            cache.get_resolve("/abs/path.h"),
            Some(CachedResolve::Found("/abs/path.h".into()))
        );
        assert_eq!(cache.get_resolve("vector"), None);
    }

    #[test]
    fn negative_resolves_are_remembered() {
        let cache = IncludesCache::with_default_dirs("g++", IncludeDirs::default());
        cache.add_resolve("nope.h", CachedResolve::NotFound);
        assert_eq!(cache.get_resolve("nope.h"), Some(CachedResolve::NotFound));

        cache.add_resolve("vector", CachedResolve::Found("/usr/include/c++/vector".into()));
        assert_eq!(
            cache.get_resolve("vector"),
            Some(CachedResolve::Found("/usr/include/c++/vector".into()))
        );

        cache.clear();
        assert_eq!(cache.get_resolve("vector"), None);
    }

    #[test]
    fn file_info_round_trip() {
        let cache = IncludesCache::with_default_dirs("g++", IncludeDirs::default());
        cache.add_file_info(
            "/usr/include/x.h",
            CachedFileInfo {
                size: 10,
                digest: Digest256::of_bytes(b"x"),
                nested: vec!["/usr/include/y.h".into()],
            },
        );
        let info = cache.get_file_info("/usr/include/x.h").unwrap();
        assert_eq!(info.size, 10);
        assert_eq!(info.nested, vec!["/usr/include/y.h"]);
        assert_eq!(cache.files_count(), 1);
    }
}
