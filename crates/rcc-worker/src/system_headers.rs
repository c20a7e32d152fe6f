//! Registry of the worker's own system headers.
//!
//! A client dependency under `/usr/` or `/Library/` whose size and digest
//! match the file already present at that absolute path on the worker is
//! never mirrored or uploaded: the compiler reads the worker's copy.
//! Purely an optimization — with an empty registry everything still works,
//! the files just travel over the wire.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use rcc_protocol::digest::Digest256;

/// Is this a path where system headers are expected to live?
pub fn is_system_header_path(path: &str) -> bool {
    path.starts_with("/usr/") || path.starts_with("/Library/")
}

/// Memoized size+digest of worker-local system files. Negative results
/// (no such file, unreadable) are cached as `None`.
pub struct SystemHeaders {
    known: RwLock<HashMap<PathBuf, Option<(u64, Digest256)>>>,
}

impl SystemHeaders {
    pub fn new() -> Self {
        Self { known: RwLock::new(HashMap::new()) }
    }

    /// Whether `path` is a system header on this worker with exactly the
    /// given size and digest.
    pub fn matches(&self, path: &str, size: u64, digest: &Digest256) -> bool {
        if !is_system_header_path(path) {
            return false;
        }
        let path = Path::new(path);
        if let Some(known) = self.known.read().unwrap().get(path) {
            return matches!(known, Some((s, d)) if *s == size && d == digest);
        }

        let probed = Self::probe(path);
        let result = matches!(&probed, Some((s, d)) if *s == size && d == digest);
        self.known.write().unwrap().insert(path.to_path_buf(), probed);
        result
    }

    fn probe(path: &Path) -> Option<(u64, Digest256)> {
        let meta = std::fs::metadata(path).ok()?;
        let digest = Digest256::of_file(path).ok()?;
        Some((meta.len(), digest))
    }

    pub fn count(&self) -> usize {
        self.known.read().unwrap().len()
    }
}

impl Default for SystemHeaders {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_system_paths_never_match() {
        let headers = SystemHeaders::new();
        let d = Digest256::of_bytes(b"x");
        assert!(!headers.matches("/home/alice/a.h", 1, &d));
        assert!(!headers.matches("relative/a.h", 1, &d));
        assert_eq!(headers.count(), 0);
    }

    #[test]
    fn missing_files_are_cached_negatively() {
        let headers = SystemHeaders::new();
        let d = Digest256::of_bytes(b"x");
        assert!(!headers.matches("/usr/include/definitely-not-a-real-header-xyz.h", 1, &d));
        assert_eq!(headers.count(), 1);
        // second query answers from the cache
        assert!(!headers.matches("/usr/include/definitely-not-a-real-header-xyz.h", 1, &d));
        assert_eq!(headers.count(), 1);
    }

    #[test]
    fn matching_requires_both_size_and_digest() {
        // /usr/include/errno.h exists on any build machine; skip otherwise
        let path = "/usr/include/errno.h";
        let Ok(meta) = std::fs::metadata(path) else { return };
        let digest = Digest256::of_file(Path::new(path)).unwrap();

        let headers = SystemHeaders::new();
        assert!(headers.matches(path, meta.len(), &digest));
        assert!(!headers.matches(path, meta.len() + 1, &digest));
        assert!(!headers.matches(path, meta.len(), &Digest256::of_bytes(b"other")));
    }
}
