//! Content-addressed file caches with LRU eviction.
//!
//! One [`FileCache`] implementation backs both the source cache (uploaded
//! `.cpp`/`.h` files) and the object cache (compiled `.o` files). A cache
//! is a directory of 256 shard subdirectories where files are stored under
//! unique names and retrieved by digest. Restoring a cached file into a
//! working directory is always a hard link, never a copy, so an evicted
//! entry's links keep working.
//!
//! Locking: the digest table and the LRU list live under one mutex; the
//! cumulative on-disk size is an atomic so readers never take the lock.
//! Eviction picks its victim under the lock but unlinks outside it.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use rcc_protocol::digest::Digest256;
use sha2::{Digest as _, Sha256};
use thiserror::Error;
use tracing::warn;

const SHARD_COUNT: i64 = 256;

/// Errors from cache mutation. Lookups are infallible (a miss is `None`).
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

struct CachedFile {
    path_in_cache: PathBuf,
    size: u64,
    node: usize,
}

const NIL: usize = usize::MAX;

struct LruNode {
    key: Digest256,
    prev: usize,
    next: usize,
}

/// Intrusive doubly-linked LRU over a slab of nodes.
struct LruList {
    nodes: Vec<LruNode>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl LruList {
    fn new() -> Self {
        Self { nodes: Vec::new(), free: Vec::new(), head: NIL, tail: NIL }
    }

    fn push_front(&mut self, key: Digest256) -> usize {
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = LruNode { key, prev: NIL, next: self.head };
                idx
            }
            None => {
                self.nodes.push(LruNode { key, prev: NIL, next: self.head });
                self.nodes.len() - 1
            }
        };
        if self.head != NIL {
            self.nodes[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
        idx
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == idx {
            return;
        }
        self.unlink(idx);
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    /// Remove the least-recently-used node, but never the sole remaining
    /// one (the entry just stored must survive its own eviction pass).
    fn pop_back_keeping_head(&mut self) -> Option<(usize, Digest256)> {
        if self.tail == NIL || self.tail == self.head {
            return None;
        }
        let idx = self.tail;
        let key = self.nodes[idx].key;
        self.unlink(idx);
        self.free.push(idx);
        Some((idx, key))
    }

    fn remove(&mut self, idx: usize) {
        self.unlink(idx);
        self.free.push(idx);
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.nodes.len() - self.free.len()
    }
}

struct CacheInner {
    table: HashMap<Digest256, CachedFile>,
    lru: LruList,
}

/// A size-limited, content-addressed file store.
pub struct FileCache {
    inner: Mutex<CacheInner>,
    cache_dir: PathBuf,

    last_index: AtomicI64,
    purged_count: AtomicI64,
    total_bytes: AtomicI64,

    hard_limit: i64,
    soft_limit: i64,
}

impl FileCache {
    /// Create the cache directory with its 256 shard subdirectories.
    pub fn new(cache_dir: impl Into<PathBuf>, hard_limit_bytes: i64) -> Result<Self, CacheError> {
        let cache_dir = cache_dir.into();
        create_shard_dirs(&cache_dir)?;
        Ok(Self {
            inner: Mutex::new(CacheInner { table: HashMap::new(), lru: LruList::new() }),
            cache_dir,
            last_index: AtomicI64::new(0),
            purged_count: AtomicI64::new(0),
            total_bytes: AtomicI64::new(0),
            hard_limit: hard_limit_bytes,
            soft_limit: hard_limit_bytes / 10 * 8,
        })
    }

    /// Look a digest up, refreshing its LRU position on a hit.
    pub fn lookup(&self, key: &Digest256) -> Option<PathBuf> {
        let mut inner = self.inner.lock().unwrap();
        let node = inner.table.get(key)?.node;
        inner.lru.move_to_front(node);
        Some(inner.table[key].path_in_cache.clone())
    }

    /// Materialize a cached file at `dest` by hard link. The parent
    /// directory of `dest` must exist. Returns false on a cache miss.
    pub fn restore_hard_link(&self, dest: &Path, key: &Digest256) -> bool {
        let Some(path_in_cache) = self.lookup(key) else {
            return false;
        };
        match fs::hard_link(&path_in_cache, dest) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => true,
            Err(e) => {
                warn!(dest = %dest.display(), error = %e, "hard link from cache failed");
                false
            }
        }
    }

    /// Insert `src_path` under a fresh unique name. If the key raced in
    /// from another thread, the extra link is removed and the existing
    /// entry wins. Evicts down to the hard limit afterwards.
    pub fn store(
        &self,
        src_path: &Path,
        name_hint: &str,
        key: Digest256,
        size: u64,
    ) -> Result<(), CacheError> {
        let unique = self.last_index.fetch_add(1, Ordering::Relaxed) + 1;
        let path_in_cache = self
            .cache_dir
            .join(format!("{:02X}", unique % SHARD_COUNT))
            .join(format!("{}.{:X}", name_hint, unique));
        fs::hard_link(src_path, &path_in_cache)?;

        let mut inner = self.inner.lock().unwrap();
        let duplicate = inner.table.contains_key(&key);
        if !duplicate {
            let node = inner.lru.push_front(key);
            inner.table.insert(key, CachedFile { path_in_cache: path_in_cache.clone(), size, node });
            self.total_bytes.fetch_add(size as i64, Ordering::Relaxed);
        }
        drop(inner);

        if duplicate {
            let _ = fs::remove_file(&path_in_cache);
        }
        self.evict_to_limit(self.hard_limit);
        Ok(())
    }

    /// Periodic eviction down to the soft limit (80% of hard).
    pub fn evict_to_soft_limit(&self) {
        self.evict_to_limit(self.soft_limit);
    }

    fn evict_to_limit(&self, limit: i64) {
        while self.total_bytes.load(Ordering::Relaxed) > limit {
            let victim = {
                let mut inner = self.inner.lock().unwrap();
                match inner.lru.pop_back_keeping_head() {
                    Some((_, key)) => inner.table.remove(&key),
                    None => None,
                }
            };
            let Some(victim) = victim else {
                return;
            };
            // unlink happens outside the lock
            let _ = fs::remove_file(&victim.path_in_cache);
            self.total_bytes.fetch_sub(victim.size as i64, Ordering::Relaxed);
            self.purged_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Forget everything and restore the empty shard layout.
    pub fn drop_all(&self) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        let dropped = inner.table.len() as i64;
        self.purged_count.fetch_add(dropped, Ordering::Relaxed);
        self.total_bytes.store(0, Ordering::Relaxed);
        inner.table.clear();
        inner.lru.clear();
        let _ = fs::remove_dir_all(&self.cache_dir);
        if let Err(e) = create_shard_dirs(&self.cache_dir) {
            warn!(dir = %self.cache_dir.display(), error = %e, "recreating cache shards failed");
        }
        dropped
    }

    pub fn files_count(&self) -> i64 {
        self.inner.lock().unwrap().table.len() as i64
    }

    pub fn bytes_on_disk(&self) -> i64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn purged_count(&self) -> i64 {
        self.purged_count.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn check_accounting(&self) {
        let inner = self.inner.lock().unwrap();
        let sum: i64 = inner.table.values().map(|f| f.size as i64).sum();
        assert_eq!(sum, self.total_bytes.load(Ordering::Relaxed));
        assert_eq!(inner.table.len(), inner.lru.len());
        for f in inner.table.values() {
            assert!(f.path_in_cache.exists(), "missing {:?}", f.path_in_cache);
        }
    }
}

fn create_shard_dirs(cache_dir: &Path) -> io::Result<()> {
    fs::create_dir_all(cache_dir)?;
    for i in 0..SHARD_COUNT {
        let dir = cache_dir.join(format!("{:02X}", i));
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// The source cache: uploaded dependencies, shared across clients. A file
/// uploaded once is hard-linked into every later working directory that
/// declares the same digest, including after its client was purged.
pub struct SrcCache(pub FileCache);

impl SrcCache {
    pub fn new(cache_dir: impl Into<PathBuf>, hard_limit_bytes: i64) -> Result<Self, CacheError> {
        Ok(SrcCache(FileCache::new(cache_dir, hard_limit_bytes)?))
    }
}

/// The object cache: compiled objects keyed by a whole-compile fingerprint,
/// plus the scratch directory compiler outputs land in before insertion.
pub struct ObjCache {
    pub cache: FileCache,
    obj_tmp_dir: PathBuf,
}

impl ObjCache {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        obj_tmp_dir: impl Into<PathBuf>,
        hard_limit_bytes: i64,
    ) -> Result<Self, CacheError> {
        let obj_tmp_dir = obj_tmp_dir.into();
        fs::create_dir_all(&obj_tmp_dir)?;
        Ok(ObjCache { cache: FileCache::new(cache_dir, hard_limit_bytes)?, obj_tmp_dir })
    }

    /// Unique path for a session's compiler output, before (maybe) being
    /// linked into the cache.
    pub fn obj_out_path(&self, client_id: &str, session_id: u32, input_path: &str) -> PathBuf {
        let base = input_path.rsplit('/').next().unwrap_or(input_path);
        self.obj_tmp_dir.join(format!("{}.{}.{}.o", client_id, session_id, base))
    }
}

/// The whole-compile fingerprint that keys the object cache.
///
/// Two compiles may reuse one object iff the input basename, every
/// non-include argument (in order) and the full dependency set (count,
/// order, sizes, digests) agree. Include-dir values, the output path and
/// dependency absolute paths all vary per client without changing the
/// produced object, so they are left out by construction.
pub fn make_obj_cache_key(
    compiler_name: &str,
    args: &[String],
    deps: &[(u64, Digest256)],
    input_path: &str,
) -> Digest256 {
    let mut hasher = Sha256::new();
    hasher.update(compiler_name.as_bytes());
    for arg in args {
        hasher.update(arg.as_bytes());
    }
    let base = input_path.rsplit('/').next().unwrap_or(input_path);
    hasher.update(base.as_bytes());

    let mut key = Digest256::from_sha256(hasher);
    key.0[1] ^= args.len() as u64;
    key.0[2] ^= deps.len() as u64;
    for (size, digest) in deps {
        key.xor_with(digest);
        key.xor_first_word(*size);
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write as _;

    fn put_file(dir: &Path, name: &str, content: &[u8]) -> (PathBuf, Digest256, u64) {
        let path = dir.join(name);
        File::create(&path).unwrap().write_all(content).unwrap();
        (path, Digest256::of_bytes(content), content.len() as u64)
    }

    #[test]
    fn store_lookup_restore() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().join("cache"), 1 << 20).unwrap();
        let (src, key, size) = put_file(dir.path(), "a.h", b"int a;\n");

        assert!(cache.lookup(&key).is_none());
        cache.store(&src, "a.h", key, size).unwrap();
        assert!(cache.lookup(&key).is_some());
        cache.check_accounting();

        let dest = dir.path().join("restored.h");
        assert!(cache.restore_hard_link(&dest, &key));
        assert_eq!(fs::read(&dest).unwrap(), b"int a;\n");

        assert!(!cache.restore_hard_link(&dir.path().join("x"), &Digest256::of_bytes(b"nope")));
    }

    #[test]
    fn duplicate_store_keeps_one_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().join("cache"), 1 << 20).unwrap();
        let (src, key, size) = put_file(dir.path(), "a.h", b"int a;\n");

        cache.store(&src, "a.h", key, size).unwrap();
        cache.store(&src, "a.h", key, size).unwrap();
        assert_eq!(cache.files_count(), 1);
        assert_eq!(cache.bytes_on_disk(), size as i64);
        cache.check_accounting();
    }

    #[test]
    fn eviction_is_lru_ordered() {
        let dir = tempfile::tempdir().unwrap();
        // hard limit fits two of the three 100-byte entries
        let cache = FileCache::new(dir.path().join("cache"), 250).unwrap();
        let (a, ka, _) = put_file(dir.path(), "a", &[b'a'; 100]);
        let (b, kb, _) = put_file(dir.path(), "b", &[b'b'; 100]);
        let (c, kc, _) = put_file(dir.path(), "c", &[b'c'; 100]);

        cache.store(&a, "a", ka, 100).unwrap();
        cache.store(&b, "b", kb, 100).unwrap();
        // touch `a` so `b` becomes the LRU victim
        assert!(cache.lookup(&ka).is_some());
        cache.store(&c, "c", kc, 100).unwrap();

        assert!(cache.lookup(&kb).is_none());
        assert!(cache.lookup(&ka).is_some());
        assert!(cache.lookup(&kc).is_some());
        assert_eq!(cache.purged_count(), 1);
        cache.check_accounting();
    }

    #[test]
    fn store_never_evicts_its_own_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().join("cache"), 50).unwrap();
        let (a, ka, _) = put_file(dir.path(), "a", &[b'a'; 100]);
        // oversized relative to the limit, still kept: the newest entry
        // survives its own eviction pass
        cache.store(&a, "a", ka, 100).unwrap();
        assert!(cache.lookup(&ka).is_some());

        let (b, kb, _) = put_file(dir.path(), "b", &[b'b'; 100]);
        cache.store(&b, "b", kb, 100).unwrap();
        assert!(cache.lookup(&ka).is_none());
        assert!(cache.lookup(&kb).is_some());
        cache.check_accounting();
    }

    #[test]
    fn soft_limit_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().join("cache"), 1000).unwrap();
        for i in 0..9 {
            let (p, k, s) = put_file(dir.path(), &format!("f{i}"), &vec![i as u8; 100]);
            cache.store(&p, "f", k, s).unwrap();
        }
        assert_eq!(cache.bytes_on_disk(), 900);
        cache.evict_to_soft_limit();
        assert!(cache.bytes_on_disk() <= 800);
        cache.check_accounting();
    }

    #[test]
    fn evicted_files_keep_their_working_dir_links() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().join("cache"), 150).unwrap();
        let (a, ka, _) = put_file(dir.path(), "a", &[b'a'; 100]);
        cache.store(&a, "a", ka, 100).unwrap();

        let linked = dir.path().join("workdir-a");
        assert!(cache.restore_hard_link(&linked, &ka));

        let (b, kb, _) = put_file(dir.path(), "b", &[b'b'; 100]);
        cache.store(&b, "b", kb, 100).unwrap();
        assert!(cache.lookup(&ka).is_none());
        // hard-link semantics: the working-dir copy still reads fine
        assert_eq!(fs::read(&linked).unwrap(), vec![b'a'; 100]);
    }

    #[test]
    fn drop_all_resets_the_layout() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().join("cache"), 1 << 20).unwrap();
        let (a, ka, s) = put_file(dir.path(), "a", b"contents");
        cache.store(&a, "a", ka, s).unwrap();

        assert_eq!(cache.drop_all(), 1);
        assert_eq!(cache.files_count(), 0);
        assert_eq!(cache.bytes_on_disk(), 0);
        assert!(cache.lookup(&ka).is_none());
        assert!(dir.path().join("cache").join("00").is_dir());
        assert!(dir.path().join("cache").join("FF").is_dir());

        // storing after a drop works
        cache.store(&a, "a", ka, s).unwrap();
        assert_eq!(cache.files_count(), 1);
        cache.check_accounting();
    }

    #[test]
    fn obj_key_ignores_include_dirs_and_paths() {
        let deps = vec![
            (10u64, Digest256::of_bytes(b"dep1")),
            (20u64, Digest256::of_bytes(b"dep2")),
        ];
        let args: Vec<String> = vec!["-O2".into(), "-Wall".into()];
        let k1 = make_obj_cache_key("g++", &args, &deps, "/home/alice/proj/foo.cpp");
        let k2 = make_obj_cache_key("g++", &args, &deps, "/ci/build-7/proj/foo.cpp");
        assert_eq!(k1, k2);

        let k3 = make_obj_cache_key("g++", &args, &deps, "/home/alice/proj/bar.cpp");
        assert_ne!(k1, k3);

        let mut other_deps = deps.clone();
        other_deps[0].1 = Digest256::of_bytes(b"dep1-changed");
        assert_ne!(k1, make_obj_cache_key("g++", &args, &other_deps, "/proj/foo.cpp"));

        let fewer: Vec<String> = vec!["-O2".into()];
        assert_ne!(k1, make_obj_cache_key("g++", &fewer, &deps, "/home/alice/proj/foo.cpp"));
    }

    #[test]
    fn obj_out_paths_are_unique_per_session() {
        let dir = tempfile::tempdir().unwrap();
        let cache =
            ObjCache::new(dir.path().join("obj"), dir.path().join("cxx-out"), 1 << 20).unwrap();
        let p1 = cache.obj_out_path("clientA", 1, "/proj/foo.cpp");
        let p2 = cache.obj_out_path("clientA", 2, "/proj/foo.cpp");
        assert_ne!(p1, p2);
        assert!(p1.to_string_lossy().ends_with("clientA.1.foo.cpp.o"));
    }
}
