//! The portable precompiled-header container (`.rcc-pch`).
//!
//! When the client is asked to produce a `.gch`/`.pch`, it writes this
//! container instead: a text header describing the compiler invocation,
//! followed by every dependency's raw bytes. Any worker can rebuild the
//! complete source tree from the container alone and compile the real
//! precompiled header on its side, exactly once per fingerprint.
//!
//! Layout:
//!
//! ```text
//! PCH_HASH=<w0>-<w1>-<w2>-<w3>
//! ORIG_HDR=<client path of the .h>
//! ORIG_PCH=<client path of the .gch/.pch>
//! CXX_NAME=<compiler>
//! CXX_ARGS=<space-joined args>
//! CXX_DIRS=<space-joined include-dir args>
//! <sentinel> <dep path> \<dep size> <dep digest>
//! <dep raw bytes>
//! <sentinel> ...
//! ```
//!
//! Each payload is followed by a single `\n` so a sentinel always begins a
//! line; the parser slices payloads by the recorded size, never by
//! searching, so a dependency whose *contents* contain the sentinel still
//! round-trips bit-exactly.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest as _, Sha256};
use thiserror::Error;

use crate::digest::Digest256;

/// File extension of the container, appended to the original header name
/// (`all-headers.h` → `all-headers.h.rcc-pch`).
pub const PCH_SUFFIX: &str = ".rcc-pch";

/// Separator line prefix between dependency payloads. Chosen to be
/// syntactically impossible at the start of a line in well-formed C++.
const SENTINEL: &str = "#=======#'\"\\/\"'#=======#";

/// Header fields are read from at most this much of the file.
const HEADER_SCAN_LIMIT: usize = 32 * 1024;

/// Errors from reading or writing a container.
#[derive(Debug, Error)]
pub enum PchError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupted pch container {path:?}: {reason}")]
    Corrupted { path: PathBuf, reason: &'static str },
}

/// One embedded dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PchDep {
    /// Absolute path on the client file system.
    pub path: String,
    pub size: u64,
    pub digest: Digest256,
}

/// A parsed or to-be-written `.rcc-pch` container.
#[derive(Debug, Clone, Default)]
pub struct OwnPch {
    /// Where the container itself lives (or will live).
    pub own_pch_path: PathBuf,
    /// The header the precompiled header is generated from.
    pub orig_header: String,
    /// The `.gch`/`.pch` path the original command line asked for.
    pub orig_pch: String,
    pub fingerprint: Digest256,
    pub compiler_name: String,
    pub compiler_args: Vec<String>,
    /// Flattened include-dir argument pairs, client-absolute.
    pub include_dir_args: Vec<String>,
    pub deps: Vec<PchDep>,
}

impl OwnPch {
    pub fn add_dep(&mut self, path: String, size: u64, digest: Digest256) {
        self.deps.push(PchDep { path, size, digest });
    }

    /// Compute the fingerprint from the invocation and the dependency set.
    ///
    /// Equal build agents generate equal fingerprints, so a fleet compiles
    /// each precompiled header only once. Include-dir values are excluded;
    /// dependency digests and sizes stand in for them.
    pub fn compute_fingerprint(&mut self) {
        let mut hasher = Sha256::new();
        hasher.update(self.compiler_name.as_bytes());
        hasher.update(b"; args = ");
        for arg in &self.compiler_args {
            hasher.update(arg.as_bytes());
            hasher.update(b" ");
        }
        hasher.update(format!("; deps {}", self.deps.len()).as_bytes());
        hasher.update(b"; in ");
        hasher.update(file_base_name(&self.orig_header).as_bytes());

        let mut fp = Digest256::from_sha256(hasher);
        for dep in &self.deps {
            fp.xor_with(&dep.digest);
            fp.xor_first_word(dep.size);
        }
        self.fingerprint = fp;
    }

    /// Write the container next to its final path, via temp-then-rename.
    /// Returns the container's byte size.
    pub fn save(&self) -> Result<u64, PchError> {
        let tmp_path = tmp_sibling(&self.own_pch_path);
        let mut out = BufWriter::new(File::create(&tmp_path)?);

        let total_dep_bytes: u64 = self.deps.iter().map(|d| d.size).sum();
        let result = (|| -> Result<(), PchError> {
            writeln!(out, "PCH_HASH={}", self.fingerprint.to_long_hex())?;
            writeln!(out)?;
            writeln!(out, "# a portable precompiled header generated from")?;
            writeln!(out, "ORIG_HDR={}", self.orig_header)?;
            writeln!(out, "# it was created instead of")?;
            writeln!(out, "ORIG_PCH={}", self.orig_pch)?;
            writeln!(out)?;
            writeln!(out, "# a real pch is compiled by workers on demand with these parameters")?;
            writeln!(out, "CXX_NAME={}", self.compiler_name)?;
            writeln!(out, "CXX_ARGS={}", self.compiler_args.join(" "))?;
            writeln!(out, "CXX_DIRS={}", self.include_dir_args.join(" "))?;
            writeln!(out)?;
            writeln!(
                out,
                "# all dependencies follow, system headers included ({} files, {} bytes)",
                self.deps.len(),
                total_dep_bytes
            )?;
            writeln!(out, "# regenerate this file whenever any dependency changes")?;
            writeln!(out)?;

            let mut buf = Vec::new();
            for dep in &self.deps {
                writeln!(
                    out,
                    "{} {} \\{} {}",
                    SENTINEL,
                    dep.path,
                    dep.size,
                    dep.digest.to_long_hex()
                )?;
                buf.clear();
                File::open(&dep.path)?.read_to_end(&mut buf)?;
                out.write_all(&buf)?;
                // keep the next sentinel at line start regardless of the
                // payload's final byte; the reader skips exactly one '\n'
                out.write_all(b"\n")?;
            }
            out.flush()?;
            Ok(())
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
        drop(out);

        let size = fs::metadata(&tmp_path)?.len();
        let _ = fs::remove_file(&self.own_pch_path);
        fs::rename(&tmp_path, &self.own_pch_path)?;
        Ok(size)
    }

    /// Parse the header fields only (the dependency payloads are not
    /// touched). Enough to learn the fingerprint and invocation.
    pub fn parse(own_pch_path: &Path) -> Result<OwnPch, PchError> {
        let mut head = vec![0u8; HEADER_SCAN_LIMIT];
        let mut file = File::open(own_pch_path)?;
        let mut filled = 0usize;
        loop {
            let n = file.read(&mut head[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
            if filled == head.len() {
                break;
            }
        }
        head.truncate(filled);

        let corrupted = |reason| PchError::Corrupted { path: own_pch_path.to_path_buf(), reason };
        let sep_pos = find_sub(&head, SENTINEL.as_bytes())
            .ok_or_else(|| corrupted("no dependency sentinel in header"))?;
        let header_text =
            std::str::from_utf8(&head[..sep_pos]).map_err(|_| corrupted("non-utf8 header"))?;

        let mut pch = OwnPch { own_pch_path: own_pch_path.to_path_buf(), ..Default::default() };
        for line in header_text.lines() {
            if let Some(v) = line.strip_prefix("PCH_HASH=") {
                pch.fingerprint = Digest256::from_long_hex(v).unwrap_or_default();
            } else if let Some(v) = line.strip_prefix("ORIG_HDR=") {
                pch.orig_header = v.to_string();
            } else if let Some(v) = line.strip_prefix("ORIG_PCH=") {
                pch.orig_pch = v.to_string();
            } else if let Some(v) = line.strip_prefix("CXX_NAME=") {
                pch.compiler_name = v.to_string();
            } else if let Some(v) = line.strip_prefix("CXX_ARGS=") {
                pch.compiler_args = split_space_joined(v);
            } else if let Some(v) = line.strip_prefix("CXX_DIRS=") {
                pch.include_dir_args = split_space_joined(v);
            }
        }

        if pch.compiler_name.is_empty()
            || pch.compiler_args.is_empty()
            || pch.orig_pch.is_empty()
            || pch.fingerprint.is_zero()
        {
            return Err(corrupted("missing header fields"));
        }
        Ok(pch)
    }

    /// Recreate the full client file tree under `root_dir`, filling
    /// `self.deps` along the way. A client path `/a/b.h` lands at
    /// `{root_dir}/a/b.h`; the directory for the eventual real pch is
    /// pre-created too.
    pub fn extract_deps_into(&mut self, root_dir: &Path) -> Result<(), PchError> {
        fs::create_dir_all(root_dir)?;

        let contents = fs::read(&self.own_pch_path)?;
        let corrupted =
            |reason| PchError::Corrupted { path: self.own_pch_path.clone(), reason };

        self.deps.clear();
        let mut pos = find_sub(&contents, SENTINEL.as_bytes())
            .ok_or_else(|| corrupted("no dependency sentinel"))?;

        while pos < contents.len() {
            // "<sentinel> <path> \<size> <digest>\n"
            let line_start = pos + SENTINEL.len();
            let nl = find_sub(&contents[line_start..], b"\n")
                .ok_or_else(|| corrupted("unterminated sentinel line"))?;
            let line = std::str::from_utf8(&contents[line_start..line_start + nl])
                .map_err(|_| corrupted("non-utf8 sentinel line"))?
                .trim();
            let back_pos =
                line.rfind(" \\").ok_or_else(|| corrupted("malformed sentinel line"))?;
            let path = &line[..back_pos];
            let mut tail = line[back_pos + 2..].split_whitespace();
            let size: u64 = tail
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| corrupted("bad dependency size"))?;
            let digest = tail
                .next()
                .and_then(Digest256::from_long_hex)
                .filter(|d| !d.is_zero())
                .ok_or_else(|| corrupted("bad dependency digest"))?;

            let payload_start = line_start + nl + 1;
            let payload_end = payload_start + size as usize;
            if payload_end > contents.len() {
                return Err(corrupted("truncated dependency payload"));
            }
            let payload = &contents[payload_start..payload_end];

            let dest = map_under_root(root_dir, path);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&dest, payload)?;
            self.deps.push(PchDep { path: path.to_string(), size, digest });

            // one '\n' separates the payload from the next sentinel
            pos = payload_end;
            if contents.get(pos) == Some(&b'\n') {
                pos += 1;
            }
            if pos == contents.len() {
                break;
            }
            if !contents[pos..].starts_with(SENTINEL.as_bytes()) {
                return Err(corrupted("expected sentinel after payload"));
            }
        }

        let pch_dest = map_under_root(root_dir, &self.orig_pch);
        if let Some(parent) = pch_dest.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

/// Map a client-absolute path under a root dir by stripping the leading `/`.
pub fn map_under_root(root: &Path, client_path: &str) -> PathBuf {
    root.join(client_path.trim_start_matches('/'))
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".tmp.{}", std::process::id()));
    path.with_file_name(name)
}

fn file_base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn split_space_joined(v: &str) -> Vec<String> {
    v.split(' ').filter(|s| !s.is_empty()).map(str::to_string).collect()
}

fn find_sub(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_dep(dir: &Path, rel: &str, content: &[u8]) -> (String, u64, Digest256) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        (
            path.to_str().unwrap().to_string(),
            content.len() as u64,
            Digest256::of_bytes(content),
        )
    }

    fn build_pch(dir: &Path, deps: &[(&str, &[u8])]) -> OwnPch {
        let mut pch = OwnPch {
            own_pch_path: dir.join("all.h.rcc-pch"),
            orig_header: "/proj/all.h".into(),
            orig_pch: "/proj/all.h.gch".into(),
            compiler_name: "g++".into(),
            compiler_args: vec!["-O2".into(), "-x".into(), "c++-header".into()],
            include_dir_args: vec!["-I".into(), "/proj/include".into()],
            ..Default::default()
        };
        for (rel, content) in deps {
            let (path, size, digest) = write_dep(dir, rel, content);
            pch.add_dep(path, size, digest);
        }
        pch.compute_fingerprint();
        pch
    }

    #[test]
    fn save_parse_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let pch = build_pch(dir.path(), &[("src/all.h", b"#pragma once\nint x;\n")]);
        pch.save().unwrap();

        let parsed = OwnPch::parse(&pch.own_pch_path).unwrap();
        assert_eq!(parsed.fingerprint, pch.fingerprint);
        assert_eq!(parsed.orig_header, pch.orig_header);
        assert_eq!(parsed.orig_pch, pch.orig_pch);
        assert_eq!(parsed.compiler_name, pch.compiler_name);
        assert_eq!(parsed.compiler_args, pch.compiler_args);
        assert_eq!(parsed.include_dir_args, pch.include_dir_args);
    }

    #[test]
    fn extract_reproduces_the_tree_bit_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let contents: &[(&str, &[u8])] = &[
            ("src/all.h", b"#include \"a.h\"\n#include \"b.h\"\n"),
            ("src/a.h", b"int a;\n"),
            ("src/b.h", b"int b; // no trailing newline"),
        ];
        let pch = build_pch(dir.path(), contents);
        pch.save().unwrap();

        let mut parsed = OwnPch::parse(&pch.own_pch_path).unwrap();
        let root = dir.path().join("extracted");
        parsed.extract_deps_into(&root).unwrap();

        assert_eq!(parsed.deps.len(), contents.len());
        for (dep, (_, content)) in parsed.deps.iter().zip(contents) {
            let extracted = fs::read(map_under_root(&root, &dep.path)).unwrap();
            assert_eq!(&extracted, content, "payload mismatch for {}", dep.path);
            assert_eq!(dep.digest, Digest256::of_bytes(content));
        }
        // the real pch's directory is ready for the compiler
        assert!(map_under_root(&root, &parsed.orig_pch).parent().unwrap().is_dir());
    }

    #[test]
    fn payload_containing_the_sentinel_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let tricky = format!("before\n{SENTINEL} /fake/path \\3 1-2-3-4\nafter\n");
        let contents: &[(&str, &[u8])] =
            &[("src/tricky.h", tricky.as_bytes()), ("src/tail.h", b"int t;\n")];
        let pch = build_pch(dir.path(), contents);
        pch.save().unwrap();

        let mut parsed = OwnPch::parse(&pch.own_pch_path).unwrap();
        let root = dir.path().join("extracted");
        parsed.extract_deps_into(&root).unwrap();

        assert_eq!(parsed.deps.len(), 2);
        let got = fs::read(map_under_root(&root, &parsed.deps[0].path)).unwrap();
        assert_eq!(got, tricky.as_bytes());
    }

    #[test]
    fn fingerprint_depends_on_deps_not_on_include_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = build_pch(dir.path(), &[("src/all.h", b"int x;\n")]);
        let mut b = a.clone();
        b.include_dir_args = vec!["-I".into(), "/elsewhere".into()];
        a.compute_fingerprint();
        b.compute_fingerprint();
        assert_eq!(a.fingerprint, b.fingerprint);

        let mut c = a.clone();
        c.deps[0].digest = Digest256::of_bytes(b"other contents");
        c.compute_fingerprint();
        assert_ne!(a.fingerprint, c.fingerprint);
    }

    #[test]
    fn parse_rejects_a_gutted_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.rcc-pch");
        fs::write(&path, format!("CXX_NAME=g++\n{SENTINEL} /a \\1 1-2-3-4\nx\n")).unwrap();
        assert!(matches!(OwnPch::parse(&path), Err(PchError::Corrupted { .. })));
    }
}
