//! Delegation to the real compiler: default-search-dir discovery and the
//! `-M` slow-path dependency engine.
//!
//! The slow path exists for sources the lexical engine cannot follow
//! (macro-expanded `#include`s, as in boost). It runs only the
//! preprocessor; the compile itself still happens remotely.

use std::path::Path;
use std::process::Command;

use rcc_protocol::digest::Digest256;

use crate::classify::{is_source_file_name, path_abs};
use crate::include_dirs::IncludeDirs;
use crate::resolver::cache::IncludesCache;
use crate::resolver::{locate_own_pch, DepRecord, ResolveError};

/// Discover the compiler's built-in include dirs by asking its
/// preprocessor: `cxx -Wp,-v -x c++ /dev/null -fsyntax-only` prints the
/// search list on stderr. Done once per (compiler, -stdlib) pair.
pub fn default_include_dirs(
    compiler_name: &str,
    stdlib_args: &[String],
) -> std::io::Result<IncludeDirs> {
    let output = Command::new(compiler_name)
        .args(stdlib_args)
        .args(["-Wp,-v", "-x", "c++", "/dev/null", "-fsyntax-only"])
        .output()?;
    Ok(parse_search_dirs(&String::from_utf8_lossy(&output.stderr)))
}

/// Parse the search-list block of the preprocessor's stderr.
pub fn parse_search_dirs(stderr: &str) -> IncludeDirs {
    const QUOTE_MARKER: &str = "#include \"...\"";
    const ANGLE_MARKER: &str = "#include <...>";
    const END_MARKER: &str = "End of search list";

    #[derive(PartialEq)]
    enum Block {
        None,
        Quote,
        Angle,
    }

    let mut dirs = IncludeDirs::default();
    let mut block = Block::None;
    for line in stderr.lines() {
        let line = line.trim();
        if line.starts_with(QUOTE_MARKER) {
            block = Block::Quote;
        } else if line.starts_with(ANGLE_MARKER) {
            block = Block::Angle;
        } else if line.starts_with(END_MARKER) {
            break;
        } else if line.starts_with('/') {
            if line.ends_with("(framework directory)") {
                continue;
            }
            match block {
                Block::Quote => dirs.dirs_iquote.push(line.to_string()),
                Block::Angle => {
                    let normalized = std::fs::canonicalize(line)
                        .map(|p| p.to_string_lossy().into_owned())
                        .unwrap_or_else(|_| line.to_string());
                    if line.starts_with("/usr/") || line.starts_with("/Library/") {
                        dirs.dirs_isystem.push(normalized);
                    } else {
                        dirs.dirs_i.push(normalized);
                    }
                }
                Block::None => {}
            }
        }
    }
    dirs
}

/// Collect dependencies by running the compiler with `-M` (preprocessor
/// only, dependency list to stdout). The output is parsed, then every
/// path is read and hashed exactly like the fast path would.
pub fn collect_deps_by_preprocessor(
    includes_cache: &IncludesCache,
    cwd: &Path,
    compiler_name: &str,
    input_abs: &str,
    args: &[String],
    include_dirs: &IncludeDirs,
) -> Result<(DepRecord, Vec<DepRecord>), ResolveError> {
    let mut cmd_line: Vec<String> = Vec::with_capacity(args.len() + 2 * include_dirs.count() + 4);
    cmd_line.extend(args.iter().cloned());
    cmd_line.extend(include_dirs.as_args());
    drop_emit_pch(&mut cmd_line);
    cmd_line.extend(["-o".into(), "/dev/stdout".into(), "-M".into(), input_abs.to_string()]);

    let output = Command::new(compiler_name)
        .args(&cmd_line)
        .current_dir(cwd)
        .output()
        .map_err(|e| ResolveError::Preprocessor(format!("can't run {compiler_name}: {e}")))?;
    if !output.status.success() {
        return Err(ResolveError::Preprocessor(format!(
            "{compiler_name} exited with code {}: {}",
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let search_pch = is_source_file_name(input_abs);
    let mut deps = Vec::new();
    for path in extract_deps_from_m_output(&String::from_utf8_lossy(&output.stdout), cwd) {
        if search_pch {
            if let Some(pch_dep) = locate_own_pch(&path, includes_cache) {
                deps.push(pch_dep);
                continue;
            }
        }
        deps.push(read_record(&path)?);
    }
    let input_record = read_record(input_abs)?;
    Ok((input_record, deps))
}

/// `-Xclang -emit-pch` writes a pch even under `-M`; strip the pair.
fn drop_emit_pch(cmd_line: &mut Vec<String>) {
    if let Some(pos) = cmd_line
        .windows(2)
        .position(|w| w[0] == "-Xclang" && w[1] == "-emit-pch")
    {
        cmd_line.drain(pos..pos + 2);
    }
}

/// Pull dependency paths out of `-M` output: Make rule syntax with `\`
/// continuations, the target and the input filtered away, plus clang's
/// `#pragma GCC pch_preprocess "file"` lines.
pub fn extract_deps_from_m_output(stdout: &str, cwd: &Path) -> Vec<String> {
    let mut paths = Vec::new();
    let mut words = stdout.split_whitespace().peekable();
    while let Some(word) = words.next() {
        if word == "#pragma" {
            if words.next() == Some("GCC")
                && words.next() == Some("pch_preprocess")
            {
                if let Some(quoted) = words.next() {
                    paths.push(path_abs(cwd, quoted.trim_matches('"')));
                }
            }
            continue;
        }
        if word == "\\"
            || is_source_file_name(word)
            || word.ends_with(".o")
            || word.ends_with(".o:")
        {
            continue;
        }
        paths.push(path_abs(cwd, word));
    }
    paths
}

fn read_record(path: &str) -> Result<DepRecord, ResolveError> {
    let content = std::fs::read(path)
        .map_err(|source| ResolveError::Io { path: path.to_string(), source })?;
    Ok(DepRecord {
        path: path.to_string(),
        size: content.len() as u64,
        digest: Digest256::of_bytes_with_crc64_header(&content),
    })
}
