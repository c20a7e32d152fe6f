//! Command-line classifier.
//!
//! Parses a compiler invocation the way the daemon needs it: output and
//! input split out, include directories collected into their own group
//! (their paths must be rewritten worker-side), `-M*` depfile flags
//! stripped for client-side handling, and everything the remote pipeline
//! cannot honor refused up front so the invocation falls back to a plain
//! local compile.

use std::path::Path;

use thiserror::Error;

use crate::depfile::DepFlags;
use crate::include_dirs::IncludeDirs;

/// What an invocation turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeKind {
    /// `-c` to an `.o`: the main remote-compilation path.
    CompileCpp,
    /// Output is a `.gch`/`.pch`: own-pch generation instead.
    CompilePch,
    /// Object/archive inputs: linking never goes remote.
    Link,
}

/// Why an invocation cannot run remotely. All of these mean "compile
/// locally", never "fail the build".
#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("unsupported option: {0}")]
    UnsupportedOption(String),

    #[error("no argument after {0}")]
    MissingArgValue(String),

    #[error("no input file specified")]
    NoInputFile,

    #[error("multiple input source files")]
    MultipleInputFiles,

    #[error("unsupported output file extension: {0}")]
    BadOutputExtension(String),
}

/// A fully parsed compile invocation.
#[derive(Debug, Clone)]
pub struct ParsedInvocation {
    pub kind: InvokeKind,
    pub compiler_name: String,
    /// Args except includes/output/input/depfile flags, in order.
    pub args: Vec<String>,
    pub include_dirs: IncludeDirs,
    /// Input exactly as typed (possibly relative to the cwd).
    pub input_path: String,
    /// Output exactly as typed.
    pub output_path: String,
    pub dep_flags: DepFlags,
    /// `-stdlib=` values: part of the include-cache identity, since they
    /// change the compiler's default search dirs.
    pub stdlib_args: Vec<String>,
}

impl ParsedInvocation {
    pub fn input_abs(&self, cwd: &Path) -> String {
        path_abs(cwd, &self.input_path)
    }

    pub fn output_abs(&self, cwd: &Path) -> String {
        path_abs(cwd, &self.output_path)
    }
}

pub fn is_source_file_name(name: &str) -> bool {
    [".cpp", ".cc", ".cxx", ".c"].iter().any(|ext| name.ends_with(ext))
}

pub fn is_header_file_name(name: &str) -> bool {
    [".h", ".hh", ".hxx", ".hpp"].iter().any(|ext| name.ends_with(ext))
}

pub fn path_abs(cwd: &Path, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", cwd.display(), path)
    }
}

/// Options refused outright: they change preprocessing or lookup in ways
/// the resolver and the path-mirroring pipeline cannot reproduce.
const REFUSED_EXACT: &[&str] =
    &["-march=native", "-I-", "-E", "-M", "-MM", "-MG", "-nostdinc", "-nostdinc++", "-isysroot"];
const REFUSED_PREFIX: &[&str] = &["--sysroot", "-iprefix", "-idirafter"];

pub fn parse_invocation(cwd: &Path, cmd_line: &[String]) -> Result<ParsedInvocation, ClassifyError> {
    let mut inv = ParsedInvocation {
        kind: InvokeKind::CompileCpp,
        compiler_name: cmd_line[0].clone(),
        args: Vec::with_capacity(cmd_line.len()),
        include_dirs: IncludeDirs::default(),
        input_path: String::new(),
        output_path: String::new(),
        dep_flags: DepFlags::default(),
        stdlib_args: Vec::new(),
    };

    let mut i = 1;
    while i < cmd_line.len() {
        let arg = &cmd_line[i];
        if arg.is_empty() {
            i += 1;
            continue;
        }

        if arg.starts_with('-') {
            if let Some(out) = parse_joined_or_split("-o", cmd_line, &mut i)? {
                inv.dep_flags.set_orig_output(&out);
                inv.output_path = out;
            } else if let Some(dir) = parse_joined_or_split("-I", cmd_line, &mut i)? {
                inv.include_dirs.dirs_i.push(path_abs(cwd, &dir));
            } else if let Some(dir) = parse_joined_or_split("-iquote", cmd_line, &mut i)? {
                inv.include_dirs.dirs_iquote.push(path_abs(cwd, &dir));
            } else if let Some(dir) = parse_joined_or_split("-isystem", cmd_line, &mut i)? {
                inv.include_dirs.dirs_isystem.push(path_abs(cwd, &dir));
            } else if let Some(file) = parse_joined_or_split("-include", cmd_line, &mut i)? {
                inv.include_dirs.files_i.push(path_abs(cwd, &file));
            } else if REFUSED_EXACT.contains(&arg.as_str())
                || REFUSED_PREFIX.iter().any(|p| arg.starts_with(p))
            {
                return Err(ClassifyError::UnsupportedOption(arg.clone()));
            } else if let Some(file) = parse_split_only("-MF", cmd_line, &mut i)? {
                inv.dep_flags.set_mf(path_abs(cwd, &file));
            } else if let Some(target) = parse_split_only("-MT", cmd_line, &mut i)? {
                inv.dep_flags.set_mt(&target);
            } else if let Some(target) = parse_split_only("-MQ", cmd_line, &mut i)? {
                inv.dep_flags.set_mq(&target);
            } else if arg == "-MD" {
                inv.dep_flags.set_md();
            } else if arg == "-MMD" {
                inv.dep_flags.set_mmd();
            } else if arg == "-MP" {
                inv.dep_flags.set_mp();
            } else if arg == "-Xarch_arm64" {
                // target-gating wrapper, dropped from the remote line
            } else if arg == "-Xclang" && i + 1 < cmd_line.len() {
                let escorted = &cmd_line[i + 1];
                if ["-I", "-iquote", "-isystem", "-include"].contains(&escorted.as_str()) {
                    // fall through to the include parsing on the next pass,
                    // as if the -Xclang escort wasn't there
                } else {
                    inv.args.push("-Xclang".to_string());
                    inv.args.push(escorted.clone());
                    i += 1;
                }
            } else if arg.starts_with("-stdlib") || arg.starts_with("--stdlib") {
                let value = parse_eq_or_split(cmd_line, &mut i)?;
                inv.stdlib_args.push(format!("-stdlib={value}"));
                inv.args.push(format!("-stdlib={value}"));
            } else {
                inv.args.push(arg.clone());
            }
        } else if is_source_file_name(arg) || is_header_file_name(arg) {
            if !inv.input_path.is_empty() {
                return Err(ClassifyError::MultipleInputFiles);
            }
            inv.dep_flags.set_orig_input(arg);
            inv.input_path = arg.clone();
        } else if arg.ends_with(".o") || arg.ends_with(".a") || arg.ends_with(".so") {
            inv.kind = InvokeKind::Link;
            return Ok(inv);
        } else {
            inv.args.push(arg.clone());
        }
        i += 1;
    }

    if inv.input_path.is_empty() {
        return Err(ClassifyError::NoInputFile);
    }
    if inv.output_path.ends_with(".o") {
        inv.kind = InvokeKind::CompileCpp;
    } else if inv.output_path.contains(".gch") || inv.output_path.contains(".pch") {
        inv.kind = InvokeKind::CompilePch;
    } else {
        return Err(ClassifyError::BadOutputExtension(inv.output_path));
    }
    Ok(inv)
}

/// `-I /path`, `-I/path`, and `-I -Xclang /path` (clang escorts values).
fn parse_joined_or_split(
    key: &str,
    cmd_line: &[String],
    i: &mut usize,
) -> Result<Option<String>, ClassifyError> {
    let arg = &cmd_line[*i];
    if arg == key {
        *i += 1;
        if *i >= cmd_line.len() {
            return Err(ClassifyError::MissingArgValue(key.to_string()));
        }
        if cmd_line[*i] == "-Xclang" {
            *i += 1;
            if *i >= cmd_line.len() {
                return Err(ClassifyError::MissingArgValue(key.to_string()));
            }
        }
        return Ok(Some(cmd_line[*i].clone()));
    }
    if let Some(joined) = arg.strip_prefix(key) {
        if !joined.is_empty() && !joined.starts_with('-') {
            return Ok(Some(joined.to_string()));
        }
    }
    Ok(None)
}

/// Exact-key flags that take the next argument (`-MF file`).
fn parse_split_only(
    key: &str,
    cmd_line: &[String],
    i: &mut usize,
) -> Result<Option<String>, ClassifyError> {
    if cmd_line[*i] != key {
        return Ok(None);
    }
    *i += 1;
    if *i >= cmd_line.len() {
        return Err(ClassifyError::MissingArgValue(key.to_string()));
    }
    Ok(Some(cmd_line[*i].clone()))
}

/// `-flag=value` or `-flag value`.
fn parse_eq_or_split(cmd_line: &[String], i: &mut usize) -> Result<String, ClassifyError> {
    let arg = &cmd_line[*i];
    if let Some((_, value)) = arg.split_once('=') {
        return Ok(value.to_string());
    }
    *i += 1;
    if *i >= cmd_line.len() {
        return Err(ClassifyError::MissingArgValue(arg.clone()));
    }
    Ok(cmd_line[*i].clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn parse(list: &[&str]) -> Result<ParsedInvocation, ClassifyError> {
        parse_invocation(Path::new("/work"), &args(list))
    }

    #[test]
    fn typical_cmake_invocation() {
        let inv = parse(&[
            "g++", "-DNDEBUG", "-Iinclude", "-I", "/abs/include", "-iquote", "local", "-isystem",
            "/usr/include/x", "-O2", "-Wall", "-MD", "-MT", "foo.cpp.o", "-MF", "foo.cpp.o.d",
            "-o", "foo.cpp.o", "-c", "foo.cpp",
        ])
        .unwrap();

        assert_eq!(inv.kind, InvokeKind::CompileCpp);
        assert_eq!(inv.compiler_name, "g++");
        assert_eq!(inv.input_path, "foo.cpp");
        assert_eq!(inv.output_path, "foo.cpp.o");
        assert_eq!(inv.include_dirs.dirs_i, vec!["/work/include", "/abs/include"]);
        assert_eq!(inv.include_dirs.dirs_iquote, vec!["/work/local"]);
        assert_eq!(inv.include_dirs.dirs_isystem, vec!["/usr/include/x"]);
        assert_eq!(inv.args, vec!["-DNDEBUG", "-O2", "-Wall", "-c"]);
        assert!(inv.dep_flags.should_generate());
        assert_eq!(inv.input_abs(Path::new("/work")), "/work/foo.cpp");
    }

    #[test]
    fn pch_output_is_its_own_kind() {
        let inv = parse(&["g++", "-x", "c++-header", "-o", "all.h.gch", "all.h"]).unwrap();
        assert_eq!(inv.kind, InvokeKind::CompilePch);

        let inv = parse(&["clang++", "-o", "all.h.pch", "all.hpp"]).unwrap();
        assert_eq!(inv.kind, InvokeKind::CompilePch);
    }

    #[test]
    fn object_inputs_mean_linking() {
        let inv = parse(&["g++", "a.o", "b.o", "-o", "prog"]).unwrap();
        assert_eq!(inv.kind, InvokeKind::Link);
        let inv = parse(&["g++", "libfoo.a", "-o", "prog"]).unwrap();
        assert_eq!(inv.kind, InvokeKind::Link);
    }

    #[test]
    fn refused_options() {
        for opt in ["-march=native", "-E", "-M", "-MM", "-MG", "-nostdinc", "-nostdinc++",
                    "--sysroot=/x", "-iprefix/x", "-idirafter", "-isysroot"] {
            let result = parse(&["g++", opt, "-o", "a.o", "-c", "a.cpp"]);
            assert!(
                matches!(result, Err(ClassifyError::UnsupportedOption(_))),
                "{opt} should be refused, got {result:?}"
            );
        }
    }

    #[test]
    fn input_errors() {
        assert!(matches!(parse(&["g++", "-o", "a.o", "-c"]), Err(ClassifyError::NoInputFile)));
        assert!(matches!(
            parse(&["g++", "-o", "a.o", "-c", "a.cpp", "b.cpp"]),
            Err(ClassifyError::MultipleInputFiles)
        ));
        assert!(matches!(
            parse(&["g++", "-o", "a.out", "-c", "a.cpp"]),
            Err(ClassifyError::BadOutputExtension(_))
        ));
        assert!(matches!(parse(&["g++", "-I"]), Err(ClassifyError::MissingArgValue(_))));
    }

    #[test]
    fn xclang_escorted_includes_are_unwrapped() {
        let inv = parse(&[
            "clang++", "-Xclang", "-include", "-Xclang", "/pre.h", "-Xclang", "-emit-pch", "-o",
            "a.o", "-c", "a.cpp",
        ])
        .unwrap();
        assert_eq!(inv.include_dirs.files_i, vec!["/pre.h"]);
        assert_eq!(inv.args, vec!["-Xclang", "-emit-pch", "-c"]);
    }

    #[test]
    fn stdlib_is_kept_and_recorded() {
        let inv = parse(&["clang++", "-stdlib=libc++", "-o", "a.o", "-c", "a.cpp"]).unwrap();
        assert_eq!(inv.stdlib_args, vec!["-stdlib=libc++"]);
        assert!(inv.args.contains(&"-stdlib=libc++".to_string()));
    }

    #[test]
    fn xarch_wrapper_is_dropped() {
        let inv = parse(&["clang++", "-Xarch_arm64", "-o", "a.o", "-c", "a.cpp"]).unwrap();
        assert_eq!(inv.args, vec!["-c"]);
    }
}
