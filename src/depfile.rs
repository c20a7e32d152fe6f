//! Dependency-file (`.o.d`) flags and the Make-compatible writer.
//!
//! Build systems invoke the compiler like
//! `g++ -MD -MT a.cpp.o -MF a.cpp.o.d -o a.cpp.o -c a.cpp` and expect a
//! depfile next to the object. The daemon already knows the full include
//! closure from the resolver, so the depfile is produced client-side and
//! the `-M*` flags never reach the worker.

use std::fs;
use std::path::Path;

use crate::include_dirs::IncludeDirs;
use crate::resolver::DepRecord;

/// The `-M*` flags of one invocation, stripped from the remote command.
#[derive(Debug, Clone, Default)]
pub struct DepFlags {
    /// `-MF {file}`, pre-resolved against the cwd.
    flag_mf: String,
    /// Accumulated `-MT`/`-MQ` targets.
    flag_mt: String,
    flag_md: bool,
    flag_mmd: bool,
    flag_mp: bool,

    /// `-o` exactly as typed — the default target name.
    orig_output: String,
    /// The input exactly as typed — always the first dependency.
    orig_input: String,
}

impl DepFlags {
    pub fn set_mf(&mut self, abs_path: String) {
        self.flag_mf = abs_path;
    }

    /// `-MT` targets concatenate verbatim.
    pub fn set_mt(&mut self, target: &str) {
        if !self.flag_mt.is_empty() {
            self.flag_mt.push_str(" \\\n ");
        }
        self.flag_mt.push_str(target);
    }

    /// `-MQ` targets concatenate with Make quoting applied.
    pub fn set_mq(&mut self, target: &str) {
        if !self.flag_mt.is_empty() {
            self.flag_mt.push_str(" \\\n ");
        }
        self.flag_mt.push_str(&quote_make_target(target));
    }

    pub fn set_md(&mut self) {
        self.flag_md = true;
    }

    pub fn set_mmd(&mut self) {
        self.flag_mmd = true;
    }

    pub fn set_mp(&mut self) {
        self.flag_mp = true;
    }

    pub fn set_orig_output(&mut self, output: &str) {
        self.orig_output = output.to_string();
    }

    pub fn set_orig_input(&mut self, input: &str) {
        self.orig_input = input.to_string();
    }

    /// A depfile is written iff `-MD` or `-MF` appeared.
    pub fn should_generate(&self) -> bool {
        self.flag_md || !self.flag_mf.is_empty()
    }

    /// Write the depfile for an already-collected dependency list.
    /// Returns the path written.
    pub fn generate_and_save(
        &self,
        output_abs: &str,
        default_system_dirs: &IncludeDirs,
        deps: &[DepRecord],
    ) -> std::io::Result<String> {
        let target = if self.flag_mt.is_empty() {
            // matching observed compiler behavior: the as-given -o
            quote_make_target(&self.orig_output)
        } else {
            self.flag_mt.clone()
        };

        let dep_file_name = if self.flag_mf.is_empty() {
            replace_file_ext(output_abs, ".d")
        } else {
            self.flag_mf.clone()
        };

        let dep_list = self.dep_list(default_system_dirs, deps);
        let mut targets = vec![DepFileTarget { name: target, deps: dep_list.clone() }];
        if self.flag_mp {
            // one phony empty-deps target per dependency other than the
            // main input
            for dep in dep_list.iter().skip(1) {
                targets.push(DepFileTarget { name: escape_make_spaces(dep), deps: vec![] });
            }
        }

        let dep_file = DepFile { targets };
        dep_file.write_to_file(Path::new(&dep_file_name))?;
        Ok(dep_file_name)
    }

    fn dep_list(&self, default_system_dirs: &IncludeDirs, deps: &[DepRecord]) -> Vec<String> {
        let cwd_prefix = std::env::current_dir()
            .map(|d| format!("{}/", d.display()))
            .unwrap_or_default();

        // items are stored raw; the writer applies Make escaping once
        let mut list = Vec::with_capacity(1 + deps.len());
        list.push(self.orig_input.clone());
        for dep in deps {
            if self.flag_mmd && is_under_any(&dep.path, &default_system_dirs.dirs_isystem) {
                continue;
            }
            let rel = dep.path.strip_prefix(&cwd_prefix).unwrap_or(&dep.path);
            list.push(rel.to_string());
        }
        list
    }
}

fn is_under_any(path: &str, dirs: &[String]) -> bool {
    dirs.iter().any(|d| path.starts_with(d.as_str()))
}

/// Swap the extension of a path-like string (`a/b.o` + `.d` → `a/b.d`).
pub fn replace_file_ext(path: &str, new_ext: &str) -> String {
    match path.rfind('.') {
        Some(dot) if !path[dot..].contains('/') => format!("{}{}", &path[..dot], new_ext),
        _ => format!("{path}{new_ext}"),
    }
}

/// One `target: deps...` group of a depfile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepFileTarget {
    pub name: String,
    pub deps: Vec<String>,
}

/// A whole depfile, parsed or about to be written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DepFile {
    pub targets: Vec<DepFileTarget>,
}

impl DepFile {
    pub fn find_deps_of(&self, target_name: &str) -> Option<&[String]> {
        self.targets.iter().find(|t| t.name == target_name).map(|t| t.deps.as_slice())
    }

    pub fn write_to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        for target in &self.targets {
            if !out.is_empty() {
                out.push('\n');
            }
            // target names are pre-escaped by the writer of the flags
            out.push_str(&target.name);
            out.push(':');
            for (i, dep) in target.deps.iter().enumerate() {
                if i == 0 {
                    out.push(' ');
                } else {
                    out.push_str(" \\\n  ");
                }
                out.push_str(&escape_make_spaces(dep));
            }
            out.push('\n');
        }
        out.into_bytes()
    }

    pub fn write_to_file(&self, path: &Path) -> std::io::Result<()> {
        fs::write(path, self.write_to_bytes())
    }

    /// Parse depfile text (used by tests and tooling; the daemon itself
    /// only writes).
    pub fn parse(contents: &str) -> Result<DepFile, String> {
        let mut dep_file = DepFile::default();
        let mut offset = 0;
        let bytes = contents.as_bytes();

        while offset < bytes.len() {
            while offset < bytes.len() && (bytes[offset] as char).is_whitespace() {
                offset += 1;
            }
            if offset >= bytes.len() {
                break;
            }
            let (name, next) = parse_target_name(contents, offset)?;
            offset = next;
            let mut deps = Vec::new();
            loop {
                let (dep, next) = parse_dep_item(contents, offset);
                offset = next;
                match dep {
                    Some(d) => deps.push(d),
                    None => break,
                }
            }
            dep_file.targets.push(DepFileTarget { name, deps });
        }
        Ok(dep_file)
    }
}

fn parse_target_name(c: &str, start: usize) -> Result<(String, usize), String> {
    let bytes = c.as_bytes();
    let mut name = String::new();
    let mut offset = start;
    while offset < bytes.len() {
        match bytes[offset] {
            b':' => return Ok((escape_make_spaces(&name), offset + 1)),
            b'\n' => break,
            b'\\' => {
                if offset + 1 < bytes.len() && bytes[offset + 1] != b'\n' {
                    name.push(bytes[offset + 1] as char);
                }
                offset += 2;
            }
            b' ' => {
                if !name.ends_with(' ') {
                    name.push(' ');
                }
                offset += 1;
            }
            byte => {
                name.push(byte as char);
                offset += 1;
            }
        }
    }
    Err(format!("':' expected after {:?}", &c[start..offset.min(c.len())]))
}

fn parse_dep_item(c: &str, start: usize) -> (Option<String>, usize) {
    let bytes = c.as_bytes();
    let mut offset = start;
    while offset < bytes.len() {
        match bytes[offset] {
            b' ' => offset += 1,
            b'\\' => offset += 2,
            _ => break,
        }
    }
    if offset >= bytes.len() {
        return (None, offset);
    }
    if bytes[offset] == b'\n' {
        return (None, offset + 1);
    }

    let mut item = String::new();
    while offset < bytes.len() {
        match bytes[offset] {
            b' ' | b'\n' => break,
            b'\\' => {
                if offset + 1 < bytes.len() {
                    item.push(bytes[offset + 1] as char);
                }
                offset += 2;
            }
            byte => {
                item.push(byte as char);
                offset += 1;
            }
        }
    }
    (Some(item), offset)
}

/// Escape characters special to Make in a target name: spaces and tabs
/// get backslashes (together with any backslashes right before them),
/// `$` doubles, `#` is escaped.
pub fn quote_make_target(name: &str) -> String {
    let bytes = name.as_bytes();
    let mut escaped = String::with_capacity(name.len());
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b' ' | b'\t' => {
                let mut j = i;
                while j > 0 && bytes[j - 1] == b'\\' {
                    escaped.push('\\');
                    j -= 1;
                }
                escaped.push('\\');
            }
            b'$' => escaped.push('$'),
            b'#' => escaped.push('\\'),
            _ => {}
        }
        escaped.push(b as char);
    }
    escaped
}

/// Escape a dependency item: spaces, colons and newlines get backslashes.
pub fn escape_make_spaces(item: &str) -> String {
    item.replace('\n', "\\\n").replace(' ', "\\ ").replace(':', "\\:")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcc_protocol::digest::Digest256;

    fn dep(path: &str) -> DepRecord {
        DepRecord { path: path.to_string(), size: 1, digest: Digest256::of_bytes(path.as_bytes()) }
    }

    #[test]
    fn write_layout_matches_make_format() {
        let dep_file = DepFile {
            targets: vec![DepFileTarget {
                name: "foo.cpp.o".into(),
                deps: vec!["foo.cpp".into(), "foo.h".into(), "bar.h".into()],
            }],
        };
        let text = String::from_utf8(dep_file.write_to_bytes()).unwrap();
        assert_eq!(text, "foo.cpp.o: foo.cpp \\\n  foo.h \\\n  bar.h\n");
    }

    #[test]
    fn parse_write_is_a_fixed_point() {
        let text = "a.o: a.cpp \\\n  dir/a.h \\\n  with\\ space.h\n\ndir/a.h:\n";
        let parsed = DepFile::parse(text).unwrap();
        assert_eq!(parsed.targets.len(), 2);
        assert_eq!(parsed.targets[0].deps, vec!["a.cpp", "dir/a.h", "with space.h"]);

        let rewritten = String::from_utf8(parsed.write_to_bytes()).unwrap();
        let reparsed = DepFile::parse(&rewritten).unwrap();
        assert_eq!(parsed, reparsed);
    }

    #[test]
    fn quoting_rules() {
        assert_eq!(quote_make_target("a b.o"), "a\\ b.o");
        assert_eq!(quote_make_target("a$b"), "a$$b");
        assert_eq!(quote_make_target("a#b"), "a\\#b");
        assert_eq!(escape_make_spaces("a b:c"), "a\\ b\\:c");
    }

    #[test]
    fn mp_emits_phony_targets() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("foo.cpp.o");

        let mut flags = DepFlags::default();
        flags.set_md();
        flags.set_mp();
        flags.set_orig_input("foo.cpp");
        flags.set_orig_output("foo.cpp.o");

        let deps = vec![dep("/proj/foo.h"), dep("/proj/bar.h")];
        let written = flags
            .generate_and_save(out.to_str().unwrap(), &IncludeDirs::default(), &deps)
            .unwrap();
        assert_eq!(written, format!("{}/foo.cpp.d", dir.path().display()));

        let parsed = DepFile::parse(&fs::read_to_string(&written).unwrap()).unwrap();
        assert_eq!(parsed.targets[0].name, "foo.cpp.o");
        assert_eq!(
            parsed.targets[0].deps,
            vec!["foo.cpp", "/proj/foo.h", "/proj/bar.h"]
        );
        // phony targets for everything but the input
        assert_eq!(parsed.targets.len(), 3);
        assert_eq!(parsed.targets[1].name, "/proj/foo.h");
        assert!(parsed.targets[1].deps.is_empty());
    }

    #[test]
    fn mmd_filters_system_headers() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("foo.o");

        let mut flags = DepFlags::default();
        flags.set_md();
        flags.set_mmd();
        flags.set_mf(out.with_extension("o.d").to_str().unwrap().to_string());
        flags.set_orig_input("foo.cpp");
        flags.set_orig_output("foo.o");

        let system_dirs = IncludeDirs {
            dirs_isystem: vec!["/usr/include".into()],
            ..Default::default()
        };
        let deps = vec![dep("/proj/foo.h"), dep("/usr/include/vector")];
        let written =
            flags.generate_and_save(out.to_str().unwrap(), &system_dirs, &deps).unwrap();

        let parsed = DepFile::parse(&fs::read_to_string(written).unwrap()).unwrap();
        assert_eq!(parsed.targets[0].deps, vec!["foo.cpp", "/proj/foo.h"]);
    }

    #[test]
    fn mt_and_mq_accumulate() {
        let mut flags = DepFlags::default();
        flags.set_mt("first.o");
        flags.set_mq("with space.o");
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("x.o");
        flags.set_mf(out.with_extension("o.d").to_str().unwrap().to_string());
        flags.set_md();
        flags.set_orig_input("x.cpp");

        let written = flags
            .generate_and_save(out.to_str().unwrap(), &IncludeDirs::default(), &[])
            .unwrap();
        let text = fs::read_to_string(written).unwrap();
        assert!(text.starts_with("first.o \\\n with\\ space.o: x.cpp\n"));
    }

    #[test]
    fn replace_ext_variants() {
        assert_eq!(replace_file_ext("a/b.o", ".d"), "a/b.d");
        assert_eq!(replace_file_ext("a.tar.gz", ".d"), "a.tar.d");
        assert_eq!(replace_file_ext("noext", ".d"), "noext.d");
        assert_eq!(replace_file_ext("dir.v2/noext", ".d"), "dir.v2/noext.d");
    }
}
