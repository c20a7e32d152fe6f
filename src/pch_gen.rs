//! Client-side precompiled-header generation.
//!
//! A `compile-pch` invocation does not produce a real `.gch`/`.pch` —
//! it produces the portable container instead: the resolver collects the
//! header's full dependency closure, and everything gets packed with the
//! compiler invocation into a `.rcc-pch` next to where the real output
//! would have been. Workers compile it into a real pch on first demand;
//! if remote compilation later falls back locally, the local compile
//! simply runs without a precompiled header.

use std::path::{Path, PathBuf};

use rcc_protocol::pch::{OwnPch, PchError};
use thiserror::Error;

use crate::classify::ParsedInvocation;
use crate::depfile::replace_file_ext;
use crate::resolver::cache::IncludesCache;
use crate::resolver::{collect_dependencies, ResolveError};

#[derive(Debug, Error)]
pub enum PchGenError {
    #[error("failed to collect pch dependencies: {0}")]
    Resolve(#[from] ResolveError),

    #[error("failed to write the pch container: {0}")]
    Write(#[from] PchError),
}

/// Build (but do not yet save) the container for a pch invocation.
pub fn generate_own_pch(
    parsed: &ParsedInvocation,
    cwd: &Path,
    includes_cache: &IncludesCache,
) -> Result<OwnPch, PchGenError> {
    let input_abs = parsed.input_abs(cwd);
    let output_abs = parsed.output_abs(cwd);

    let mut include_dir_args = parsed.include_dirs.as_args();
    include_dir_args.extend(includes_cache.default_dirs.as_args());

    let mut own_pch = OwnPch {
        own_pch_path: PathBuf::from(replace_file_ext(&output_abs, ".rcc-pch")),
        orig_header: input_abs.clone(),
        orig_pch: output_abs,
        compiler_name: parsed.compiler_name.clone(),
        compiler_args: parsed.args.clone(),
        include_dir_args,
        ..Default::default()
    };

    // resolve with the same merged dirs a regular compile would use;
    // pch substitution is off — this is the pch being made
    let mut merged = parsed.include_dirs.clone();
    merged.merge(&includes_cache.default_dirs);
    let (input_record, deps) =
        collect_dependencies(includes_cache, &input_abs, &merged, false)?;

    own_pch.add_dep(input_record.path, input_record.size, input_record.digest);
    for dep in deps {
        own_pch.add_dep(dep.path, dep.size, dep.digest);
    }
    own_pch.compute_fingerprint();
    Ok(own_pch)
}
