//! Local compiler execution — the universal fallback.
//!
//! Anything that cannot (or should not) run remotely lands here: linking,
//! unsupported options, unavailable workers, mid-flight remote failures.
//! Callers must hold a permit from the daemon's local-compile semaphore;
//! without that throttle, a broken network would turn tens of thousands
//! of queued wrapper processes into tens of thousands of local compilers.

use std::path::Path;
use std::process::Command;

use crate::invocation::InvocationResult;

/// Run the original command line unchanged, in the invocation's cwd.
pub fn run_local_compiler(cwd: &Path, cmd_line: &[String]) -> InvocationResult {
    let started = std::time::Instant::now();
    let output = Command::new(&cmd_line[0]).args(&cmd_line[1..]).current_dir(cwd).output();
    let duration_ms = started.elapsed().as_millis() as u32;

    match output {
        Ok(out) => InvocationResult {
            exit_code: out.status.code().unwrap_or(-1),
            stdout: out.stdout,
            stderr: out.stderr,
            duration_ms,
        },
        Err(e) => InvocationResult {
            exit_code: -1,
            stdout: Vec::new(),
            stderr: format!("{}: {}\n", cmd_line[0], e).into_bytes(),
            duration_ms,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_exit_code_and_streams() {
        let dir = tempfile::tempdir().unwrap();
        let cmd: Vec<String> = ["sh", "-c", "pwd; echo oops >&2; exit 4"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let result = run_local_compiler(dir.path(), &cmd);
        assert_eq!(result.exit_code, 4);
        // ran in the requested cwd
        let cwd_printed = String::from_utf8_lossy(&result.stdout);
        assert!(cwd_printed.trim_end().ends_with(dir.path().file_name().unwrap().to_str().unwrap()));
        assert_eq!(result.stderr, b"oops\n");
    }

    #[test]
    fn missing_binary_reports_an_error_exit() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = vec!["definitely-not-a-compiler-xyz".to_string()];
        let result = run_local_compiler(dir.path(), &cmd);
        assert_eq!(result.exit_code, -1);
        assert!(!result.stderr.is_empty());
    }
}
