//! Process management utilities.
//!
//! Helpers and hypervisor processes are usually not children of the process
//! stopping them (a later CLI invocation does the stop), so liveness is
//! checked with `kill(pid, 0)` and children are reaped opportunistically.

use crate::error::{Error, Result};
use crate::retry::Backoff;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::time::Duration;

/// Default grace period between SIGTERM and SIGKILL.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Check if a process is alive.
///
/// Returns true if the process exists and is running.
pub fn is_alive(pid: libc::pid_t) -> bool {
    if pid <= 0 {
        return false;
    }
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Non-blocking exit check.
///
/// Reaps the process if it is our child. For processes that are not our
/// children this falls back to a liveness probe.
pub fn has_exited(pid: libc::pid_t) -> bool {
    let mut status: libc::c_int = 0;
    let result = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };

    if result == pid {
        true
    } else if result == 0 {
        false
    } else {
        // ECHILD: not our child
        !is_alive(pid)
    }
}

/// Send SIGTERM to a process.
///
/// Returns true if the signal was sent successfully.
pub fn terminate(pid: libc::pid_t) -> bool {
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

/// Send SIGKILL to a process.
///
/// Returns true if the signal was sent successfully.
pub fn kill(pid: libc::pid_t) -> bool {
    unsafe { libc::kill(pid, libc::SIGKILL) == 0 }
}

/// Gracefully stop a process.
///
/// 1. Sends SIGTERM
/// 2. Polls with exponential backoff for up to roughly `timeout`
/// 3. Sends SIGKILL if it is still alive
pub fn stop_process(pid: libc::pid_t, timeout: Duration) -> Result<()> {
    if has_exited(pid) {
        return Ok(());
    }

    if !terminate(pid) {
        return Ok(());
    }

    let poll = Backoff::within(timeout);
    let exited = poll.retry("wait for process exit", || {
        if has_exited(pid) {
            Ok(())
        } else {
            Err(Error::forwarding(format!("process {} still running", pid)))
        }
    });

    if exited.is_err() {
        tracing::debug!(pid, "SIGTERM timeout, sending SIGKILL");
        kill(pid);
        let reaped = Backoff::within(Duration::from_secs(2)).retry("wait for SIGKILL", || {
            if has_exited(pid) {
                Ok(())
            } else {
                Err(Error::forwarding(format!("process {} survived SIGKILL", pid)))
            }
        });
        reaped?;
    }

    Ok(())
}

/// Run a command to completion, failing on a non-zero exit.
///
/// `label` names the tool in error messages.
pub fn run_checked(label: &str, cmd: &mut Command) -> Result<Output> {
    tracing::debug!(command = ?cmd, "running");
    let output = cmd
        .output()
        .map_err(|e| Error::command_failed(label, format!("failed to execute: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        return Err(Error::command_failed(
            label,
            format!("{}: {}", output.status, detail),
        ));
    }

    Ok(output)
}

/// Like [`run_checked`], feeding `input` to the command's stdin.
pub fn run_with_input(label: &str, cmd: &mut Command, input: &[u8]) -> Result<Output> {
    tracing::debug!(command = ?cmd, "running with input");
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::command_failed(label, format!("failed to execute: {}", e)))?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input)?;
    }
    let output = child.wait_with_output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::command_failed(
            label,
            format!("{}: {}", output.status, stderr.trim()),
        ));
    }
    Ok(output)
}

/// Spawn `cmd` in its own process group with stdout and stderr appended to `log`.
///
/// The child survives the invoking CLI process; later invocations find it
/// through a PID record or the backend's control endpoint.
pub fn spawn_detached(label: &str, cmd: &mut Command, log: &Path) -> Result<libc::pid_t> {
    if let Some(parent) = log.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let out = OpenOptions::new().create(true).append(true).open(log)?;
    let err = out.try_clone()?;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err))
        .process_group(0);

    tracing::debug!(command = ?cmd, "spawning");
    let child = cmd
        .spawn()
        .map_err(|e| Error::command_failed(label, format!("failed to spawn: {}", e)))?;
    Ok(child.id() as libc::pid_t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_alive_self() {
        let pid = unsafe { libc::getpid() };
        assert!(is_alive(pid));
    }

    #[test]
    fn test_is_alive_nonexistent() {
        // Use a very high PID that's unlikely to exist
        assert!(!is_alive(999999));
        assert!(!is_alive(0), "pid 0 would signal our process group");
    }

    #[test]
    fn test_stop_process_terminates_child() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id() as libc::pid_t;
        assert!(!has_exited(pid));

        stop_process(pid, Duration::from_secs(2)).unwrap();
        assert!(!is_alive(pid), "child should be reaped");
    }

    #[test]
    fn test_stop_process_kills_sigterm_ignorer() {
        let child = Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .spawn()
            .unwrap();
        let pid = child.id() as libc::pid_t;
        // Let the shell install its trap.
        std::thread::sleep(Duration::from_millis(200));

        stop_process(pid, Duration::from_millis(300)).unwrap();
        assert!(!is_alive(pid));
    }

    #[test]
    fn test_run_checked_reports_stderr() {
        let err = run_checked("sh", Command::new("sh").args(["-c", "echo boom >&2; exit 3"]))
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("boom"), "{}", msg);
        assert!(msg.contains("sh"), "{}", msg);
    }

    #[test]
    fn test_run_checked_missing_binary() {
        let err = run_checked("nope", &mut Command::new("/nonexistent/bin/nope")).unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
    }

    #[test]
    fn test_run_with_input_pipes_stdin() {
        let out = run_with_input("sh", Command::new("sh").args(["-c", "tr a-z A-Z"]), b"key\n")
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&out.stdout), "KEY\n");

        let err = run_with_input("sh", Command::new("sh").args(["-c", "cat >/dev/null; exit 2"]), b"x")
            .unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
    }

    #[test]
    fn test_spawn_detached_logs_output() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("logs/child.log");
        let pid = spawn_detached(
            "sh",
            Command::new("sh").args(["-c", "echo hello; echo oops >&2"]),
            &log,
        )
        .unwrap();

        Backoff::within(Duration::from_secs(2))
            .retry("child exit", || {
                if has_exited(pid) {
                    Ok(())
                } else {
                    Err(Error::forwarding("still running"))
                }
            })
            .unwrap();
        let text = std::fs::read_to_string(&log).unwrap();
        assert!(text.contains("hello") && text.contains("oops"), "{}", text);
    }
}
