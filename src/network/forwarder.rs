//! Network helper and API forwarding process supervision.

use super::pidfile::PidRecord;
use crate::alloc::{self, SocketStatus};
use crate::error::Result;
use crate::process;
use crate::sockets;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

/// Whether the machine's API socket also claimed the system-wide alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardingMode {
    /// No API forwarding.
    None,
    /// Only the machine-specific path.
    MachineLocal,
    /// Machine-specific path plus the default alias.
    SystemDefault,
}

impl ForwardingMode {
    /// Get the mode name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            ForwardingMode::None => "none",
            ForwardingMode::MachineLocal => "machine-local",
            ForwardingMode::SystemDefault => "system-default",
        }
    }
}

impl std::fmt::Display for ForwardingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Live forwarding for one machine. Only valid for the current process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingState {
    /// Helper process id.
    pub pid: Option<i32>,
    /// Where the PID record lives.
    pub pid_file: PathBuf,
    /// Machine-specific API socket or pipe.
    pub socket: Option<PathBuf>,
    /// Default alias pointing at `socket`, if claimed.
    pub alias: Option<PathBuf>,
    /// Forwarding mode.
    pub mode: ForwardingMode,
}

impl ForwardingState {
    /// State for a machine without API forwarding.
    pub fn none(pid_file: PathBuf) -> Self {
        Self {
            pid: None,
            pid_file,
            socket: None,
            alias: None,
            mode: ForwardingMode::None,
        }
    }
}

/// Command line for the user-mode network helper.
///
/// Backends add their VM-side endpoint; the orchestrator adds SSH and API
/// forwarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperCommand {
    binary: PathBuf,
    args: Vec<OsString>,
}

impl HelperCommand {
    /// Start a command line for `binary`.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
        }
    }

    fn push(&mut self, flag: &str, value: impl Into<OsString>) -> &mut Self {
        self.args.push(flag.into());
        self.args.push(value.into());
        self
    }

    /// Positional argument.
    pub fn arg(&mut self, value: impl Into<OsString>) -> &mut Self {
        self.args.push(value.into());
        self
    }

    /// Generic control endpoint, e.g. `unix:///run/gvproxy.sock`.
    pub fn add_endpoint(&mut self, uri: impl Into<OsString>) -> &mut Self {
        self.push("-listen", uri)
    }

    /// vfkit datagram socket.
    pub fn add_vfkit_socket(&mut self, uri: impl Into<OsString>) -> &mut Self {
        self.push("-listen-vfkit", uri)
    }

    /// QEMU stream socket.
    pub fn add_qemu_socket(&mut self, uri: impl Into<OsString>) -> &mut Self {
        self.push("-listen-qemu", uri)
    }

    /// Host port forwarded to the guest's sshd.
    pub fn add_ssh_port(&mut self, port: u16) -> &mut Self {
        self.push("-ssh-port", port.to_string())
    }

    /// Forward a host socket to a guest socket over SSH.
    pub fn add_forward(
        &mut self,
        source: &Path,
        dest: &str,
        user: &str,
        identity: &Path,
    ) -> &mut Self {
        self.push("-forward-sock", source.as_os_str())
            .push("-forward-dest", dest)
            .push("-forward-user", user)
            .push("-forward-identity", identity.as_os_str())
    }

    /// Helper's own log file.
    pub fn set_log_file(&mut self, path: &Path) -> &mut Self {
        self.push("-log-file", path.as_os_str())
    }

    /// Raw arguments.
    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Helper binary.
    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

/// How to launch and supervise a helper.
#[derive(Debug, Clone)]
pub struct HelperLaunch {
    /// Binary and arguments.
    pub command: HelperCommand,
    /// PID record to write.
    pub pid_file: PathBuf,
    /// Receives the helper's stdout and stderr.
    pub log_file: PathBuf,
    /// Path that must appear before the helper counts as up.
    pub wait_for: Option<PathBuf>,
    /// Socket poll attempts.
    pub attempts: u32,
    /// Linear poll step.
    pub interval: Duration,
}

/// Spawn a helper detached in its own process group and wait for its socket.
///
/// On any failure after the spawn the helper is stopped and its PID record
/// removed.
pub fn spawn_helper(launch: &HelperLaunch) -> Result<i32> {
    let mut cmd = Command::new(launch.command.binary());
    cmd.args(launch.command.args());
    let label = launch.command.binary().display().to_string();
    let pid = process::spawn_detached(&label, &mut cmd, &launch.log_file)?;

    let outcome = PidRecord::new(pid).write(&launch.pid_file).and_then(|()| {
        match &launch.wait_for {
            Some(path) => sockets::wait_for_path(path, launch.attempts, launch.interval, || {
                !process::has_exited(pid)
            }),
            None => Ok(()),
        }
    });

    if let Err(e) = outcome {
        tracing::warn!(pid, error = %e, log = %launch.log_file.display(), "helper failed to come up");
        let _ = process::stop_process(pid, Duration::from_secs(2));
        let _ = crate::cleanup::remove_if_exists(&launch.pid_file);
        return Err(e);
    }

    tracing::info!(pid, binary = %launch.command.binary().display(), "helper started");
    Ok(pid)
}

/// Stop the helper named by a PID record and remove the record.
///
/// Missing records and already-dead processes are not errors.
pub fn stop_helper(pid_file: &Path, timeout: Duration) -> Result<()> {
    if let Some(record) = PidRecord::read(pid_file)? {
        if process::is_alive(record.pid) {
            if let Some(tid) = record.tid {
                tracing::debug!(pid = record.pid, tid, "stopping helper by process id");
            }
            process::stop_process(record.pid, timeout)?;
            tracing::info!(pid = record.pid, "helper stopped");
        }
    }
    crate::cleanup::remove_if_exists(pid_file)
}

/// Decide whether `alias` can be claimed for this machine.
///
/// A stale alias left by a crashed helper is removed and claimed.
pub fn plan_alias(alias: Option<&Path>) -> ForwardingMode {
    let Some(alias) = alias else {
        return ForwardingMode::MachineLocal;
    };
    match alloc::probe_socket(alias) {
        SocketStatus::Free => ForwardingMode::SystemDefault,
        SocketStatus::Stale => match crate::cleanup::remove_if_exists(alias) {
            Ok(()) => ForwardingMode::SystemDefault,
            Err(e) => {
                tracing::debug!(alias = %alias.display(), error = %e, "cannot reclaim stale alias");
                ForwardingMode::MachineLocal
            }
        },
        SocketStatus::InUse => ForwardingMode::MachineLocal,
    }
}

/// Point `alias` at `socket`. Falls back to machine-local on failure.
pub fn link_alias(socket: &Path, alias: &Path) -> ForwardingMode {
    match std::os::unix::fs::symlink(socket, alias) {
        Ok(()) => {
            tracing::info!(alias = %alias.display(), socket = %socket.display(), "claimed default api socket");
            ForwardingMode::SystemDefault
        }
        Err(e) => {
            tracing::warn!(alias = %alias.display(), error = %e, "could not claim default api socket");
            ForwardingMode::MachineLocal
        }
    }
}

/// Remove `alias` only if it is our symlink to `socket`.
pub fn unlink_alias(socket: &Path, alias: &Path) -> Result<()> {
    match std::fs::read_link(alias) {
        Ok(target) if target == socket => crate::cleanup::remove_if_exists(alias),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::testing::fake_helper;
    use std::os::unix::net::UnixListener;

    fn launch(dir: &Path, binary: &Path, socket: &Path) -> HelperLaunch {
        let mut command = HelperCommand::new(binary);
        command.add_ssh_port(2222).add_forward(
            socket,
            "/run/podman/podman.sock",
            "core",
            &dir.join("id"),
        );
        HelperLaunch {
            command,
            pid_file: dir.join("helper.pid"),
            log_file: dir.join("helper.log"),
            wait_for: Some(socket.to_path_buf()),
            attempts: 10,
            interval: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_helper_command_args() {
        let mut cmd = HelperCommand::new("gvproxy");
        cmd.add_vfkit_socket("unixgram:///run/v.sock")
            .add_ssh_port(40022)
            .add_forward(
                Path::new("/run/api.sock"),
                "/run/podman/podman.sock",
                "core",
                Path::new("/k/id"),
            );
        let args: Vec<String> = cmd
            .args()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            [
                "-listen-vfkit",
                "unixgram:///run/v.sock",
                "-ssh-port",
                "40022",
                "-forward-sock",
                "/run/api.sock",
                "-forward-dest",
                "/run/podman/podman.sock",
                "-forward-user",
                "core",
                "-forward-identity",
                "/k/id",
            ]
        );
    }

    #[test]
    fn test_spawn_and_stop_helper() {
        let tmp = tempfile::tempdir().unwrap();
        let helper = fake_helper(tmp.path());
        let socket = tmp.path().join("api.sock");
        let launch = launch(tmp.path(), &helper, &socket);

        let pid = spawn_helper(&launch).unwrap();
        assert!(socket.exists());
        assert_eq!(PidRecord::read(&launch.pid_file).unwrap(), Some(PidRecord::new(pid)));

        stop_helper(&launch.pid_file, Duration::from_secs(2)).unwrap();
        assert!(!process::is_alive(pid));
        assert!(!launch.pid_file.exists());
    }

    #[test]
    fn test_spawn_fails_fast_when_helper_exits() {
        let tmp = tempfile::tempdir().unwrap();
        let socket = tmp.path().join("api.sock");
        let mut launch = launch(tmp.path(), Path::new("/bin/false"), &socket);
        launch.interval = Duration::from_millis(200);

        let err = spawn_helper(&launch).unwrap_err();
        assert!(matches!(err, Error::Forwarding(_)), "got {:?}", err);
        assert!(!launch.pid_file.exists(), "pid record is removed on failure");
    }

    #[test]
    fn test_spawn_missing_binary() {
        let tmp = tempfile::tempdir().unwrap();
        let socket = tmp.path().join("api.sock");
        let launch = launch(tmp.path(), Path::new("/nonexistent/gvproxy"), &socket);
        assert!(matches!(
            spawn_helper(&launch).unwrap_err(),
            Error::CommandFailed { .. }
        ));
    }

    #[test]
    fn test_stop_helper_without_record() {
        let tmp = tempfile::tempdir().unwrap();
        stop_helper(&tmp.path().join("none.pid"), Duration::from_millis(10)).unwrap();
    }

    #[test]
    fn test_plan_alias() {
        let tmp = tempfile::tempdir().unwrap();
        let alias = tmp.path().join("default.sock");

        assert_eq!(plan_alias(None), ForwardingMode::MachineLocal);
        assert_eq!(plan_alias(Some(&alias)), ForwardingMode::SystemDefault);

        let live = UnixListener::bind(&alias).unwrap();
        assert_eq!(plan_alias(Some(&alias)), ForwardingMode::MachineLocal);

        drop(live);
        assert_eq!(plan_alias(Some(&alias)), ForwardingMode::SystemDefault);
        assert!(!alias.exists(), "stale alias is reclaimed");
    }

    #[test]
    fn test_unlink_alias_only_removes_our_link() {
        let tmp = tempfile::tempdir().unwrap();
        let ours = tmp.path().join("dev1-api.sock");
        let theirs = tmp.path().join("dev2-api.sock");
        let alias = tmp.path().join("default.sock");

        assert_eq!(link_alias(&theirs, &alias), ForwardingMode::SystemDefault);
        unlink_alias(&ours, &alias).unwrap();
        assert!(std::fs::symlink_metadata(&alias).is_ok(), "foreign alias kept");

        unlink_alias(&theirs, &alias).unwrap();
        assert!(std::fs::symlink_metadata(&alias).is_err());
    }
}
