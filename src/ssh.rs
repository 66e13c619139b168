//! Commands run in the guest over the forwarded SSH port.

use crate::error::Result;
use crate::machine::MachineDescriptor;
use crate::process;
use std::path::Path;
use std::process::Command;

/// Options shared by every guest SSH call. Host keys change on every fresh
/// image, and a password prompt must fail instead of hanging.
const SSH_OPTS: &[&str] = &[
    "-o", "StrictHostKeyChecking=no",
    "-o", "UserKnownHostsFile=/dev/null",
    "-o", "LogLevel=ERROR",
    "-o", "BatchMode=yes",
    "-o", "ConnectTimeout=5",
];

/// `ssh` invocation running `script` as the machine's remote user.
pub fn command(binary: &Path, desc: &MachineDescriptor, script: &str) -> Command {
    let mut cmd = Command::new(binary);
    cmd.arg("-i")
        .arg(&desc.ssh.identity_path)
        .arg("-p")
        .arg(desc.ssh.port.to_string())
        .args(SSH_OPTS)
        .arg(format!("{}@localhost", desc.ssh.remote_username))
        .arg(script);
    cmd
}

/// Run `script` in the guest, failing on a non-zero exit.
pub fn run(binary: &Path, desc: &MachineDescriptor, script: &str) -> Result<()> {
    process::run_checked("ssh", &mut command(binary, desc, script))?;
    Ok(())
}
