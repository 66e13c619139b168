//! Network forwarding subsystem.
//!
//! A per-machine helper process provides user-mode networking, forwards the
//! SSH port and bridges a host API socket to the guest's engine socket. The
//! WSL backend additionally shares one network process between machines
//! (see [`shared`]).

pub mod forwarder;
pub mod pidfile;
pub mod shared;

pub use forwarder::{ForwardingMode, ForwardingState, HelperCommand, HelperLaunch};
pub use pidfile::PidRecord;
pub use shared::SharedNetwork;

use crate::alloc;
use crate::cleanup::remove_if_exists;
use crate::config::MachinaConfig;
use crate::error::{Error, Result};
use crate::machine::MachineDescriptor;
use crate::paths::MachineDirs;

/// Launch the network helper for `desc` and wait until its API socket exists.
///
/// `cmd` already carries the backend's VM-side endpoint.
pub fn start_forwarding(
    desc: &MachineDescriptor,
    dirs: &MachineDirs,
    config: &MachinaConfig,
    mut cmd: HelperCommand,
) -> Result<ForwardingState> {
    let pid_file = dirs.forwarder_pid_file(&desc.name);
    // A helper left behind by a crashed stop would hold the sockets.
    forwarder::stop_helper(&pid_file, config.timeouts.helper_stop)?;

    let socket = dirs.api_socket(&desc.name);
    if !alloc::claim_socket_path(&socket)? {
        return Err(Error::forwarding(format!(
            "api socket {} is in use by another process",
            socket.display()
        )));
    }
    alloc::claim_socket_path(&dirs.network_socket(&desc.name))?;

    let alias = config.network.default_socket_alias.as_deref();
    let planned = forwarder::plan_alias(alias);

    let user = if desc.host_user.rootful {
        "root"
    } else {
        desc.ssh.remote_username.as_str()
    };
    cmd.add_ssh_port(desc.ssh.port).add_forward(
        &socket,
        &desc.guest_api_socket(),
        user,
        &desc.ssh.identity_path,
    );

    let launch = HelperLaunch {
        command: cmd,
        pid_file: pid_file.clone(),
        log_file: dirs.forwarder_log(&desc.name),
        wait_for: Some(socket.clone()),
        attempts: config.timeouts.socket_poll_attempts,
        interval: config.timeouts.socket_poll_interval,
    };
    let pid = forwarder::spawn_helper(&launch)?;

    let (mode, alias) = match (planned, alias) {
        (ForwardingMode::SystemDefault, Some(alias)) => {
            let mode = forwarder::link_alias(&socket, alias);
            let linked = (mode == ForwardingMode::SystemDefault).then(|| alias.to_path_buf());
            (mode, linked)
        }
        _ => (ForwardingMode::MachineLocal, None),
    };

    tracing::info!(
        machine = %desc.name,
        pid,
        socket = %socket.display(),
        mode = %mode,
        "api forwarding ready"
    );

    Ok(ForwardingState {
        pid: Some(pid),
        pid_file,
        socket: Some(socket),
        alias,
        mode,
    })
}

/// Stop the network helper for `desc` and remove its sockets and alias.
pub fn stop_forwarding(
    desc: &MachineDescriptor,
    dirs: &MachineDirs,
    config: &MachinaConfig,
) -> Result<()> {
    forwarder::stop_helper(
        &dirs.forwarder_pid_file(&desc.name),
        config.timeouts.helper_stop,
    )?;

    let socket = dirs.api_socket(&desc.name);
    if let Some(alias) = config.network.default_socket_alias.as_deref() {
        forwarder::unlink_alias(&socket, alias)?;
    }
    remove_if_exists(&socket)?;
    remove_if_exists(&dirs.network_socket(&desc.name))?;
    tracing::debug!(machine = %desc.name, "api forwarding stopped");
    Ok(())
}
