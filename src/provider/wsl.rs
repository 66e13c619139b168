//! WSL backend: each machine is a WSL 2 distribution driven through `wsl.exe`.
//!
//! Resources are global to the WSL utility VM, so cpus, memory and disk size
//! cannot be changed per machine. User-mode networking is provided by one
//! shared distribution, reference counted with marker files.

use super::{require_stopped, Hook, InitOptions, Provider, SetOptions, StartHooks};
use crate::alloc;
use crate::cleanup::CleanupCallbacks;
use crate::config::MachinaConfig;
use crate::error::{Error, Result};
use crate::machine::{public_key_path, MachineDescriptor, ProviderConfig, VmState, VmType, WslConfig};
use crate::network::{forwarder, HelperCommand, HelperLaunch, SharedNetwork};
use crate::paths::MachineDirs;
use crate::process;
use crate::retry::Backoff;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

/// Distribution hosting the shared user-mode network.
pub const USERMODE_DISTRIBUTION: &str = "machina-net-usermode";

const BOOTSTRAP: &str = "/root/bootstrap";
const USERMODE_FORWARDER: &str = "/usr/local/bin/gvforwarder";
const DEFAULT_PIPE: &str = "docker_engine";
/// Written by win-sshproxy into its state directory once its pipes listen.
const PROXY_READY_FILE: &str = "win-sshproxy.tid";

/// Kernel update retry: five tries starting at 500ms.
const KERNEL_UPDATE: Backoff = Backoff::new(5, Duration::from_millis(500));

/// Decode `wsl.exe` output, which is UTF-16LE on Windows.
///
/// Output without interleaved NULs is taken as UTF-8.
pub(crate) fn decode_output(raw: &[u8]) -> String {
    let body = raw.strip_prefix(&[0xff, 0xfe]).unwrap_or(raw);
    let utf16 = body.len() >= 2 && body.chunks(2).any(|pair| pair.len() == 2 && pair[1] == 0);
    if !utf16 {
        return String::from_utf8_lossy(body).into_owned();
    }
    let units: Vec<u16> = body
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Distribution names from `wsl -l --quiet`; first field of each line.
pub(crate) fn parse_distributions(listing: &str) -> BTreeSet<String> {
    listing
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(|name| name.trim_matches('\0').to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Shell snippet appending a key read from stdin to `home`'s authorized keys.
fn authorized_keys_script(home: &str, owner: Option<&str>) -> String {
    let mut script = format!(
        "mkdir -p {home}/.ssh; cat >> {home}/.ssh/authorized_keys; chmod 600 {home}/.ssh/authorized_keys",
        home = home
    );
    if let Some(user) = owner {
        script.push_str(&format!("; chown -R {user}:{user} {home}/.ssh", user = user, home = home));
    }
    script
}

/// `wsl.exe` invoker.
#[derive(Debug, Clone)]
struct Wsl {
    binary: PathBuf,
}

impl Wsl {
    fn command(&self) -> Command {
        Command::new(&self.binary)
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = process::run_checked("wsl", self.command().args(args))?;
        Ok(decode_output(&output.stdout))
    }

    fn distributions(&self, running: bool) -> Result<BTreeSet<String>> {
        let mut args = vec!["-l", "--quiet"];
        if running {
            args.push("--running");
        }
        Ok(parse_distributions(&self.run(&args)?))
    }

    fn is_registered(&self, dist: &str) -> Result<bool> {
        Ok(self.distributions(false)?.contains(dist))
    }

    fn is_running(&self, dist: &str) -> Result<bool> {
        Ok(self.distributions(true)?.contains(dist))
    }

    fn import(&self, dist: &str, install_dir: &Path, image: &Path) -> Result<()> {
        std::fs::create_dir_all(install_dir)?;
        process::run_checked(
            "wsl",
            self.command()
                .args(["--import", dist])
                .arg(install_dir)
                .arg(image)
                .args(["--version", "2"]),
        )?;
        Ok(())
    }

    fn pipe_as_root(&self, dist: &str, input: &[u8], script: &str) -> Result<()> {
        process::run_with_input(
            "wsl",
            self.command().args(["-u", "root", "-d", dist, "sh", "-c", script]),
            input,
        )?;
        Ok(())
    }

    fn terminate(&self, dist: &str) -> Result<()> {
        self.run(&["--terminate", dist]).map(|_| ())
    }

    fn unregister(&self, dist: &str) -> Result<()> {
        self.run(&["--unregister", dist]).map(|_| ())
    }

    fn wait_running(&self, dist: &str, policy: Backoff, want: bool) -> Result<()> {
        policy.retry("wsl distribution state change", || {
            if self.is_running(dist)? == want {
                Ok(())
            } else {
                Err(Error::forwarding(format!(
                    "distribution {} running={}",
                    dist, !want
                )))
            }
        })
    }

    /// Make sure WSL 2 is usable, installing the kernel update when it is not.
    fn ensure_installed(&self, policy: Backoff) -> Result<()> {
        if self.run(&["--set-default-version", "2"]).is_ok() {
            return Ok(());
        }
        tracing::info!("installing WSL kernel update");
        policy
            .retry("install WSL kernel", || self.run(&["--update"]).map(|_| ()))
            .map_err(|e| Error::HypervisorUnavailable(format!("could not install WSL kernel: {}", e)))
    }
}

/// WSL backend.
#[derive(Debug, Clone)]
pub struct WslProvider {
    dirs: MachineDirs,
    config: Arc<MachinaConfig>,
    kernel_update: Backoff,
}

impl WslProvider {
    /// Backend rooted at `dirs`.
    pub fn new(dirs: MachineDirs, config: Arc<MachinaConfig>) -> Self {
        Self {
            dirs,
            config,
            kernel_update: KERNEL_UPDATE,
        }
    }

    fn wsl(&self) -> Wsl {
        Wsl {
            binary: self.config.helpers.resolve(&self.config.helpers.wsl),
        }
    }

    fn block<'a>(&self, desc: &'a MachineDescriptor) -> Result<&'a WslConfig> {
        desc.wsl().ok_or_else(|| desc.mismatch(VmType::Wsl))
    }

    fn distribution(name: &str) -> String {
        format!("machina-{}", name)
    }

    fn install_dir(&self, name: &str) -> PathBuf {
        self.dirs.data_dir.join("wsldist").join(name)
    }

    fn shared_network(&self) -> SharedNetwork {
        SharedNetwork::new(self.dirs.network_markers_dir())
    }

    /// Import the shared network distribution from `image` unless present.
    fn ensure_usermode_distribution(&self, wsl: &Wsl, image: &Path) -> Result<()> {
        if wsl.is_registered(USERMODE_DISTRIBUTION)? {
            return Ok(());
        }
        tracing::info!(dist = USERMODE_DISTRIBUTION, "installing user-mode network distribution");
        wsl.import(USERMODE_DISTRIBUTION, &self.install_dir("net-usermode"), image)
    }

    fn start_usermode_network(&self) -> Result<()> {
        let wsl = self.wsl();
        let mut cmd = wsl.command();
        cmd.args(["-u", "root", "-d", USERMODE_DISTRIBUTION, USERMODE_FORWARDER]);
        let log = self.dirs.runtime_dir.join("net-usermode.log");
        process::spawn_detached("wsl", &mut cmd, &log)?;
        wsl.wait_running(
            USERMODE_DISTRIBUTION,
            Backoff::within(self.config.timeouts.ready),
            true,
        )
    }

    /// Per-machine state directory handed to win-sshproxy.
    fn proxy_state_dir(&self, name: &str) -> PathBuf {
        self.dirs.runtime_dir.join(format!("{}-sshproxy", name))
    }

    /// Named-pipe proxy forwarding the engine socket over SSH.
    ///
    /// Pipes cannot be observed from here, so readiness is the proxy's
    /// thread-id file appearing in its state directory.
    fn start_ssh_proxy(&self, desc: &MachineDescriptor) -> Result<()> {
        let pid_file = self.dirs.forwarder_pid_file(&desc.name);
        forwarder::stop_helper(&pid_file, self.config.timeouts.helper_stop)?;

        let state_dir = self.proxy_state_dir(&desc.name);
        std::fs::create_dir_all(&state_dir)?;
        let ready = state_dir.join(PROXY_READY_FILE);
        crate::cleanup::remove_if_exists(&ready)?;

        let user = if desc.host_user.rootful {
            "root"
        } else {
            desc.ssh.remote_username.as_str()
        };
        let url = format!(
            "ssh://{}@localhost:{}{}",
            user,
            desc.ssh.port,
            desc.guest_api_socket()
        );

        let binary = self.config.helpers.resolve(&self.config.helpers.win_sshproxy);
        let mut command = HelperCommand::new(binary);
        command.arg(desc.name.as_str()).arg(state_dir.as_os_str());

        let machine_pipe = alloc::free_pipe_name(&format!("machina-{}", desc.name), |p| p.exists())?;
        let mut pipes = vec![machine_pipe];
        if !alloc::pipe_path(DEFAULT_PIPE).exists() {
            pipes.push(DEFAULT_PIPE.to_string());
        }
        for pipe in &pipes {
            command
                .arg(alloc::pipe_path(pipe).into_os_string())
                .arg(url.as_str())
                .arg(desc.ssh.identity_path.as_os_str());
        }

        let launch = HelperLaunch {
            command,
            pid_file,
            log_file: self.dirs.forwarder_log(&desc.name),
            wait_for: Some(ready),
            attempts: self.config.timeouts.socket_poll_attempts,
            interval: self.config.timeouts.socket_poll_interval,
        };
        let pid = forwarder::spawn_helper(&launch)?;
        tracing::info!(machine = %desc.name, pid, pipes = ?pipes, "api forwarding ready");
        Ok(())
    }
}

impl Provider for WslProvider {
    fn vm_type(&self) -> VmType {
        VmType::Wsl
    }

    fn dirs(&self) -> &MachineDirs {
        &self.dirs
    }

    fn exists(&self, name: &str) -> Result<bool> {
        self.wsl().is_registered(&Self::distribution(name))
    }

    fn create_vm(
        &self,
        opts: &InitOptions,
        desc: &mut MachineDescriptor,
        cleanup: &CleanupCallbacks,
    ) -> Result<()> {
        let wsl = self.wsl();
        wsl.ensure_installed(self.kernel_update)?;

        let dist = Self::distribution(&desc.name);
        let install_dir = self.install_dir(&desc.name);

        let undo = wsl.clone();
        let undo_dist = dist.clone();
        let undo_dir = install_dir.clone();
        cleanup.add(format!("unregister {}", dist), move || {
            undo.unregister(&undo_dist)?;
            match std::fs::remove_dir_all(&undo_dir) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            }
        });
        wsl.import(&dist, &install_dir, &desc.image_path)?;
        tracing::info!(machine = %desc.name, dist = %dist, "imported wsl distribution");

        let key = std::fs::read(public_key_path(&desc.ssh.identity_path))?;
        let mut input = key;
        input.push(b'\n');
        wsl.pipe_as_root(&dist, &input, &authorized_keys_script("/root", None))?;
        let user = desc.ssh.remote_username.clone();
        wsl.pipe_as_root(
            &dist,
            &input,
            &authorized_keys_script(&format!("/home/{}", user), Some(&user)),
        )?;

        if opts.user_mode_networking {
            self.ensure_usermode_distribution(&wsl, &desc.image_path)?;
        }

        desc.provider = ProviderConfig::Wsl(WslConfig {
            distribution: dist,
            install_dir,
            user_mode_networking: opts.user_mode_networking,
        });
        Ok(())
    }

    fn start_vm(&self, desc: &MachineDescriptor) -> Result<StartHooks> {
        let dist = self.block(desc)?.distribution.clone();
        let wsl = self.wsl();

        let mut cmd = wsl.command();
        cmd.args(["-u", "root", "-d", dist.as_str(), BOOTSTRAP]);
        let log = self.dirs.runtime_dir.join(format!("{}-wsl.log", desc.name));
        process::spawn_detached("wsl", &mut cmd, &log)?;
        tracing::info!(machine = %desc.name, dist = %dist, "wsl distribution launched");

        let policy = Backoff::within(self.config.timeouts.ready);
        let post_start: Hook = Box::new(move || wsl.wait_running(&dist, policy, true));
        Ok(StartHooks {
            pre_start: None,
            post_start: Some(post_start),
        })
    }

    fn stop_vm(&self, desc: &MachineDescriptor, _hard: bool) -> Result<()> {
        let dist = self.block(desc)?.distribution.as_str();
        let wsl = self.wsl();
        if !wsl.is_running(dist)? {
            return Ok(());
        }
        wsl.terminate(dist)?;
        wsl.wait_running(dist, Backoff::within(self.config.timeouts.helper_stop), false)
    }

    fn state(&self, desc: &MachineDescriptor) -> Result<VmState> {
        let dist = self.block(desc)?.distribution.as_str();
        if self.wsl().is_running(dist)? {
            Ok(VmState::Running)
        } else {
            Ok(VmState::Stopped)
        }
    }

    fn remove(&self, desc: &MachineDescriptor) -> Result<(Vec<String>, Hook)> {
        let cfg = self.block(desc)?.clone();
        let listed = vec![
            format!("WSL distribution {}", cfg.distribution),
            cfg.install_dir.display().to_string(),
        ];
        let wsl = self.wsl();
        let hook: Hook = Box::new(move || {
            if let Err(e) = wsl.terminate(&cfg.distribution) {
                tracing::warn!(dist = %cfg.distribution, error = %e, "failed to terminate distribution");
            }
            if let Err(e) = wsl.unregister(&cfg.distribution) {
                tracing::warn!(dist = %cfg.distribution, error = %e, "failed to unregister distribution");
            }
            match std::fs::remove_dir_all(&cfg.install_dir) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            }
        });
        Ok((listed, hook))
    }

    fn set_attrs(&self, desc: &mut MachineDescriptor, opts: &SetOptions) -> Result<()> {
        require_stopped(self, desc)?;
        if opts.cpus.is_some() {
            return Err(Error::not_implemented(VmType::Wsl, "changing cpus"));
        }
        if opts.memory.is_some() {
            return Err(Error::not_implemented(VmType::Wsl, "changing memory"));
        }
        if opts.disk_size.is_some() {
            return Err(Error::not_implemented(VmType::Wsl, "changing disk size"));
        }

        if let Some(enabled) = opts.user_mode_networking {
            if enabled {
                let image = desc.image_path.clone();
                self.ensure_usermode_distribution(&self.wsl(), &image)?;
            }
            if let ProviderConfig::Wsl(cfg) = &mut desc.provider {
                cfg.user_mode_networking = enabled;
            }
        }
        Ok(())
    }

    fn requires_exclusive_active(&self) -> bool {
        false
    }

    fn user_mode_networking_supported(&self) -> bool {
        true
    }

    fn use_provider_network_setup(&self) -> bool {
        true
    }

    fn start_networking(&self, desc: &MachineDescriptor, _cmd: &mut HelperCommand) -> Result<()> {
        if self.block(desc)?.user_mode_networking {
            let wsl = self.wsl();
            self.shared_network().acquire(
                &desc.name,
                || wsl.is_running(USERMODE_DISTRIBUTION),
                || self.start_usermode_network(),
            )?;
        }
        self.start_ssh_proxy(desc)
    }

    fn stop_networking(&self, desc: &MachineDescriptor) -> Result<()> {
        forwarder::stop_helper(
            &self.dirs.forwarder_pid_file(&desc.name),
            self.config.timeouts.helper_stop,
        )?;
        crate::cleanup::remove_if_exists(&self.proxy_state_dir(&desc.name).join(PROXY_READY_FILE))?;
        if !self.block(desc)?.user_mode_networking {
            return Ok(());
        }

        let wsl = self.wsl();
        let running = wsl.distributions(true)?;
        let remaining = self.shared_network().release(
            &desc.name,
            |machine| running.contains(&Self::distribution(machine)),
            || wsl.terminate(USERMODE_DISTRIBUTION),
        )?;
        tracing::debug!(machine = %desc.name, remaining, "released shared network");
        Ok(())
    }
}
