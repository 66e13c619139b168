//! QEMU backend.
//!
//! QEMU runs detached with a QMP control socket and a PID file. The guest
//! config is passed through `-fw_cfg` and readiness arrives on a virtio
//! serial port connected to a host listener.

use super::{remove_files_hook, require_stopped, Hook, InitOptions, Provider, SetOptions, StartHooks};
use crate::alloc;
use crate::cleanup::{remove_if_exists, CleanupCallbacks};
use crate::config::MachinaConfig;
use crate::error::{Error, Result};
use crate::machine::{
    BackendStatus, MachineDescriptor, MountType, ProviderConfig, QemuConfig, VmState, VmType,
};
use crate::network::{HelperCommand, PidRecord};
use crate::paths::MachineDirs;
use crate::process;
use crate::retry::Backoff;
use crate::sockets::ReadyListener;
use serde::Deserialize;
use serde_json::Value;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

/// Fixed MAC so the user-mode network hands out a predictable address.
const GUEST_MAC: &str = "5a:94:ef:e4:0c:ee";
/// Read timeout on the QMP socket.
const QMP_TIMEOUT: Duration = Duration::from_secs(2);

const GIB: u64 = 1024 * 1024 * 1024;

/// QEMU backend.
#[derive(Debug, Clone)]
pub struct QemuProvider {
    dirs: MachineDirs,
    config: Arc<MachinaConfig>,
}

impl QemuProvider {
    /// Backend rooted at `dirs`.
    pub fn new(dirs: MachineDirs, config: Arc<MachinaConfig>) -> Self {
        Self { dirs, config }
    }

    fn block<'a>(&self, desc: &'a MachineDescriptor) -> Result<&'a QemuConfig> {
        desc.qemu().ok_or_else(|| desc.mismatch(VmType::Qemu))
    }

    fn process_log(&self, name: &str) -> PathBuf {
        self.dirs.runtime_dir.join(format!("{}-qemu.log", name))
    }

    fn qemu_img(&self) -> Command {
        Command::new(self.config.helpers.resolve(&self.config.helpers.qemu_img))
    }

    /// Virtual size of a disk image in bytes.
    fn virtual_size(&self, image: &Path) -> Result<u64> {
        #[derive(Deserialize)]
        struct ImageInfo {
            #[serde(rename = "virtual-size")]
            virtual_size: u64,
        }
        let output = process::run_checked(
            "qemu-img",
            self.qemu_img().arg("info").arg("--output").arg("json").arg(image),
        )?;
        let info: ImageInfo = serde_json::from_slice(&output.stdout)?;
        Ok(info.virtual_size)
    }

    /// Grow the image to `gib` if it is smaller.
    fn grow_disk(&self, image: &Path, gib: u64) -> Result<()> {
        let current = self.virtual_size(image)?;
        if gib.saturating_mul(GIB) <= current {
            tracing::debug!(image = %image.display(), current, "disk already large enough");
            return Ok(());
        }
        process::run_checked(
            "qemu-img",
            self.qemu_img().arg("resize").arg(image).arg(format!("{}G", gib)),
        )?;
        tracing::info!(image = %image.display(), gib, "resized disk image");
        Ok(())
    }

    fn wait_exit(pid: i32, timeout: Duration) -> Result<()> {
        Backoff::within(timeout).retry("qemu shutdown", || {
            if process::has_exited(pid) {
                Ok(())
            } else {
                Err(Error::forwarding(format!("qemu {} still running", pid)))
            }
        })
    }
}

/// Acceleration flags for the host.
fn accel_args() -> Vec<String> {
    let mut args = Vec::new();
    if std::env::consts::ARCH == "aarch64" {
        args.extend(["-machine".to_string(), "virt".to_string()]);
    }
    if Path::new("/dev/kvm").exists() {
        args.extend(["-accel", "kvm", "-cpu", "host"].map(String::from));
    } else {
        args.extend(["-accel", "tcg"].map(String::from));
    }
    args
}

/// Full QEMU command line for a machine, without the binary.
fn qemu_args(dirs: &MachineDirs, desc: &MachineDescriptor, cfg: &QemuConfig) -> Vec<String> {
    let name = &desc.name;
    let ready_id = format!("{}_ready", name);
    let mut args = vec![
        "-name".to_string(),
        name.clone(),
        "-m".to_string(),
        desc.resources.memory.to_string(),
        "-smp".to_string(),
        desc.resources.cpus.to_string(),
    ];
    args.extend(accel_args());
    args.extend([
        "-qmp".to_string(),
        format!("unix:{},server=on,wait=off", cfg.qmp_socket.display()),
        "-netdev".to_string(),
        format!(
            "stream,id=vlan,server=off,addr.type=unix,addr.path={}",
            dirs.network_socket(name).display()
        ),
        "-device".to_string(),
        format!("virtio-net-pci,netdev=vlan,mac={}", GUEST_MAC),
        "-device".to_string(),
        "virtio-serial".to_string(),
        "-chardev".to_string(),
        format!(
            "socket,path={},server=off,id={}",
            dirs.ready_socket(name).display(),
            ready_id
        ),
        "-device".to_string(),
        format!("virtserialport,chardev={},name=org.fedoraproject.port.0", ready_id),
        "-pidfile".to_string(),
        cfg.pid_file.display().to_string(),
        "-fw_cfg".to_string(),
        format!(
            "name=opt/com.coreos/config,file={}",
            dirs.guest_config_path(name).display()
        ),
        "-drive".to_string(),
        format!("if=virtio,file={}", desc.image_path.display()),
        "-serial".to_string(),
        format!("file:{}", cfg.log_path.display()),
        "-display".to_string(),
        "none".to_string(),
    ]);
    for mount in &desc.mounts {
        let mut share = format!(
            "local,path={},mount_tag={},security_model=none",
            mount.source.display(),
            mount.tag
        );
        if mount.read_only {
            share.push_str(",readonly=on");
        }
        args.push("-virtfs".to_string());
        args.push(share);
    }
    args
}

/// Map a QMP `query-status` run state.
pub(crate) fn parse_qmp_status(status: &str) -> BackendStatus {
    match status {
        "running" | "finish-migrate" | "save-vm" | "restore-vm" | "colo" => BackendStatus::Running,
        "paused" | "suspended" | "postmigrate" | "debug" => BackendStatus::Paused,
        "prelaunch" | "inmigrate" => BackendStatus::Starting,
        "shutdown" => BackendStatus::Stopped,
        "internal-error" | "io-error" | "guest-panicked" | "watchdog" => {
            BackendStatus::Error(format!("qemu run state {}", status))
        }
        other => BackendStatus::Error(format!("unknown qemu run state {:?}", other)),
    }
}

/// Minimal QMP session: greeting, capabilities negotiation, commands.
struct Qmp {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl Qmp {
    /// Open a session, or `None` if nothing listens on `path`.
    fn connect(path: &Path) -> Result<Option<Self>> {
        let stream = match UnixStream::connect(path) {
            Ok(stream) => stream,
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        };
        stream.set_read_timeout(Some(QMP_TIMEOUT))?;
        let writer = stream.try_clone()?;
        let mut qmp = Self {
            reader: BufReader::new(stream),
            writer,
        };

        let greeting = qmp.read_message()?;
        if greeting.get("QMP").is_none() {
            return Err(Error::HypervisorUnavailable(format!(
                "unexpected QMP greeting: {}",
                greeting
            )));
        }
        qmp.execute("qmp_capabilities")?;
        Ok(Some(qmp))
    }

    fn read_message(&mut self) -> Result<Value> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(Error::HypervisorUnavailable("QMP socket closed".into()));
        }
        Ok(serde_json::from_str(line.trim())?)
    }

    /// Run a command and return its `return` payload. Events are skipped.
    fn execute(&mut self, command: &str) -> Result<Value> {
        let request = serde_json::json!({ "execute": command });
        self.writer.write_all(format!("{}\n", request).as_bytes())?;
        loop {
            let mut message = self.read_message()?;
            if let Some(ret) = message.get_mut("return") {
                return Ok(ret.take());
            }
            if let Some(err) = message.get("error") {
                let desc = err.get("desc").and_then(Value::as_str).unwrap_or("unknown error");
                return Err(Error::command_failed(format!("qmp {}", command), desc));
            }
            tracing::trace!(%message, "skipping QMP event");
        }
    }

    fn status(&mut self) -> Result<BackendStatus> {
        let ret = self.execute("query-status")?;
        let status = ret.get("status").and_then(Value::as_str).unwrap_or_default();
        Ok(parse_qmp_status(status))
    }
}

impl Provider for QemuProvider {
    fn vm_type(&self) -> VmType {
        VmType::Qemu
    }

    fn dirs(&self) -> &MachineDirs {
        &self.dirs
    }

    fn exists(&self, _name: &str) -> Result<bool> {
        Ok(false)
    }

    fn create_vm(
        &self,
        opts: &InitOptions,
        desc: &mut MachineDescriptor,
        cleanup: &CleanupCallbacks,
    ) -> Result<()> {
        let name = desc.name.clone();
        let cfg = QemuConfig {
            qmp_socket: self.dirs.runtime_dir.join(format!("{}-qmp.sock", name)),
            pid_file: self.dirs.runtime_dir.join(format!("{}-qemu.pid", name)),
            log_path: self.dirs.data_dir.join(format!("{}.log", name)),
        };
        cleanup.add_remove_file(cfg.log_path.clone());
        cleanup.add_remove_file(self.process_log(&name));

        self.grow_disk(&desc.image_path, opts.disk_size)?;
        desc.provider = ProviderConfig::Qemu(cfg);
        Ok(())
    }

    fn start_vm(&self, desc: &MachineDescriptor) -> Result<StartHooks> {
        let cfg = self.block(desc)?;
        let name = desc.name.clone();
        if !alloc::claim_socket_path(&cfg.qmp_socket)? {
            return Err(Error::VmAlreadyRunning(name));
        }
        remove_if_exists(&cfg.pid_file)?;

        let ready = ReadyListener::bind(self.dirs.ready_socket(&name))?;
        let binary = self.config.helpers.resolve(&self.config.helpers.qemu);
        let mut cmd = Command::new(&binary);
        cmd.args(qemu_args(&self.dirs, desc, cfg));
        let pid = process::spawn_detached("qemu", &mut cmd, &self.process_log(&name))?;
        tracing::info!(machine = %name, pid, "qemu launched");

        let machine = name.clone();
        let pre_start: Hook = Box::new(move || {
            if process::has_exited(pid) {
                return Err(Error::VmFailed {
                    machine,
                    reason: "qemu exited right after launch".into(),
                });
            }
            Ok(())
        });
        let timeout = self.config.timeouts.ready;
        let post_start: Hook = Box::new(move || {
            ready.wait(timeout, || !process::has_exited(pid))?;
            tracing::info!(machine = %name, "guest reported ready");
            Ok(())
        });
        Ok(StartHooks {
            pre_start: Some(pre_start),
            post_start: Some(post_start),
        })
    }

    fn stop_vm(&self, desc: &MachineDescriptor, hard: bool) -> Result<()> {
        let cfg = self.block(desc)?;
        let Some(mut qmp) = Qmp::connect(&cfg.qmp_socket)? else {
            tracing::debug!(machine = %desc.name, "qmp socket not listening, already stopped");
            remove_if_exists(&cfg.qmp_socket)?;
            return remove_if_exists(&cfg.pid_file);
        };

        let pid = PidRecord::read(&cfg.pid_file)?.map(|r| r.pid);
        qmp.execute(if hard { "quit" } else { "system_powerdown" })?;
        drop(qmp);

        if let Some(pid) = pid {
            if let Err(e) = Self::wait_exit(pid, self.config.timeouts.helper_stop) {
                tracing::warn!(machine = %desc.name, pid, error = %e, "qemu did not power down, killing");
                process::stop_process(pid, Duration::from_secs(2))?;
            }
        }
        remove_if_exists(&cfg.qmp_socket)?;
        remove_if_exists(&cfg.pid_file)
    }

    fn state(&self, desc: &MachineDescriptor) -> Result<VmState> {
        let cfg = self.block(desc)?;
        match Qmp::connect(&cfg.qmp_socket)? {
            None => Ok(VmState::Stopped),
            Some(mut qmp) => qmp.status()?.normalize(&desc.name),
        }
    }

    fn remove(&self, desc: &MachineDescriptor) -> Result<(Vec<String>, Hook)> {
        let cfg = self.block(desc)?;
        let listed = vec![cfg.log_path.display().to_string()];
        let files = vec![
            cfg.log_path.clone(),
            cfg.qmp_socket.clone(),
            cfg.pid_file.clone(),
            self.process_log(&desc.name),
        ];
        Ok((listed, remove_files_hook(files)))
    }

    fn set_attrs(&self, desc: &mut MachineDescriptor, opts: &SetOptions) -> Result<()> {
        require_stopped(self, desc)?;
        if opts.user_mode_networking == Some(false) {
            return Err(Error::not_implemented(VmType::Qemu, "disabling user-mode networking"));
        }
        if let Some(size) = opts.disk_size {
            if size > desc.resources.disk_size {
                self.grow_disk(&desc.image_path, size)?;
            }
        }
        Ok(())
    }

    fn requires_exclusive_active(&self) -> bool {
        true
    }

    fn user_mode_networking_supported(&self) -> bool {
        true
    }

    fn mount_type(&self) -> MountType {
        MountType::NineP
    }

    fn start_networking(&self, desc: &MachineDescriptor, cmd: &mut HelperCommand) -> Result<()> {
        let socket = self.dirs.network_socket(&desc.name);
        cmd.add_qemu_socket(format!("unix://{}", socket.display()));
        Ok(())
    }
}
