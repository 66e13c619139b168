//! Apple Virtualization.framework backend, driven through vfkit.
//!
//! vfkit runs detached and exposes a REST endpoint (`GET/POST /vm/state`).
//! An unreachable endpoint is the normal signature of a powered-off machine.

use super::{grow_raw_image, remove_files_hook, require_stopped, Hook, InitOptions, Provider, SetOptions, StartHooks};
use crate::alloc;
use crate::cleanup::CleanupCallbacks;
use crate::config::MachinaConfig;
use crate::delivery::Delivery;
use crate::error::{Error, Result};
use crate::machine::{
    AppleHvConfig, BackendStatus, MachineDescriptor, MountType, ProviderConfig, VmState, VmType,
};
use crate::network::HelperCommand;
use crate::paths::MachineDirs;
use crate::process;
use crate::retry::Backoff;
use crate::sockets::ReadyListener;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

/// Guest vsock port the guest-config payload is fetched from.
const GUEST_CONFIG_VSOCK_PORT: u32 = 1024;
/// Guest vsock port the ready notification is sent to.
const READY_VSOCK_PORT: u32 = 1025;
/// Fixed MAC so the user-mode network hands out a predictable address.
const GUEST_MAC: &str = "5a:94:ef:e4:0c:ee";
/// Per-request timeout on the REST endpoint.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(2);
/// Grace period for the guest to finish fetching its config after ready.
const DELIVERY_GRACE: Duration = Duration::from_secs(5);

/// vfkit backend.
#[derive(Debug, Clone)]
pub struct AppleHvProvider {
    dirs: MachineDirs,
    config: Arc<MachinaConfig>,
}

impl AppleHvProvider {
    /// Backend rooted at `dirs`.
    pub fn new(dirs: MachineDirs, config: Arc<MachinaConfig>) -> Self {
        Self { dirs, config }
    }

    fn vfkit_log(&self, name: &str) -> PathBuf {
        self.dirs.runtime_dir.join(format!("{}-vfkit.log", name))
    }

    fn block<'a>(&self, desc: &'a MachineDescriptor) -> Result<&'a AppleHvConfig> {
        desc.apple_hv().ok_or_else(|| desc.mismatch(VmType::AppleHv))
    }

    fn wait_stopped(&self, client: &VfkitClient, timeout: Duration) -> Result<()> {
        Backoff::within(timeout).retry("vfkit shutdown", || match client.status()? {
            None | Some(BackendStatus::Stopped) => Ok(()),
            Some(other) => Err(Error::forwarding(format!("vm still {:?}", other))),
        })
    }
}

/// `--device` arguments for a machine.
fn vfkit_devices(dirs: &MachineDirs, name: &str, image: &std::path::Path, log: &std::path::Path) -> Vec<String> {
    vec![
        format!("virtio-blk,path={}", image.display()),
        "virtio-rng".to_string(),
        format!("virtio-serial,logFilePath={}", log.display()),
        format!(
            "virtio-net,unixSocketPath={},mac={}",
            dirs.network_socket(name).display(),
            GUEST_MAC
        ),
        format!(
            "virtio-vsock,port={},socketURL={},listen",
            READY_VSOCK_PORT,
            dirs.ready_socket(name).display()
        ),
    ]
}

/// Full vfkit command line for a machine.
fn vfkit_args(desc: &MachineDescriptor, cfg: &AppleHvConfig) -> Result<Vec<String>> {
    let mut args = vec![
        "--cpus".to_string(),
        desc.resources.cpus.to_string(),
        "--memory".to_string(),
        desc.resources.memory.to_string(),
        "--bootloader".to_string(),
        format!("efi,variable-store={},create", cfg.efi_store.display()),
    ];
    for device in &cfg.devices {
        args.push("--device".to_string());
        args.push(device.clone());
    }
    for mount in &desc.mounts {
        args.push("--device".to_string());
        args.push(format!(
            "virtio-fs,sharedDir={},mountTag={}",
            mount.source.display(),
            mount.tag
        ));
    }
    args.push("--restful-uri".to_string());
    args.push(restful_uri(&cfg.endpoint)?);
    Ok(args)
}

/// `http://localhost:PORT` to vfkit's `tcp://localhost:PORT` form.
fn restful_uri(endpoint: &str) -> Result<String> {
    endpoint
        .strip_prefix("http://")
        .filter(|rest| !rest.is_empty())
        .map(|rest| format!("tcp://{}", rest.trim_end_matches('/')))
        .ok_or_else(|| Error::Config(format!("invalid vfkit endpoint {:?}", endpoint)))
}

/// Map vfkit's state names.
pub(crate) fn parse_vfkit_state(raw: &str) -> BackendStatus {
    match raw {
        "VirtualMachineStateRunning" | "VirtualMachineStateStopping" | "VirtualMachineStateResuming" => {
            BackendStatus::Running
        }
        "VirtualMachineStatePaused" | "VirtualMachineStatePausing" => BackendStatus::Paused,
        "VirtualMachineStateStarting" => BackendStatus::Starting,
        "VirtualMachineStateStopped" => BackendStatus::Stopped,
        "VirtualMachineStateError" => BackendStatus::Error("vfkit reported an error state".into()),
        other => BackendStatus::Error(format!("unknown vfkit state {:?}", other)),
    }
}

#[derive(Debug, Deserialize)]
struct StateResponse {
    state: String,
}

/// Blocking client for vfkit's REST endpoint.
struct VfkitClient {
    url: String,
    client: reqwest::blocking::Client,
}

impl VfkitClient {
    fn new(endpoint: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(CONTROL_TIMEOUT)
            .build()
            .map_err(|e| Error::HypervisorUnavailable(e.to_string()))?;
        Ok(Self {
            url: format!("{}/vm/state", endpoint.trim_end_matches('/')),
            client,
        })
    }

    /// Reported status, or `None` if nothing answers.
    fn status(&self) -> Result<Option<BackendStatus>> {
        let response = match self.client.get(&self.url).send() {
            Ok(response) => response,
            Err(e) if e.is_connect() || e.is_timeout() => {
                tracing::trace!(url = %self.url, error = %e, "vfkit endpoint unreachable");
                return Ok(None);
            }
            Err(e) => return Err(Error::HypervisorUnavailable(e.to_string())),
        };
        let body: StateResponse = response
            .error_for_status()
            .and_then(|r| r.json())
            .map_err(|e| Error::HypervisorUnavailable(e.to_string()))?;
        Ok(Some(parse_vfkit_state(&body.state)))
    }

    fn request_state(&self, state: &str) -> Result<()> {
        tracing::debug!(url = %self.url, state, "requesting vm state change");
        self.client
            .post(&self.url)
            .json(&serde_json::json!({ "state": state }))
            .send()
            .and_then(|r| r.error_for_status())
            .map(|_| ())
            .map_err(|e| Error::HypervisorUnavailable(e.to_string()))
    }
}

impl Provider for AppleHvProvider {
    fn vm_type(&self) -> VmType {
        VmType::AppleHv
    }

    fn dirs(&self) -> &MachineDirs {
        &self.dirs
    }

    fn exists(&self, _name: &str) -> Result<bool> {
        // vfkit keeps no registry of its own.
        Ok(false)
    }

    fn create_vm(
        &self,
        opts: &InitOptions,
        desc: &mut MachineDescriptor,
        cleanup: &CleanupCallbacks,
    ) -> Result<()> {
        let name = desc.name.clone();
        grow_raw_image(&desc.image_path, opts.disk_size)?;

        let efi_store = self.dirs.data_dir.join(format!("{}-efi-bl-store", name));
        let log_path = self.dirs.data_dir.join(format!("{}.log", name));
        cleanup.add_remove_file(efi_store.clone());
        cleanup.add_remove_file(log_path.clone());
        cleanup.add_remove_file(self.vfkit_log(&name));

        let endpoint = format!("http://localhost:{}", alloc::free_port()?);
        let devices = vfkit_devices(&self.dirs, &name, &desc.image_path, &log_path);
        tracing::debug!(machine = %name, %endpoint, devices = devices.len(), "configured vfkit");

        desc.provider = ProviderConfig::AppleHv(AppleHvConfig {
            endpoint,
            devices,
            efi_store,
            log_path,
        });
        Ok(())
    }

    fn start_vm(&self, desc: &MachineDescriptor) -> Result<StartHooks> {
        let cfg = self.block(desc)?;
        let name = desc.name.clone();
        let mut args = vfkit_args(desc, cfg)?;

        let ready = ReadyListener::bind(self.dirs.ready_socket(&name))?;

        let delivery = if desc.is_first_boot() {
            let socket = self.dirs.guest_config_socket(&name);
            let payload = std::fs::read(self.dirs.guest_config_path(&name))?;
            let delivery = Delivery::serve_once(&socket, payload)?;
            args.push("--device".to_string());
            args.push(format!(
                "virtio-vsock,port={},socketURL={},listen",
                GUEST_CONFIG_VSOCK_PORT,
                socket.display()
            ));
            tracing::debug!(machine = %name, socket = %socket.display(), "first boot, serving guest config");
            Some(delivery)
        } else {
            None
        };

        let binary = self.config.helpers.resolve(&self.config.helpers.vfkit);
        let mut cmd = Command::new(&binary);
        cmd.args(&args);
        let pid = process::spawn_detached("vfkit", &mut cmd, &self.vfkit_log(&name))?;
        tracing::info!(machine = %name, pid, "vfkit launched");

        let machine = name.clone();
        let pre_start: Hook = Box::new(move || {
            if process::has_exited(pid) {
                return Err(Error::VmFailed {
                    machine,
                    reason: "vfkit exited right after launch".into(),
                });
            }
            Ok(())
        });

        let timeout = self.config.timeouts.ready;
        let post_start: Hook = Box::new(move || {
            ready.wait(timeout, || !process::has_exited(pid))?;
            if let Some(delivery) = delivery {
                delivery.wait(DELIVERY_GRACE)?;
            }
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
        let client = VfkitClient::new(&cfg.endpoint)?;
        match client.status()? {
            None | Some(BackendStatus::Stopped) => return Ok(()),
            Some(_) => {}
        }

        client.request_state(if hard { "HardStop" } else { "Stop" })?;
        let timeout = self.config.timeouts.helper_stop;
        match self.wait_stopped(&client, timeout) {
            Ok(()) => Ok(()),
            Err(e) if !hard => {
                tracing::warn!(machine = %desc.name, error = %e, "graceful stop timed out, forcing");
                client.request_state("HardStop")?;
                self.wait_stopped(&client, timeout)
            }
            Err(e) => Err(e),
        }
    }

    fn state(&self, desc: &MachineDescriptor) -> Result<VmState> {
        let cfg = self.block(desc)?;
        match VfkitClient::new(&cfg.endpoint)?.status()? {
            None => Ok(VmState::Stopped),
            Some(status) => status.normalize(&desc.name),
        }
    }

    fn remove(&self, desc: &MachineDescriptor) -> Result<(Vec<String>, Hook)> {
        let cfg = self.block(desc)?;
        let files = vec![
            cfg.efi_store.clone(),
            cfg.log_path.clone(),
            self.vfkit_log(&desc.name),
            self.dirs.guest_config_socket(&desc.name),
        ];
        let listed = files[..2].iter().map(|p| p.display().to_string()).collect();
        Ok((listed, remove_files_hook(files)))
    }

    fn set_attrs(&self, desc: &mut MachineDescriptor, opts: &SetOptions) -> Result<()> {
        require_stopped(self, desc)?;
        if opts.user_mode_networking == Some(false) {
            return Err(Error::not_implemented(VmType::AppleHv, "disabling user-mode networking"));
        }
        if let Some(size) = opts.disk_size {
            if size > desc.resources.disk_size {
                grow_raw_image(&desc.image_path, size)?;
            }
        }
        // CPUs and memory are passed to vfkit on every start.
        Ok(())
    }

    fn requires_exclusive_active(&self) -> bool {
        true
    }

    fn user_mode_networking_supported(&self) -> bool {
        true
    }

    fn mount_type(&self) -> MountType {
        MountType::VirtioFs
    }

    fn start_networking(&self, desc: &MachineDescriptor, cmd: &mut HelperCommand) -> Result<()> {
        let socket = self.dirs.network_socket(&desc.name);
        cmd.add_vfkit_socket(format!("unixgram://{}", socket.display()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    /// Answer every request on a local port with a fixed vfkit state.
    fn fake_vfkit(state: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { return };
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf);
                let body = format!("{{\"state\":\"{}\",\"canStart\":false}}", state);
                let reply = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(reply.as_bytes());
            }
        });
        format!("http://127.0.0.1:{}", port)
    }

    fn provider(root: &std::path::Path) -> AppleHvProvider {
        let dirs = testing::dirs(root, VmType::AppleHv);
        AppleHvProvider::new(dirs, Arc::new(MachinaConfig::default()))
    }

    fn created(p: &AppleHvProvider) -> MachineDescriptor {
        let mut desc = testing::descriptor(p.dirs(), "dev1");
        std::fs::write(&desc.image_path, b"").unwrap();
        let cleanup = CleanupCallbacks::new();
        let opts = InitOptions {
            disk_size: 1,
            ..InitOptions::from_defaults("dev1", &MachinaConfig::default())
        };
        p.create_vm(&opts, &mut desc, &cleanup).unwrap();
        cleanup.disarm();
        desc
    }

    fn with_endpoint(desc: &mut MachineDescriptor, endpoint: String) {
        if let ProviderConfig::AppleHv(cfg) = &mut desc.provider {
            cfg.endpoint = endpoint;
        }
    }

    #[test]
    fn test_parse_vfkit_state() {
        // (reported, expected)
        let cases = [
            ("VirtualMachineStateRunning", BackendStatus::Running),
            ("VirtualMachineStateStopping", BackendStatus::Running),
            ("VirtualMachineStatePaused", BackendStatus::Paused),
            ("VirtualMachineStateStarting", BackendStatus::Starting),
            ("VirtualMachineStateStopped", BackendStatus::Stopped),
        ];
        for (raw, expected) in cases {
            assert_eq!(parse_vfkit_state(raw), expected, "{}", raw);
        }
        assert!(matches!(parse_vfkit_state("Bogus"), BackendStatus::Error(_)));
    }

    #[test]
    fn test_restful_uri() {
        assert_eq!(restful_uri("http://localhost:8081").unwrap(), "tcp://localhost:8081");
        assert_eq!(restful_uri("http://localhost:8081/").unwrap(), "tcp://localhost:8081");
        assert!(restful_uri("localhost:8081").is_err());
        assert!(restful_uri("http://").is_err());
    }

    #[test]
    fn test_create_fills_hypervisor_block() {
        let tmp = tempfile::tempdir().unwrap();
        let p = provider(tmp.path());
        let desc = created(&p);

        let cfg = desc.apple_hv().unwrap();
        assert!(cfg.endpoint.starts_with("http://localhost:"));
        assert!(cfg.devices.iter().any(|d| d.starts_with("virtio-blk,path=")));
        assert!(cfg.devices.iter().any(|d| d.contains("port=1025")));
        assert_eq!(
            std::fs::metadata(&desc.image_path).unwrap().len(),
            1024 * 1024 * 1024,
            "raw image grown to the requested size"
        );

        let args = vfkit_args(&desc, cfg).unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("--cpus 1 --memory 2048"), "{}", joined);
        assert!(joined.contains("--bootloader efi,variable-store="), "{}", joined);
        assert!(joined.ends_with(&format!("--restful-uri {}", restful_uri(&cfg.endpoint).unwrap())));
    }

    #[test]
    fn test_mounts_become_virtio_fs_devices() {
        let tmp = tempfile::tempdir().unwrap();
        let p = provider(tmp.path());
        let mut desc = created(&p);
        desc.mounts = crate::machine::parse_volumes(&[format!(
            "{}:/work:ro",
            tmp.path().display()
        )])
        .unwrap();
        let source = tmp.path().canonicalize().unwrap();

        let args = vfkit_args(&desc, desc.apple_hv().unwrap()).unwrap();
        let share = format!("virtio-fs,sharedDir={},mountTag=vol0", source.display());
        let at = args.iter().position(|a| *a == share).expect("share device");
        assert_eq!(args[at - 1], "--device");
        assert_eq!(p.mount_type(), MountType::VirtioFs);
    }

    #[test]
    fn test_unreachable_endpoint_is_stopped() {
        let tmp = tempfile::tempdir().unwrap();
        let p = provider(tmp.path());
        let mut desc = created(&p);
        with_endpoint(&mut desc, format!("http://127.0.0.1:{}", alloc::free_port().unwrap()));

        assert_eq!(p.state(&desc).unwrap(), VmState::Stopped);
        p.stop_vm(&desc, false).unwrap();
    }

    #[test]
    fn test_state_from_endpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let p = provider(tmp.path());
        let mut desc = created(&p);

        with_endpoint(&mut desc, fake_vfkit("VirtualMachineStatePaused"));
        assert_eq!(p.state(&desc).unwrap(), VmState::Running, "paused counts as running");

        with_endpoint(&mut desc, fake_vfkit("VirtualMachineStateError"));
        assert!(matches!(p.state(&desc).unwrap_err(), Error::VmFailed { .. }));
    }

    #[test]
    fn test_set_attrs_requires_stopped() {
        let tmp = tempfile::tempdir().unwrap();
        let p = provider(tmp.path());
        let mut desc = created(&p);
        with_endpoint(&mut desc, fake_vfkit("VirtualMachineStateRunning"));

        let opts = SetOptions {
            cpus: Some(4),
            ..SetOptions::default()
        };
        let err = p.set_attrs(&mut desc, &opts).unwrap_err();
        assert!(matches!(err, Error::WrongState { .. }), "got {:?}", err);
    }

    #[test]
    fn test_set_attrs_grows_disk_when_stopped() {
        let tmp = tempfile::tempdir().unwrap();
        let p = provider(tmp.path());
        let mut desc = created(&p);
        with_endpoint(&mut desc, format!("http://127.0.0.1:{}", alloc::free_port().unwrap()));
        desc.resources.disk_size = 1;

        let opts = SetOptions {
            disk_size: Some(2),
            ..SetOptions::default()
        };
        p.set_attrs(&mut desc, &opts).unwrap();
        assert_eq!(std::fs::metadata(&desc.image_path).unwrap().len(), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_networking_adds_datagram_socket() {
        let tmp = tempfile::tempdir().unwrap();
        let p = provider(tmp.path());
        let desc = created(&p);
        let mut cmd = HelperCommand::new("gvproxy");
        p.start_networking(&desc, &mut cmd).unwrap();

        let args: Vec<String> = cmd.args().iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args[0], "-listen-vfkit");
        assert!(args[1].starts_with("unixgram://"), "{}", args[1]);
    }

    #[test]
    fn test_remove_lists_backend_files() {
        let tmp = tempfile::tempdir().unwrap();
        let p = provider(tmp.path());
        let desc = created(&p);
        let cfg = desc.apple_hv().unwrap().clone();
        std::fs::write(&cfg.efi_store, b"efi").unwrap();

        let (listed, hook) = p.remove(&desc).unwrap();
        assert!(listed.contains(&cfg.efi_store.display().to_string()));
        hook().unwrap();
        assert!(!cfg.efi_store.exists());
    }
}
