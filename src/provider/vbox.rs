//! VirtualBox backend, driven through `VBoxManage`.

use super::{require_stopped, Hook, InitOptions, Provider, SetOptions, StartHooks};
use crate::cleanup::{remove_if_exists, CleanupCallbacks};
use crate::config::MachinaConfig;
use crate::error::{Error, Result};
use crate::machine::{BackendStatus, MachineDescriptor, ProviderConfig, VirtualBoxConfig, VmState, VmType};
use crate::network::HelperCommand;
use crate::paths::MachineDirs;
use crate::process;
use crate::retry::Backoff;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

const OS_TYPE: &str = "Fedora_64";
const GUEST_CONFIG_PROPERTY: &str = "/Ignition/Config";

/// Thin wrapper over the `VBoxManage` binary.
#[derive(Debug, Clone)]
struct VBoxManage {
    binary: PathBuf,
}

impl VBoxManage {
    fn command(&self) -> Command {
        Command::new(&self.binary)
    }

    fn run(&self, cmd: &mut Command) -> Result<String> {
        let output = process::run_checked("VBoxManage", cmd)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn run_args(&self, args: &[&str]) -> Result<String> {
        self.run(self.command().args(args))
    }

    fn status(&self, vm_name: &str) -> Result<BackendStatus> {
        let info = self.run_args(&["showvminfo", vm_name, "--machinereadable"])?;
        let raw = parse_vm_state(&info)?.ok_or_else(|| {
            Error::HypervisorUnavailable(format!("no VMState in showvminfo output for {}", vm_name))
        })?;
        Ok(parse_vbox_state(&raw))
    }

    fn wait_for(&self, vm_name: &str, policy: Backoff, want: BackendStatus) -> Result<()> {
        policy.retry("virtualbox state change", || {
            let status = self.status(vm_name)?;
            if status == want {
                Ok(())
            } else {
                Err(Error::forwarding(format!("{} is {:?}", vm_name, status)))
            }
        })
    }
}

/// `VMState="..."` from `showvminfo --machinereadable` output.
fn parse_vm_state(info: &str) -> Result<Option<String>> {
    let re = Regex::new(r#"(?m)^VMState="(\w+)""#).map_err(|e| Error::Config(e.to_string()))?;
    Ok(re.captures(info).map(|c| c[1].to_string()))
}

/// Map a VirtualBox machine state.
pub(crate) fn parse_vbox_state(state: &str) -> BackendStatus {
    match state {
        "running" | "stopping" | "saving" | "livesnapshotting" | "onlinesnapshotting" | "teleporting" => {
            BackendStatus::Running
        }
        "paused" => BackendStatus::Paused,
        "starting" | "restoring" => BackendStatus::Starting,
        "poweroff" | "saved" | "aborted" | "teleported" => BackendStatus::Stopped,
        "gurumeditation" | "stuck" => BackendStatus::Error(format!("virtualbox state {}", state)),
        other => BackendStatus::Error(format!("unknown virtualbox state {:?}", other)),
    }
}

/// NAT port-forward rule for the guest's sshd.
fn ssh_forward_rule(port: u16) -> String {
    format!("SSH,tcp,127.0.0.1,{},,22", port)
}

/// VirtualBox backend.
#[derive(Debug, Clone)]
pub struct VirtualBoxProvider {
    dirs: MachineDirs,
    config: Arc<MachinaConfig>,
}

impl VirtualBoxProvider {
    /// Backend rooted at `dirs`.
    pub fn new(dirs: MachineDirs, config: Arc<MachinaConfig>) -> Self {
        Self { dirs, config }
    }

    fn vbox(&self) -> VBoxManage {
        VBoxManage {
            binary: self.config.helpers.resolve(&self.config.helpers.vboxmanage),
        }
    }

    fn block<'a>(&self, desc: &'a MachineDescriptor) -> Result<&'a VirtualBoxConfig> {
        desc.virtualbox().ok_or_else(|| desc.mismatch(VmType::VirtualBox))
    }

    fn vm_name(name: &str) -> String {
        format!("machina-{}", name)
    }

    fn resize(&self, vdi: &Path, gib: u64) -> Result<()> {
        let mib = gib.saturating_mul(1024).to_string();
        let vbox = self.vbox();
        vbox.run(
            vbox.command()
                .args(["modifymedium", "disk"])
                .arg(vdi)
                .args(["--resize", mib.as_str()]),
        )?;
        Ok(())
    }
}

impl Provider for VirtualBoxProvider {
    fn vm_type(&self) -> VmType {
        VmType::VirtualBox
    }

    fn dirs(&self) -> &MachineDirs {
        &self.dirs
    }

    fn exists(&self, name: &str) -> Result<bool> {
        let listed = self.vbox().run_args(&["list", "vms"])?;
        let quoted = format!("\"{}\"", Self::vm_name(name));
        Ok(listed.lines().any(|line| line.starts_with(&quoted)))
    }

    fn create_vm(
        &self,
        opts: &InitOptions,
        desc: &mut MachineDescriptor,
        cleanup: &CleanupCallbacks,
    ) -> Result<()> {
        let vbox = self.vbox();
        let vm_name = Self::vm_name(&desc.name);
        let vdi_path = self.dirs.data_dir.join(format!("{}.vdi", desc.name));
        let controller = format!("sata-controller-{}", desc.name);

        let undo = vbox.clone();
        let undo_name = vm_name.clone();
        cleanup.add(format!("unregister {}", vm_name), move || {
            undo.run_args(&["unregistervm", undo_name.as_str(), "--delete"])
                .map(|_| ())
        });
        vbox.run(
            vbox.command()
                .args(["createvm", "--name", vm_name.as_str(), "--basefolder"])
                .arg(&self.dirs.data_dir)
                .args(["--ostype", OS_TYPE, "--register"]),
        )?;

        cleanup.add_remove_file(vdi_path.clone());
        vbox.run(
            vbox.command()
                .arg("convertfromraw")
                .arg(&desc.image_path)
                .arg(&vdi_path)
                .args(["--format", "VDI"]),
        )?;
        self.resize(&vdi_path, opts.disk_size)?;

        vbox.run_args(&[
            "storagectl",
            vm_name.as_str(),
            "--name",
            controller.as_str(),
            "--add",
            "sata",
            "--controller",
            "IntelAhci",
            "--portcount",
            "30",
            "--bootable",
            "on",
        ])?;
        vbox.run(
            vbox.command()
                .args([
                    "storageattach",
                    vm_name.as_str(),
                    "--storagectl",
                    controller.as_str(),
                    "--port",
                    "0",
                    "--device",
                    "0",
                    "--type",
                    "hdd",
                    "--medium",
                ])
                .arg(&vdi_path),
        )?;

        let cpus = desc.resources.cpus.to_string();
        let memory = desc.resources.memory.to_string();
        let rule = ssh_forward_rule(desc.ssh.port);
        vbox.run_args(&[
            "modifyvm",
            vm_name.as_str(),
            "--boot1",
            "disk",
            "--boot2",
            "none",
            "--cpus",
            cpus.as_str(),
            "--ioapic",
            "on",
            "--memory",
            memory.as_str(),
            "--rtcuseutc",
            "on",
            "--nic1",
            "nat",
            "--natpf1",
            rule.as_str(),
        ])?;
        tracing::info!(machine = %desc.name, vm = %vm_name, "registered virtualbox vm");

        desc.provider = ProviderConfig::VirtualBox(VirtualBoxConfig { vm_name, vdi_path });
        Ok(())
    }

    fn start_vm(&self, desc: &MachineDescriptor) -> Result<StartHooks> {
        let cfg = self.block(desc)?;
        let vm = cfg.vm_name.as_str();
        let vbox = self.vbox();

        if desc.is_first_boot() {
            let payload = std::fs::read_to_string(self.dirs.guest_config_path(&desc.name))?;
            vbox.run_args(&["guestproperty", "set", vm, GUEST_CONFIG_PROPERTY, payload.as_str()])?;
        }

        match vbox.status(vm)? {
            BackendStatus::Paused => vbox.run_args(&["controlvm", vm, "resume"])?,
            _ => vbox.run_args(&["startvm", vm, "--type", "headless"])?,
        };
        tracing::info!(machine = %desc.name, vm, "virtualbox vm launched");

        let vm_name = cfg.vm_name.clone();
        let policy = Backoff::within(self.config.timeouts.ready);
        let post_start: Hook =
            Box::new(move || vbox.wait_for(&vm_name, policy, BackendStatus::Running));
        Ok(StartHooks {
            pre_start: None,
            post_start: Some(post_start),
        })
    }

    fn stop_vm(&self, desc: &MachineDescriptor, hard: bool) -> Result<()> {
        let vm = self.block(desc)?.vm_name.as_str();
        let vbox = self.vbox();
        if vbox.status(vm)? == BackendStatus::Stopped {
            return Ok(());
        }

        let timeout = self.config.timeouts.helper_stop;
        if !hard {
            vbox.run_args(&["controlvm", vm, "acpipowerbutton"])?;
            match vbox.wait_for(vm, Backoff::within(timeout), BackendStatus::Stopped) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(machine = %desc.name, error = %e, "acpi shutdown timed out, powering off")
                }
            }
        }
        vbox.run_args(&["controlvm", vm, "poweroff"])?;
        vbox.wait_for(vm, Backoff::within(timeout), BackendStatus::Stopped)
    }

    fn state(&self, desc: &MachineDescriptor) -> Result<VmState> {
        let cfg = self.block(desc)?;
        self.vbox().status(&cfg.vm_name)?.normalize(&desc.name)
    }

    fn remove(&self, desc: &MachineDescriptor) -> Result<(Vec<String>, Hook)> {
        let cfg = self.block(desc)?.clone();
        let listed = vec![
            format!("VirtualBox VM {}", cfg.vm_name),
            cfg.vdi_path.display().to_string(),
        ];
        let vbox = self.vbox();
        let hook: Hook = Box::new(move || {
            if let Err(e) = vbox.run_args(&["unregistervm", cfg.vm_name.as_str(), "--delete"]) {
                tracing::warn!(vm = %cfg.vm_name, error = %e, "failed to unregister virtualbox vm");
            }
            remove_if_exists(&cfg.vdi_path)
        });
        Ok((listed, hook))
    }

    fn set_attrs(&self, desc: &mut MachineDescriptor, opts: &SetOptions) -> Result<()> {
        require_stopped(self, desc)?;
        if opts.user_mode_networking == Some(true) {
            return Err(Error::not_implemented(VmType::VirtualBox, "user-mode networking"));
        }
        let cfg = self.block(desc)?.clone();

        let mut modify = vec!["modifyvm".to_string(), cfg.vm_name.clone()];
        if let Some(cpus) = opts.cpus {
            modify.extend(["--cpus".to_string(), cpus.to_string()]);
        }
        if let Some(memory) = opts.memory {
            modify.extend(["--memory".to_string(), memory.to_string()]);
        }
        if modify.len() > 2 {
            let vbox = self.vbox();
            vbox.run(vbox.command().args(&modify))?;
        }

        if let Some(size) = opts.disk_size {
            if size > desc.resources.disk_size {
                self.resize(&cfg.vdi_path, size)?;
            }
        }
        Ok(())
    }

    fn requires_exclusive_active(&self) -> bool {
        false
    }

    fn user_mode_networking_supported(&self) -> bool {
        false
    }

    fn start_networking(&self, _desc: &MachineDescriptor, _cmd: &mut HelperCommand) -> Result<()> {
        // NAT port forwarding is configured on the VM itself.
        Ok(())
    }

    fn update_ssh_port(&self, desc: &mut MachineDescriptor, port: u16) -> Result<()> {
        let vm = self.block(desc)?.vm_name.as_str();
        let vbox = self.vbox();
        let rule = ssh_forward_rule(port);
        vbox.run_args(&["modifyvm", vm, "--natpf1", "delete", "SSH"])?;
        vbox.run_args(&["modifyvm", vm, "--natpf1", rule.as_str()])?;
        tracing::info!(machine = %desc.name, port, "updated ssh port forward");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use std::os::unix::fs::PermissionsExt;

    const SHOWVMINFO: &str = "name=\"machina-dev1\"\nostype=\"Fedora (64-bit)\"\nVMState=\"poweroff\"\nVMStateChangeTime=\"2024-01-01T00:00:00.000000000\"\n";

    /// A VBoxManage stand-in keeping the VM state in a file and logging every call.
    struct FakeVBox {
        binary: PathBuf,
        calls: PathBuf,
        state: PathBuf,
    }

    impl FakeVBox {
        fn new(dir: &Path) -> Self {
            let binary = dir.join("VBoxManage");
            let calls = dir.join("vbox.calls");
            let state = dir.join("vbox.state");
            std::fs::write(&state, "poweroff\n").unwrap();
            let script = r#"#!/bin/sh
echo "$@" >> @CALLS@
case "$1" in
  showvminfo) echo "name=\"$2\""; echo "VMState=\"$(cat @STATE@)\"" ;;
  startvm) echo running > @STATE@ ;;
  controlvm) echo poweroff > @STATE@ ;;
  list) echo '"machina-other" {0000}'; echo '"machina-dev1" {1111}' ;;
esac
"#
            .replace("@CALLS@", &calls.display().to_string())
            .replace("@STATE@", &state.display().to_string());
            std::fs::write(&binary, script).unwrap();
            std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
            Self {
                binary,
                calls,
                state,
            }
        }

        fn calls(&self) -> Vec<String> {
            std::fs::read_to_string(&self.calls)
                .unwrap_or_default()
                .lines()
                .map(String::from)
                .collect()
        }

        fn set_state(&self, state: &str) {
            std::fs::write(&self.state, format!("{}\n", state)).unwrap();
        }
    }

    fn provider(root: &Path) -> (VirtualBoxProvider, FakeVBox) {
        let fake = FakeVBox::new(root);
        let mut config = MachinaConfig::default();
        config.helpers.vboxmanage = fake.binary.display().to_string();
        config.timeouts.helper_stop = std::time::Duration::from_millis(200);
        config.timeouts.ready = std::time::Duration::from_millis(500);
        let dirs = testing::dirs(root, VmType::VirtualBox);
        (VirtualBoxProvider::new(dirs, Arc::new(config)), fake)
    }

    fn created(p: &VirtualBoxProvider) -> MachineDescriptor {
        let mut desc = testing::descriptor(p.dirs(), "dev1");
        let cleanup = CleanupCallbacks::new();
        let opts = InitOptions::from_defaults("dev1", &MachinaConfig::default());
        p.create_vm(&opts, &mut desc, &cleanup).unwrap();
        cleanup.disarm();
        desc
    }

    #[test]
    fn test_parse_vm_state() {
        assert_eq!(parse_vm_state(SHOWVMINFO).unwrap().as_deref(), Some("poweroff"));
        assert_eq!(parse_vm_state("name=\"x\"\n").unwrap(), None);
        assert_eq!(
            parse_vm_state("  VMState=\"running\"").unwrap(),
            None,
            "anchored at line start"
        );
    }

    #[test]
    fn test_parse_vbox_state() {
        // (state, expected)
        let cases = [
            ("running", BackendStatus::Running),
            ("paused", BackendStatus::Paused),
            ("starting", BackendStatus::Starting),
            ("poweroff", BackendStatus::Stopped),
            ("saved", BackendStatus::Stopped),
            ("aborted", BackendStatus::Stopped),
        ];
        for (raw, expected) in cases {
            assert_eq!(parse_vbox_state(raw), expected, "{}", raw);
        }
        assert!(matches!(parse_vbox_state("gurumeditation"), BackendStatus::Error(_)));
    }

    #[test]
    fn test_create_registers_and_configures_vm() {
        let tmp = tempfile::tempdir().unwrap();
        let (p, fake) = provider(tmp.path());
        let desc = created(&p);

        let cfg = desc.virtualbox().unwrap();
        assert_eq!(cfg.vm_name, "machina-dev1");
        let calls = fake.calls();
        let verbs: Vec<&str> = calls.iter().filter_map(|c| c.split_whitespace().next()).collect();
        assert_eq!(
            verbs,
            ["createvm", "convertfromraw", "modifymedium", "storagectl", "storageattach", "modifyvm"]
        );
        assert!(calls[2].ends_with("--resize 102400"), "{}", calls[2]);
        assert!(calls[5].contains(&format!("--natpf1 SSH,tcp,127.0.0.1,{},,22", desc.ssh.port)));
    }

    #[test]
    fn test_failed_create_unregisters() {
        let tmp = tempfile::tempdir().unwrap();
        let (p, fake) = provider(tmp.path());
        let mut desc = testing::descriptor(p.dirs(), "dev1");
        let cleanup = CleanupCallbacks::new();
        let opts = InitOptions::from_defaults("dev1", &MachinaConfig::default());
        p.create_vm(&opts, &mut desc, &cleanup).unwrap();

        let outcome: Result<()> = Err(Error::forwarding("later step failed"));
        cleanup.clean_if_err(&outcome);
        assert!(fake.calls().iter().any(|c| c == "unregistervm machina-dev1 --delete"));
    }

    #[test]
    fn test_exists_matches_quoted_name() {
        let tmp = tempfile::tempdir().unwrap();
        let (p, _) = provider(tmp.path());
        assert!(p.exists("dev1").unwrap());
        assert!(!p.exists("dev").unwrap());
    }

    #[test]
    fn test_start_and_stop() {
        let tmp = tempfile::tempdir().unwrap();
        let (p, fake) = provider(tmp.path());
        let mut desc = created(&p);
        desc.touch_last_up();

        let hooks = p.start_vm(&desc).unwrap();
        (hooks.post_start.unwrap())().unwrap();
        assert_eq!(p.state(&desc).unwrap(), VmState::Running);

        p.stop_vm(&desc, true).unwrap();
        assert_eq!(p.state(&desc).unwrap(), VmState::Stopped);
        assert!(fake.calls().iter().any(|c| c == "controlvm machina-dev1 poweroff"));

        let before = fake.calls().len();
        p.stop_vm(&desc, false).unwrap();
        assert_eq!(fake.calls().len(), before + 1, "stopped vm only gets a state query");
    }

    #[test]
    fn test_first_boot_sets_guest_property() {
        let tmp = tempfile::tempdir().unwrap();
        let (p, fake) = provider(tmp.path());
        let desc = created(&p);
        std::fs::write(p.dirs().guest_config_path("dev1"), "{}").unwrap();

        p.start_vm(&desc).unwrap();
        assert!(fake
            .calls()
            .iter()
            .any(|c| c.starts_with("guestproperty set machina-dev1 /Ignition/Config")));
    }

    #[test]
    fn test_set_attrs() {
        let tmp = tempfile::tempdir().unwrap();
        let (p, fake) = provider(tmp.path());
        let mut desc = created(&p);

        let opts = SetOptions {
            cpus: Some(4),
            memory: Some(4096),
            disk_size: Some(200),
            ..SetOptions::default()
        };
        p.set_attrs(&mut desc, &opts).unwrap();
        let calls = fake.calls();
        assert!(calls.iter().any(|c| c == "modifyvm machina-dev1 --cpus 4 --memory 4096"));
        assert!(calls.last().unwrap().ends_with("--resize 204800"));

        let umn = SetOptions {
            user_mode_networking: Some(true),
            ..SetOptions::default()
        };
        assert!(matches!(
            p.set_attrs(&mut desc, &umn).unwrap_err(),
            Error::NotImplemented { .. }
        ));

        fake.set_state("running");
        assert!(matches!(
            p.set_attrs(&mut desc, &opts).unwrap_err(),
            Error::WrongState { .. }
        ));
    }

    #[test]
    fn test_update_ssh_port_rewrites_rule() {
        let tmp = tempfile::tempdir().unwrap();
        let (p, fake) = provider(tmp.path());
        let mut desc = created(&p);
        p.update_ssh_port(&mut desc, 40123).unwrap();
        let calls = fake.calls();
        assert_eq!(calls[calls.len() - 2], "modifyvm machina-dev1 --natpf1 delete SSH");
        assert_eq!(calls[calls.len() - 1], "modifyvm machina-dev1 --natpf1 SSH,tcp,127.0.0.1,40123,,22");
    }

    #[test]
    fn test_remove_unregisters_and_deletes_vdi() {
        let tmp = tempfile::tempdir().unwrap();
        let (p, fake) = provider(tmp.path());
        let desc = created(&p);
        let vdi = desc.virtualbox().unwrap().vdi_path.clone();
        std::fs::write(&vdi, b"disk").unwrap();

        let (listed, hook) = p.remove(&desc).unwrap();
        assert_eq!(listed[0], "VirtualBox VM machina-dev1");
        hook().unwrap();
        assert!(!vdi.exists());
        assert!(fake.calls().iter().any(|c| c == "unregistervm machina-dev1 --delete"));
    }
}
