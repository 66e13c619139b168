//! Test fixtures: temp directory layouts, descriptors, a scriptable backend
//! and fake collaborators.

use crate::cleanup::CleanupCallbacks;
use crate::collab::{
    Collaborators, GuestConfigBuilder, GuestConfigOptions, ImageSource, KeyGenerator,
};
use crate::error::{Error, Result};
use crate::machine::{
    public_key_path, MachineDescriptor, MountType, Resources, SshConfig, VmState, VmType,
};
use crate::network::HelperCommand;
use crate::paths::{BaseDirs, MachineDirs};
use crate::provider::{require_stopped, Hook, InitOptions, Provider, SetOptions, StartHooks};
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Serializes tests that arm the process-wide signal cleanup.
pub(crate) fn serial() -> MutexGuard<'static, ()> {
    static SERIAL: Mutex<()> = Mutex::new(());
    SERIAL.lock()
}

/// Backend directories under `root`, created.
pub(crate) fn dirs(root: &Path, vm_type: VmType) -> MachineDirs {
    let dirs = BaseDirs::under(root).machine_dirs(vm_type);
    dirs.ensure().unwrap();
    dirs
}

/// Descriptor with default sizing, not yet written.
pub(crate) fn descriptor(dirs: &MachineDirs, name: &str) -> MachineDescriptor {
    MachineDescriptor::new(
        dirs,
        name,
        Resources {
            cpus: 1,
            memory: 2048,
            disk_size: 100,
        },
        SshConfig {
            port: 40022,
            identity_path: dirs.identity_path(name),
            remote_username: "core".to_string(),
        },
        dirs.image_path(name),
    )
}

/// Network helper stand-in: creates the `-forward-sock` path and sleeps.
pub(crate) fn fake_helper(dir: &Path) -> PathBuf {
    let path = dir.join("fake-gvproxy");
    let script = r#"#!/bin/sh
while [ $# -gt 0 ]; do
  if [ "$1" = "-forward-sock" ]; then touch "$2"; fi
  shift
done
exec sleep 30
"#;
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// SSH client stand-in: appends the remote command to `ssh.log` in `dir` and
/// fails while `ssh.fail` exists there.
pub(crate) fn fake_ssh(dir: &Path) -> PathBuf {
    let path = dir.join("fake-ssh");
    let script = format!(
        r#"#!/bin/sh
for last; do :; done
printf '%s\n' "$last" >> "{dir}/ssh.log"
if [ -e "{dir}/ssh.fail" ]; then echo "connection refused" >&2; exit 255; fi
exit 0
"#,
        dir = dir.display()
    );
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Shared state of a [`FakeProvider`].
#[derive(Debug, Default)]
pub(crate) struct FakeWorld {
    pub created: BTreeSet<String>,
    pub running: BTreeSet<String>,
    pub networks: BTreeSet<String>,
    pub calls: Vec<String>,
    pub fail_create: bool,
    pub fail_start: bool,
    pub exclusive: bool,
    pub user_mode_networking: bool,
    pub own_network: bool,
    /// Latency of every `state` query.
    pub state_delay: Option<std::time::Duration>,
    /// Backend shares host directories over virtio-fs.
    pub shares: bool,
}

/// In-memory backend with failure injection.
pub(crate) struct FakeProvider {
    vm_type: VmType,
    dirs: MachineDirs,
    pub world: Arc<Mutex<FakeWorld>>,
}

impl FakeProvider {
    pub(crate) fn new(dirs: MachineDirs) -> Self {
        Self {
            vm_type: dirs.vm_type,
            dirs,
            world: Arc::new(Mutex::new(FakeWorld {
                own_network: true,
                ..FakeWorld::default()
            })),
        }
    }

    /// Backend artifact written by `create_vm`.
    pub(crate) fn artifact(&self, name: &str) -> PathBuf {
        self.dirs.data_dir.join(format!("{}.fake", name))
    }

    fn call(&self, what: String) {
        self.world.lock().calls.push(what);
    }
}

impl Provider for FakeProvider {
    fn vm_type(&self) -> VmType {
        self.vm_type
    }

    fn dirs(&self) -> &MachineDirs {
        &self.dirs
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.world.lock().created.contains(name))
    }

    fn create_vm(
        &self,
        _opts: &InitOptions,
        desc: &mut MachineDescriptor,
        cleanup: &CleanupCallbacks,
    ) -> Result<()> {
        self.call(format!("create {}", desc.name));
        let world = self.world.clone();
        let name = desc.name.clone();
        cleanup.add(format!("forget {}", name), move || {
            world.lock().created.remove(&name);
            Ok(())
        });
        self.world.lock().created.insert(desc.name.clone());

        let artifact = self.artifact(&desc.name);
        cleanup.add_remove_file(artifact.clone());
        std::fs::write(&artifact, b"vm")?;

        if self.world.lock().fail_create {
            return Err(Error::command_failed("fake", "create failed"));
        }
        Ok(())
    }

    fn start_vm(&self, desc: &MachineDescriptor) -> Result<StartHooks> {
        self.call(format!("start {}", desc.name));
        if self.world.lock().fail_start {
            return Err(Error::command_failed("fake", "start failed"));
        }
        self.world.lock().running.insert(desc.name.clone());

        let pre = self.world.clone();
        let post = self.world.clone();
        let (a, b) = (desc.name.clone(), desc.name.clone());
        Ok(StartHooks {
            pre_start: Some(Box::new(move || {
                pre.lock().calls.push(format!("pre_start {}", a));
                Ok(())
            })),
            post_start: Some(Box::new(move || {
                post.lock().calls.push(format!("post_start {}", b));
                Ok(())
            })),
        })
    }

    fn stop_vm(&self, desc: &MachineDescriptor, hard: bool) -> Result<()> {
        self.call(format!("stop {} hard={}", desc.name, hard));
        self.world.lock().running.remove(&desc.name);
        Ok(())
    }

    fn state(&self, desc: &MachineDescriptor) -> Result<VmState> {
        let delay = self.world.lock().state_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if self.world.lock().running.contains(&desc.name) {
            Ok(VmState::Running)
        } else {
            Ok(VmState::Stopped)
        }
    }

    fn remove(&self, desc: &MachineDescriptor) -> Result<(Vec<String>, Hook)> {
        let artifact = self.artifact(&desc.name);
        let world = self.world.clone();
        let name = desc.name.clone();
        let hook: Hook = Box::new(move || {
            world.lock().created.remove(&name);
            crate::cleanup::remove_if_exists(&artifact)
        });
        Ok((vec![format!("fake vm {}", desc.name)], hook))
    }

    fn set_attrs(&self, desc: &mut MachineDescriptor, _opts: &SetOptions) -> Result<()> {
        require_stopped(self, desc)?;
        self.call(format!("set {}", desc.name));
        Ok(())
    }

    fn requires_exclusive_active(&self) -> bool {
        self.world.lock().exclusive
    }

    fn user_mode_networking_supported(&self) -> bool {
        self.world.lock().user_mode_networking
    }

    fn mount_type(&self) -> MountType {
        if self.world.lock().shares {
            MountType::VirtioFs
        } else {
            MountType::None
        }
    }

    fn use_provider_network_setup(&self) -> bool {
        self.world.lock().own_network
    }

    fn start_networking(&self, desc: &MachineDescriptor, cmd: &mut HelperCommand) -> Result<()> {
        self.call(format!("start_networking {}", desc.name));
        if !self.world.lock().own_network {
            cmd.add_qemu_socket(format!("unix://{}", self.dirs.network_socket(&desc.name).display()));
        }
        self.world.lock().networks.insert(desc.name.clone());
        Ok(())
    }

    fn stop_networking(&self, desc: &MachineDescriptor) -> Result<()> {
        self.call(format!("stop_networking {}", desc.name));
        self.world.lock().networks.remove(&desc.name);
        Ok(())
    }
}

/// Writes a private key and its public half.
pub(crate) struct FakeKeys;

impl KeyGenerator for FakeKeys {
    fn generate(&self, identity: &Path) -> Result<String> {
        if let Some(parent) = identity.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(identity, b"private")?;
        std::fs::write(public_key_path(identity), b"ssh-ed25519 FAKE\n")?;
        Ok("ssh-ed25519 FAKE".to_string())
    }
}

/// Writes a placeholder image; runs `on_acquire` first when set.
#[derive(Default)]
pub(crate) struct FakeImages {
    pub on_acquire: Option<Box<dyn Fn() -> Result<()> + Send + Sync>>,
}

impl ImageSource for FakeImages {
    fn acquire(&self, _image: &str, dest: &Path) -> Result<PathBuf> {
        if let Some(hook) = &self.on_acquire {
            hook()?;
        }
        std::fs::write(dest, b"image")?;
        Ok(dest.to_path_buf())
    }
}

/// Returns a fixed payload, or fails.
pub(crate) struct FakeGuestConfig {
    pub fail: bool,
}

impl GuestConfigBuilder for FakeGuestConfig {
    fn build(&self, opts: &GuestConfigOptions) -> Result<Vec<u8>> {
        if self.fail {
            return Err(Error::Config("guest config generation failed".to_string()));
        }
        Ok(format!("{{\"host\":\"{}\"}}", opts.name).into_bytes())
    }
}

/// Fake collaborators that always succeed.
pub(crate) fn collaborators() -> Collaborators {
    Collaborators {
        guest_config: Box::new(FakeGuestConfig { fail: false }),
        images: Box::new(FakeImages::default()),
        keys: Box::new(FakeKeys),
    }
}
