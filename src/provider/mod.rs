//! Backend capability contract.
//!
//! Every hypervisor backend implements [`Provider`]. The backend for a host
//! is chosen once at startup from a [`ProviderRegistry`] and dispatched
//! through a trait object afterwards.

pub mod applehv;
pub mod qemu;
pub mod vbox;
pub mod wsl;

pub use applehv::AppleHvProvider;
pub use qemu::QemuProvider;
pub use vbox::VirtualBoxProvider;
pub use wsl::WslProvider;

use crate::cleanup::CleanupCallbacks;
use crate::config::MachinaConfig;
use crate::error::{Error, Result};
use crate::machine::{MachineDescriptor, MountType, VmState, VmType};
use crate::network::HelperCommand;
use crate::paths::{BaseDirs, MachineDirs};
use std::path::PathBuf;
use std::sync::Arc;

/// Deferred, fallible action returned by a backend.
pub type Hook = Box<dyn FnOnce() -> Result<()> + Send>;

/// Hooks returned by [`Provider::start_vm`] after the VM was launched.
///
/// The orchestrator runs `pre_start`, then `post_start`, before it records
/// the machine as up.
#[derive(Default)]
pub struct StartHooks {
    /// Runs right after launch, e.g. releasing the process handle.
    pub pre_start: Option<Hook>,
    /// Bounded wait for the guest to report ready.
    pub post_start: Option<Hook>,
}

impl std::fmt::Debug for StartHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartHooks")
            .field("pre_start", &self.pre_start.is_some())
            .field("post_start", &self.post_start.is_some())
            .finish()
    }
}

/// Options for creating a machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitOptions {
    /// Machine name.
    pub name: String,
    /// Virtual CPUs.
    pub cpus: u64,
    /// Memory in MiB.
    pub memory: u64,
    /// Disk size in GiB.
    pub disk_size: u64,
    /// Disk image reference passed to the image source.
    pub image: String,
    /// Guest login user.
    pub username: String,
    /// Forward the rootful engine socket.
    pub rootful: bool,
    /// Use shared user-mode networking where supported.
    pub user_mode_networking: bool,
    /// Host directories to share, as `SOURCE[:TARGET[:ro]]`.
    pub volumes: Vec<String>,
}

impl InitOptions {
    /// Options for `name` with the configured defaults.
    pub fn from_defaults(name: impl Into<String>, config: &MachinaConfig) -> Self {
        let defaults = &config.machine;
        Self {
            name: name.into(),
            cpus: defaults.cpus,
            memory: defaults.memory,
            disk_size: defaults.disk_size,
            image: defaults.image.clone(),
            username: defaults.user.clone(),
            rootful: defaults.rootful,
            user_mode_networking: defaults.user_mode_networking,
            volumes: Vec::new(),
        }
    }
}

/// Changes requested by `set`. `None` leaves a setting untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Virtual CPUs.
    pub cpus: Option<u64>,
    /// Memory in MiB.
    pub memory: Option<u64>,
    /// Disk size in GiB; can only grow.
    pub disk_size: Option<u64>,
    /// Rootful engine socket.
    pub rootful: Option<bool>,
    /// Shared user-mode networking.
    pub user_mode_networking: Option<bool>,
    /// Replacement volume list, as `SOURCE[:TARGET[:ro]]`.
    pub volumes: Option<Vec<String>>,
}

impl SetOptions {
    /// Nothing requested.
    pub fn is_empty(&self) -> bool {
        *self == SetOptions::default()
    }
}

/// Capabilities every hypervisor backend provides.
pub trait Provider: Send + Sync {
    /// Backend kind.
    fn vm_type(&self) -> VmType;

    /// Directories of this backend's namespace.
    fn dirs(&self) -> &MachineDirs;

    /// Whether the hypervisor itself already knows `name`.
    fn exists(&self, name: &str) -> Result<bool>;

    /// Allocate backend resources and fill the descriptor's hypervisor block.
    ///
    /// Undo actions must be registered before each irreversible step.
    fn create_vm(
        &self,
        opts: &InitOptions,
        desc: &mut MachineDescriptor,
        cleanup: &CleanupCallbacks,
    ) -> Result<()>;

    /// Launch the VM and return the hooks to run before declaring it started.
    fn start_vm(&self, desc: &MachineDescriptor) -> Result<StartHooks>;

    /// Stop the VM. Succeeds when it is already stopped.
    fn stop_vm(&self, desc: &MachineDescriptor, hard: bool) -> Result<()>;

    /// Live state. An unreachable control endpoint means stopped.
    fn state(&self, desc: &MachineDescriptor) -> Result<VmState>;

    /// Backend resources removal will delete, and the deferred deletion.
    fn remove(&self, desc: &MachineDescriptor) -> Result<(Vec<String>, Hook)>;

    /// Apply backend-side changes. Only valid while stopped.
    fn set_attrs(&self, desc: &mut MachineDescriptor, opts: &SetOptions) -> Result<()>;

    /// Only one machine of this backend may run at a time.
    fn requires_exclusive_active(&self) -> bool;

    /// Backend can use user-mode networking.
    fn user_mode_networking_supported(&self) -> bool;

    /// How host directories reach the guest. `None` rejects volumes.
    fn mount_type(&self) -> MountType {
        MountType::None
    }

    /// Backend sets up networking itself instead of the per-machine helper.
    fn use_provider_network_setup(&self) -> bool {
        false
    }

    /// Add the backend's endpoint to the helper, or start backend-owned networking.
    fn start_networking(&self, desc: &MachineDescriptor, cmd: &mut HelperCommand) -> Result<()>;

    /// Tear down backend-owned networking.
    fn stop_networking(&self, _desc: &MachineDescriptor) -> Result<()> {
        Ok(())
    }

    /// Re-point the backend at a new host SSH port.
    fn update_ssh_port(&self, _desc: &mut MachineDescriptor, _port: u16) -> Result<()> {
        Ok(())
    }
}

/// Fail with `WrongState` unless the machine is stopped.
pub(crate) fn require_stopped(provider: &dyn Provider, desc: &MachineDescriptor) -> Result<()> {
    let state = provider.state(desc)?;
    if state != VmState::Stopped {
        return Err(Error::wrong_state(&desc.name, "stopped", state));
    }
    Ok(())
}

/// Grow a raw disk image to `gib`. Shrinking is refused.
pub(crate) fn grow_raw_image(path: &std::path::Path, gib: u64) -> Result<()> {
    let bytes = gib.saturating_mul(1024 * 1024 * 1024);
    let file = std::fs::OpenOptions::new().write(true).open(path)?;
    let current = file.metadata()?.len();
    if bytes < current {
        return Err(Error::NewDiskSizeTooSmall {
            current: current / (1024 * 1024 * 1024),
            requested: gib,
        });
    }
    tracing::debug!(path = %path.display(), bytes, "resizing disk image");
    file.set_len(bytes)?;
    Ok(())
}

/// Hook deleting `files`, ignoring ones already gone.
pub(crate) fn remove_files_hook(files: Vec<PathBuf>) -> Hook {
    Box::new(move || {
        for file in &files {
            crate::cleanup::remove_if_exists(file)?;
        }
        Ok(())
    })
}

/// Every backend known to this build, constructed once at startup.
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
    default: VmType,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<VmType> = self.providers.iter().map(|p| p.vm_type()).collect();
        f.debug_struct("ProviderRegistry")
            .field("providers", &kinds)
            .field("default", &self.default)
            .finish()
    }
}

impl ProviderRegistry {
    /// Registry over explicit providers. `default` must be one of them.
    pub fn new(providers: Vec<Arc<dyn Provider>>, default: VmType) -> Result<Self> {
        if !providers.iter().any(|p| p.vm_type() == default) {
            return Err(Error::Config(format!("no provider registered for {}", default)));
        }
        Ok(Self { providers, default })
    }

    /// Every backend, rooted at `base`, defaulting to the configured kind.
    pub fn from_config(base: &BaseDirs, config: &MachinaConfig) -> Result<Self> {
        let config = Arc::new(config.clone());
        let providers: Vec<Arc<dyn Provider>> = vec![
            Arc::new(AppleHvProvider::new(
                base.machine_dirs(VmType::AppleHv),
                config.clone(),
            )),
            Arc::new(WslProvider::new(base.machine_dirs(VmType::Wsl), config.clone())),
            Arc::new(QemuProvider::new(base.machine_dirs(VmType::Qemu), config.clone())),
            Arc::new(VirtualBoxProvider::new(
                base.machine_dirs(VmType::VirtualBox),
                config.clone(),
            )),
        ];
        Self::new(providers, config.vm_type())
    }

    /// The host's selected backend.
    pub fn default_provider(&self) -> Arc<dyn Provider> {
        self.get(self.default)
            .unwrap_or_else(|| self.providers[0].clone())
    }

    /// Backend of a given kind.
    pub fn get(&self, vm_type: VmType) -> Option<Arc<dyn Provider>> {
        self.providers
            .iter()
            .find(|p| p.vm_type() == vm_type)
            .cloned()
    }

    /// Every registered backend.
    pub fn all(&self) -> &[Arc<dyn Provider>] {
        &self.providers
    }
}
