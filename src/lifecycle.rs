//! Machine lifecycle orchestration.
//!
//! [`MachineManager`] sequences descriptor persistence, backend calls and
//! network forwarding for every lifecycle operation, enforcing the state
//! guards and rolling back partially completed sequences.
//!
//! ```text
//! NotExist --init--> Stopped --start--> Running --stop--> Stopped --rm--> NotExist
//! ```
//!
//! `Starting` is observable while a start is in flight: the descriptor's
//! starting flag is set and the backend does not yet report running.

use crate::alloc;
use crate::cleanup::{remove_if_exists, CleanupCallbacks};
use crate::collab::{Collaborators, GuestConfigOptions};
use crate::config::MachinaConfig;
use crate::error::{Error, Result, StepContext};
use crate::lock::FileLock;
use crate::machine::{
    parse_volumes, public_key_path, validate_name, MachineDescriptor, Mount, MountType, Preserve,
    Resources, SshConfig, VmState, VmType,
};
use crate::network::{self, HelperCommand};
use crate::paths::{BaseDirs, MachineDirs};
use crate::provider::{Hook, InitOptions, Provider, ProviderRegistry, SetOptions};
use crate::retry::Backoff;
use crate::ssh;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

/// Options for [`MachineManager::remove`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveOptions {
    /// Stop a running machine instead of refusing.
    pub force: bool,
    /// Resources to keep.
    pub preserve: Preserve,
}

/// One row of `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MachineSummary {
    /// Machine name.
    pub name: String,
    /// Backend kind.
    pub vm_type: VmType,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Last start or stop, if ever started.
    pub last_up: Option<DateTime<Utc>>,
    /// Live state.
    pub state: VmState,
    /// Virtual CPUs.
    #[serde(rename = "CPUs")]
    pub cpus: u64,
    /// Memory in MiB.
    pub memory: u64,
    /// Disk size in GiB.
    pub disk_size: u64,
    /// Host SSH port.
    pub port: u16,
    /// SSH identity.
    pub identity_path: PathBuf,
    /// Guest user.
    pub remote_username: String,
    /// User-mode networking in effect.
    pub user_mode_networking: bool,
}

/// Result of `inspect`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MachineInfo {
    /// Persisted descriptor.
    pub descriptor: MachineDescriptor,
    /// Live state.
    pub state: VmState,
    /// Machine-specific API socket.
    pub api_socket: PathBuf,
    /// Guest-config payload.
    pub guest_config: PathBuf,
}

/// Two-phase removal: review [`RemovalPlan::confirmation_text`], then
/// [`RemovalPlan::execute`].
///
/// The machine stays locked until the plan is executed or dropped.
pub struct RemovalPlan {
    provider: Arc<dyn Provider>,
    desc: MachineDescriptor,
    config: Arc<MachinaConfig>,
    running: bool,
    resources: Vec<String>,
    files: Vec<PathBuf>,
    hook: Hook,
    _lock: FileLock,
}

impl std::fmt::Debug for RemovalPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemovalPlan")
            .field("machine", &self.desc.name)
            .field("running", &self.running)
            .field("resources", &self.resources)
            .field("files", &self.files)
            .finish_non_exhaustive()
    }
}

impl RemovalPlan {
    /// Machine being removed.
    pub fn name(&self) -> &str {
        &self.desc.name
    }

    /// Files that will be deleted.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Backend resources that will be deleted.
    pub fn resources(&self) -> &[String] {
        &self.resources
    }

    /// Human-readable list of everything removal deletes.
    pub fn confirmation_text(&self) -> String {
        let mut text = String::from("The following files will be deleted:\n\n");
        for file in &self.files {
            text.push_str(&format!("{}\n", file.display()));
        }
        for resource in &self.resources {
            text.push_str(&format!("{}\n", resource));
        }
        text
    }

    /// Stop the machine if needed, then delete its backend resources and files.
    ///
    /// Every file is attempted; the first failure is returned.
    pub fn execute(self) -> Result<()> {
        let name = self.desc.name.clone();
        if self.running {
            if let Err(e) = stop_network(self.provider.as_ref(), &self.desc, &self.config) {
                tracing::warn!(machine = %name, error = %e, "failed to stop networking");
            }
            self.provider.stop_vm(&self.desc, false).step(&name, "stop vm")?;
        }

        (self.hook)().step(&name, "remove vm")?;

        let mut first = None;
        for file in &self.files {
            if let Err(e) = remove_if_exists(file) {
                tracing::warn!(machine = %name, file = %file.display(), error = %e, "failed to remove file");
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => {
                tracing::info!(machine = %name, "machine removed");
                Ok(())
            }
        }
    }
}

/// Lifecycle orchestrator over a provider registry.
pub struct MachineManager {
    config: Arc<MachinaConfig>,
    registry: ProviderRegistry,
    collab: Collaborators,
}

impl std::fmt::Debug for MachineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineManager")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl MachineManager {
    /// Orchestrator over explicit parts.
    pub fn new(
        config: Arc<MachinaConfig>,
        registry: ProviderRegistry,
        collab: Collaborators,
    ) -> Self {
        Self {
            config,
            registry,
            collab,
        }
    }

    /// Orchestrator with every backend and the default collaborators.
    pub fn from_config(base: &BaseDirs, config: MachinaConfig) -> Result<Self> {
        let registry = ProviderRegistry::from_config(base, &config)?;
        let collab = Collaborators::defaults(&config);
        Ok(Self::new(Arc::new(config), registry, collab))
    }

    /// Backends known to this manager.
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Backend holding a descriptor for `name`, default backend first.
    fn find(&self, name: &str) -> Result<Arc<dyn Provider>> {
        validate_name(name)?;
        let default = self.registry.default_provider();
        std::iter::once(default.clone())
            .chain(
                self.registry
                    .all()
                    .iter()
                    .filter(|p| p.vm_type() != default.vm_type())
                    .cloned(),
            )
            .find(|p| MachineDescriptor::exists(p.dirs(), name))
            .ok_or_else(|| Error::NoSuchVm(name.to_string()))
    }

    /// Lock `name` and load its descriptor.
    fn open(
        provider: &Arc<dyn Provider>,
        name: &str,
    ) -> Result<(MachineDescriptor, FileLock)> {
        let lock = FileLock::acquire(provider.dirs().lock_path(name))?;
        let desc = MachineDescriptor::load(provider.dirs(), name)?;
        Ok((desc, lock))
    }

    /// Create a machine on the default backend.
    ///
    /// On any failure every resource created so far is removed before the
    /// error is returned, also when a termination signal interrupts.
    pub fn init(&self, opts: &InitOptions) -> Result<MachineDescriptor> {
        validate_name(&opts.name)?;
        let provider = self.registry.default_provider();
        let dirs = provider.dirs().clone();
        dirs.ensure()?;
        let _lock = FileLock::acquire(dirs.lock_path(&opts.name))?;

        let taken = self
            .registry
            .all()
            .iter()
            .any(|p| MachineDescriptor::exists(p.dirs(), &opts.name));
        if taken || provider.exists(&opts.name)? {
            return Err(Error::VmAlreadyExists(opts.name.clone()));
        }
        if opts.user_mode_networking && !provider.user_mode_networking_supported() {
            return Err(Error::not_implemented(
                provider.vm_type(),
                "user-mode networking",
            ));
        }
        let mounts = volume_mounts(provider.as_ref(), &opts.volumes)?;

        let cleanup = CleanupCallbacks::new();
        let _signals = cleanup.arm_signals();
        let outcome = self.provision(provider.as_ref(), &dirs, opts, mounts, &cleanup);
        cleanup.clean_if_err(&outcome);
        cleanup.disarm();
        outcome
    }

    fn provision(
        &self,
        provider: &dyn Provider,
        dirs: &MachineDirs,
        opts: &InitOptions,
        mounts: Vec<Mount>,
        cleanup: &CleanupCallbacks,
    ) -> Result<MachineDescriptor> {
        let name = opts.name.as_str();
        let port = alloc::free_port()?;

        let identity = dirs.identity_path(name);
        if !identity.exists() {
            cleanup.add_remove_file(identity.clone());
            cleanup.add_remove_file(public_key_path(&identity));
        }
        let public_key = self
            .collab
            .keys
            .generate(&identity)
            .step(name, "generate ssh key")?;

        let image_dest = dirs.image_path(name);
        cleanup.add_remove_file(image_dest.clone());
        let image_path = self
            .collab
            .images
            .acquire(&opts.image, &image_dest)
            .step(name, "acquire image")?;

        let mut desc = MachineDescriptor::new(
            dirs,
            name,
            Resources {
                cpus: opts.cpus,
                memory: opts.memory,
                disk_size: opts.disk_size,
            },
            SshConfig {
                port,
                identity_path: identity,
                remote_username: opts.username.clone(),
            },
            image_path,
        );
        desc.host_user.rootful = opts.rootful;
        desc.mounts = mounts;

        provider
            .create_vm(opts, &mut desc, cleanup)
            .step(name, "create vm")?;

        let payload = self
            .collab
            .guest_config
            .build(&GuestConfigOptions {
                name: name.to_string(),
                user: opts.username.clone(),
                public_key,
                rootful: opts.rootful,
            })
            .step(name, "build guest config")?;
        let guest_config = dirs.guest_config_path(name);
        cleanup.add_remove_file(guest_config.clone());
        std::fs::write(&guest_config, payload)?;

        cleanup.add_remove_file(desc.path().to_path_buf());
        desc.write().step(name, "write descriptor")?;

        tracing::info!(
            machine = %name,
            vm_type = %provider.vm_type(),
            port,
            "machine created"
        );
        Ok(desc)
    }

    /// Live state of `name`.
    pub fn state(&self, name: &str) -> Result<VmState> {
        let provider = self.find(name)?;
        let desc = MachineDescriptor::load(provider.dirs(), name)?;
        state_of(provider.as_ref(), &desc)
    }

    /// Start a stopped machine and wait until the guest is ready.
    pub fn start(&self, name: &str) -> Result<MachineDescriptor> {
        let provider = self.find(name)?;
        let (mut desc, _lock) = Self::open(&provider, name)?;

        if state_of(provider.as_ref(), &desc)?.is_active() {
            return Err(Error::VmAlreadyRunning(name.to_string()));
        }
        // Held until the starting flag is on disk so two starts cannot both
        // pass the single-active check.
        let exclusive = if provider.requires_exclusive_active() {
            Some(FileLock::acquire(provider.dirs().start_lock_path())?)
        } else {
            None
        };
        if exclusive.is_some() {
            for (other, other_desc) in MachineDescriptor::load_all(provider.dirs())? {
                if other != name && state_of(provider.as_ref(), &other_desc)?.is_active() {
                    return Err(Error::MultipleActiveVm {
                        vm_type: provider.vm_type().to_string(),
                        active: other,
                    });
                }
            }
        }

        let (port, changed) = alloc::ensure_port(desc.ssh.port)?;
        if changed {
            provider
                .update_ssh_port(&mut desc, port)
                .step(name, "update ssh port")?;
            desc.ssh.port = port;
        }

        desc.starting = true;
        desc.write()?;
        drop(exclusive);

        let outcome = self.boot(&provider, &desc);
        desc.starting = false;
        if outcome.is_ok() {
            desc.touch_last_up();
        }
        let written = desc.write();
        if let (Err(_), Err(e)) = (&outcome, &written) {
            tracing::warn!(machine = %name, error = %e, "failed to clear starting flag");
        }
        outcome?;
        written?;

        tracing::info!(machine = %name, port = desc.ssh.port, "machine started");
        Ok(desc)
    }

    /// Networking, launch, then the backend's hooks. Rolled back on failure.
    fn boot(&self, provider: &Arc<dyn Provider>, desc: &MachineDescriptor) -> Result<()> {
        let name = desc.name.as_str();
        let cleanup = CleanupCallbacks::new();
        let _signals = cleanup.arm_signals();

        let outcome = (|| -> Result<()> {
            self.start_network(provider, desc, &cleanup)?;

            let hooks = provider.start_vm(desc).step(name, "start vm")?;
            let (p, d) = (provider.clone(), desc.clone());
            cleanup.add(format!("stop {}", name), move || p.stop_vm(&d, true));

            if let Some(pre_start) = hooks.pre_start {
                pre_start().step(name, "pre-start")?;
            }
            if let Some(post_start) = hooks.post_start {
                post_start().step(name, "wait for ready")?;
            }

            self.wait_for_ssh(provider.as_ref(), desc)
                .step(name, "wait for ssh")?;
            self.mount_volumes(provider.as_ref(), desc)
                .step(name, "mount volumes")?;
            Ok(())
        })();

        cleanup.clean_if_err(&outcome);
        cleanup.disarm();
        outcome
    }

    /// Retry an SSH login until the guest accepts it. A machine that stops
    /// meanwhile keeps failing until the attempts run out.
    fn wait_for_ssh(&self, provider: &dyn Provider, desc: &MachineDescriptor) -> Result<()> {
        let binary = self.config.helpers.resolve(&self.config.helpers.ssh);
        let timeouts = &self.config.timeouts;
        Backoff::new(timeouts.ssh_ready_attempts, timeouts.ssh_ready_backoff).retry(
            "ssh login",
            || {
                let state = provider.state(desc)?;
                if state != VmState::Running {
                    return Err(Error::wrong_state(&desc.name, "running", state));
                }
                ssh::run(&binary, desc, "true")
            },
        )?;
        tracing::debug!(machine = %desc.name, port = desc.ssh.port, "ssh ready");
        Ok(())
    }

    /// Mount every shared directory in the guest.
    fn mount_volumes(&self, provider: &dyn Provider, desc: &MachineDescriptor) -> Result<()> {
        let mount_type = provider.mount_type();
        let binary = self.config.helpers.resolve(&self.config.helpers.ssh);
        for mount in &desc.mounts {
            let Some(script) = mount.guest_command(mount_type) else {
                continue;
            };
            ssh::run(&binary, desc, &script).map_err(|e| {
                Error::mount(format!(
                    "{} on {}: {}",
                    mount.tag,
                    mount.target.display(),
                    e
                ))
            })?;
            tracing::info!(
                machine = %desc.name,
                source = %mount.source.display(),
                target = %mount.target.display(),
                "volume mounted"
            );
        }
        Ok(())
    }

    fn start_network(
        &self,
        provider: &Arc<dyn Provider>,
        desc: &MachineDescriptor,
        cleanup: &CleanupCallbacks,
    ) -> Result<()> {
        let name = desc.name.as_str();
        let (p, d, config) = (provider.clone(), desc.clone(), self.config.clone());
        cleanup.add(format!("stop networking for {}", name), move || {
            stop_network(p.as_ref(), &d, &config)
        });

        let helper = self.config.helpers.resolve(&self.config.helpers.forwarder);
        let mut cmd = HelperCommand::new(helper);
        provider
            .start_networking(desc, &mut cmd)
            .step(name, "start networking")?;
        if !provider.use_provider_network_setup() {
            let state = network::start_forwarding(desc, provider.dirs(), &self.config, cmd)
                .step(name, "start api forwarding")?;
            tracing::debug!(machine = %name, mode = %state.mode, "forwarding established");
        }
        Ok(())
    }

    /// Stop a machine. Stopping a stopped machine is a no-op.
    pub fn stop(&self, name: &str, hard: bool) -> Result<()> {
        let provider = self.find(name)?;
        let (mut desc, _lock) = Self::open(&provider, name)?;

        if state_of(provider.as_ref(), &desc)? == VmState::Stopped {
            tracing::debug!(machine = %name, "already stopped");
            return Ok(());
        }

        if let Err(e) = stop_network(provider.as_ref(), &desc, &self.config) {
            tracing::warn!(machine = %name, error = %e, "failed to stop networking");
        }
        provider.stop_vm(&desc, hard).step(name, "stop vm")?;

        desc.starting = false;
        desc.touch_last_up();
        desc.write()?;
        tracing::info!(machine = %name, hard, "machine stopped");
        Ok(())
    }

    /// Plan the removal of `name`. Nothing is deleted until the plan runs.
    pub fn remove(&self, name: &str, opts: RemoveOptions) -> Result<RemovalPlan> {
        let provider = self.find(name)?;
        self.plan_removal(provider, name, opts)
    }

    fn plan_removal(
        &self,
        provider: Arc<dyn Provider>,
        name: &str,
        opts: RemoveOptions,
    ) -> Result<RemovalPlan> {
        let (desc, lock) = Self::open(&provider, name)?;
        let state = state_of(provider.as_ref(), &desc)?;
        if state.is_active() && !opts.force {
            return Err(Error::wrong_state(name, "stopped", state));
        }

        let (resources, hook) = provider.remove(&desc).step(name, "plan removal")?;
        let files = desc.dependent_files(provider.dirs(), opts.preserve);
        Ok(RemovalPlan {
            provider,
            desc,
            config: self.config.clone(),
            running: state.is_active(),
            resources,
            files,
            hook,
            _lock: lock,
        })
    }

    /// Change settings of a stopped machine.
    pub fn set(&self, name: &str, opts: &SetOptions) -> Result<MachineDescriptor> {
        let provider = self.find(name)?;
        let (mut desc, _lock) = Self::open(&provider, name)?;
        if opts.is_empty() {
            return Ok(desc);
        }

        let state = state_of(provider.as_ref(), &desc)?;
        if state != VmState::Stopped {
            return Err(Error::wrong_state(name, "stopped", state));
        }
        if opts.user_mode_networking == Some(true) && !provider.user_mode_networking_supported() {
            return Err(Error::not_implemented(
                provider.vm_type(),
                "user-mode networking",
            ));
        }
        let mounts = opts
            .volumes
            .as_deref()
            .map(|volumes| volume_mounts(provider.as_ref(), volumes))
            .transpose()?;
        if let Some(size) = opts.disk_size {
            if size < desc.resources.disk_size {
                return Err(Error::NewDiskSizeTooSmall {
                    current: desc.resources.disk_size,
                    requested: size,
                });
            }
        }

        provider
            .set_attrs(&mut desc, opts)
            .step(name, "set attributes")?;

        if let Some(cpus) = opts.cpus {
            desc.resources.cpus = cpus;
        }
        if let Some(memory) = opts.memory {
            desc.resources.memory = memory;
        }
        if let Some(size) = opts.disk_size {
            desc.resources.disk_size = size;
        }
        if let Some(rootful) = opts.rootful {
            desc.set_rootful(rootful);
        }
        if let Some(mounts) = mounts {
            desc.mounts = mounts;
        }
        desc.write()?;
        tracing::info!(machine = %name, ?opts, "machine updated");
        Ok(desc)
    }

    /// Every machine of every backend.
    pub fn list(&self) -> Result<Vec<MachineSummary>> {
        let mut rows = Vec::new();
        for provider in self.registry.all() {
            for (name, desc) in MachineDescriptor::load_all(provider.dirs())? {
                let state = match state_of(provider.as_ref(), &desc) {
                    Ok(state) => state,
                    Err(e) => {
                        tracing::warn!(machine = %name, error = %e, "could not query state");
                        VmState::Stopped
                    }
                };
                let user_mode_networking = provider.user_mode_networking_supported()
                    && desc.wsl().map_or(true, |w| w.user_mode_networking);
                rows.push(MachineSummary {
                    name,
                    vm_type: provider.vm_type(),
                    created: desc.created,
                    last_up: (!desc.is_first_boot()).then_some(desc.last_up),
                    state,
                    cpus: desc.resources.cpus,
                    memory: desc.resources.memory,
                    disk_size: desc.resources.disk_size,
                    port: desc.ssh.port,
                    identity_path: desc.ssh.identity_path.clone(),
                    remote_username: desc.ssh.remote_username.clone(),
                    user_mode_networking,
                });
            }
        }
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }

    /// Descriptor and live state of `name`.
    pub fn inspect(&self, name: &str) -> Result<MachineInfo> {
        let provider = self.find(name)?;
        let desc = MachineDescriptor::load(provider.dirs(), name)?;
        let state = state_of(provider.as_ref(), &desc)?;
        Ok(MachineInfo {
            api_socket: provider.dirs().api_socket(name),
            guest_config: provider.dirs().guest_config_path(name),
            descriptor: desc,
            state,
        })
    }

    /// Stop and remove every machine of every backend, then delete the
    /// backends' directories. Every step is attempted; the first failure is
    /// returned.
    pub fn reset(&self) -> Result<()> {
        let mut errors = Vec::new();
        for provider in self.registry.all() {
            let machines = match MachineDescriptor::load_all(provider.dirs()) {
                Ok(machines) => machines,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            for name in machines.keys() {
                let force = RemoveOptions {
                    force: true,
                    preserve: Preserve::default(),
                };
                let removed = self
                    .plan_removal(provider.clone(), name, force)
                    .and_then(RemovalPlan::execute);
                if let Err(e) = removed {
                    tracing::warn!(machine = %name, error = %e, "reset: removal failed");
                    errors.push(e);
                }
            }

            let dirs = provider.dirs();
            for dir in [&dirs.config_dir, &dirs.data_dir, &dirs.runtime_dir] {
                match std::fs::remove_dir_all(dir) {
                    Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                        tracing::warn!(dir = %dir.display(), error = %e, "reset: cannot remove directory");
                        errors.push(e.into());
                    }
                    _ => {}
                }
            }
        }

        match errors.into_iter().next() {
            Some(e) => Err(e),
            None => {
                tracing::info!("all machines removed");
                Ok(())
            }
        }
    }
}

/// Backend state, reporting `Starting` while a start is in flight.
fn state_of(provider: &dyn Provider, desc: &MachineDescriptor) -> Result<VmState> {
    let state = provider.state(desc).step(&desc.name, "query state")?;
    if state == VmState::Stopped && desc.starting {
        return Ok(VmState::Starting);
    }
    Ok(state)
}

/// Parse volume specifications for a backend that can share directories.
fn volume_mounts(provider: &dyn Provider, volumes: &[String]) -> Result<Vec<Mount>> {
    if volumes.is_empty() {
        return Ok(Vec::new());
    }
    if provider.mount_type() == MountType::None {
        return Err(Error::not_implemented(provider.vm_type(), "volume mounts"));
    }
    parse_volumes(volumes)
}

/// Tear down forwarding and backend-owned networking.
fn stop_network(
    provider: &dyn Provider,
    desc: &MachineDescriptor,
    config: &MachinaConfig,
) -> Result<()> {
    if !provider.use_provider_network_setup() {
        network::stop_forwarding(desc, provider.dirs(), config)?;
    }
    provider.stop_networking(desc)
}
