//! Persistent machine descriptor.
//!
//! One pretty-printed JSON file per machine, stored in the backend's config
//! directory. Reading a descriptor written before `Created` existed fills the
//! timestamp from the file's modification time and rewrites the file.

use super::{Mount, VmType};
use crate::error::{Error, Result};
use crate::paths::MachineDirs;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Current descriptor schema version.
pub const DESCRIPTOR_VERSION: u32 = 1;

/// Durable record of one machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MachineDescriptor {
    /// Schema version.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Unique machine name.
    pub name: String,
    /// CPU, memory and disk sizing.
    pub resources: Resources,
    /// SSH reachability.
    #[serde(rename = "SSH")]
    pub ssh: SshConfig,
    /// Host user the machine runs on behalf of.
    #[serde(default)]
    pub host_user: HostUser,
    /// Local disk image.
    pub image_path: PathBuf,
    /// Image stream or provenance tag.
    #[serde(default)]
    pub image_stream: String,
    /// Host directories shared into the guest.
    #[serde(default)]
    pub mounts: Vec<Mount>,
    /// When the descriptor was first written.
    #[serde(default = "unset_timestamp")]
    pub created: DateTime<Utc>,
    /// Last transition to running or stopped.
    #[serde(default = "unset_timestamp")]
    pub last_up: DateTime<Utc>,
    /// Set while a start is in progress.
    #[serde(default)]
    pub starting: bool,
    /// Backend-specific block.
    #[serde(rename = "Hypervisor")]
    pub provider: ProviderConfig,

    #[serde(skip)]
    path: PathBuf,
}

/// Machine sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// Number of virtual CPUs.
    #[serde(rename = "CPUs")]
    pub cpus: u64,
    /// Memory in MiB.
    #[serde(rename = "Memory")]
    pub memory: u64,
    /// Disk size in GiB. Never shrinks.
    #[serde(rename = "DiskSize")]
    pub disk_size: u64,
}

/// SSH access to the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SshConfig {
    /// Host port forwarded to the guest's sshd.
    pub port: u16,
    /// Private key used to log in.
    pub identity_path: PathBuf,
    /// Guest user.
    pub remote_username: String,
}

/// Host-side user settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostUser {
    /// Forward the rootful engine socket instead of the user socket.
    pub rootful: bool,
    /// Host uid, used for the rootless guest socket path.
    #[serde(rename = "UID")]
    pub uid: u32,
    /// Rootful was changed after creation.
    pub modified: bool,
}

/// Backend sub-descriptor. Exactly one variant exists per descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum ProviderConfig {
    /// vfkit helper process.
    #[serde(rename = "applehv")]
    AppleHv(AppleHvConfig),
    /// WSL distribution.
    #[serde(rename = "wsl")]
    Wsl(WslConfig),
    /// QEMU process.
    #[serde(rename = "qemu")]
    Qemu(QemuConfig),
    /// VirtualBox VM.
    #[serde(rename = "vbox")]
    VirtualBox(VirtualBoxConfig),
}

impl ProviderConfig {
    /// Backend kind of this block.
    pub fn vm_type(&self) -> VmType {
        match self {
            ProviderConfig::AppleHv(_) => VmType::AppleHv,
            ProviderConfig::Wsl(_) => VmType::Wsl,
            ProviderConfig::Qemu(_) => VmType::Qemu,
            ProviderConfig::VirtualBox(_) => VmType::VirtualBox,
        }
    }

    /// Empty block for a backend, filled in by `create_vm`.
    pub fn empty(vm_type: VmType) -> Self {
        match vm_type {
            VmType::AppleHv => ProviderConfig::AppleHv(AppleHvConfig::default()),
            VmType::Wsl => ProviderConfig::Wsl(WslConfig::default()),
            VmType::Qemu => ProviderConfig::Qemu(QemuConfig::default()),
            VmType::VirtualBox => ProviderConfig::VirtualBox(VirtualBoxConfig::default()),
        }
    }
}

/// vfkit settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AppleHvConfig {
    /// REST control endpoint, e.g. `http://localhost:41235`.
    pub endpoint: String,
    /// `--device` arguments passed to vfkit.
    #[serde(default)]
    pub devices: Vec<String>,
    /// EFI variable store.
    #[serde(default)]
    pub efi_store: PathBuf,
    /// Serial console log.
    #[serde(default)]
    pub log_path: PathBuf,
}

/// WSL settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WslConfig {
    /// Registered distribution name.
    pub distribution: String,
    /// Directory holding the distribution's virtual disk.
    #[serde(default)]
    pub install_dir: PathBuf,
    /// Use the shared user-mode network distribution.
    #[serde(default)]
    pub user_mode_networking: bool,
}

/// QEMU settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QemuConfig {
    /// QMP control socket.
    pub qmp_socket: PathBuf,
    /// PID file written by QEMU.
    pub pid_file: PathBuf,
    /// Serial console log.
    #[serde(default)]
    pub log_path: PathBuf,
}

/// VirtualBox settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VirtualBoxConfig {
    /// Registered VM name.
    pub vm_name: String,
    /// Converted disk image.
    pub vdi_path: PathBuf,
}

fn default_version() -> u32 {
    DESCRIPTOR_VERSION
}

/// Sentinel for "never set".
pub(crate) fn unset_timestamp() -> DateTime<Utc> {
    DateTime::<Utc>::from(std::time::UNIX_EPOCH)
}

/// Current uid of the host user.
pub(crate) fn current_uid() -> u32 {
    #[cfg(unix)]
    {
        unsafe { libc::getuid() }
    }
    #[cfg(not(unix))]
    {
        1000
    }
}

/// Files a removal may delete, with per-resource preserve flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Preserve {
    /// Keep the SSH identity.
    pub keys: bool,
    /// Keep the guest-config payload.
    pub guest_config: bool,
    /// Keep the disk image.
    pub image: bool,
}

impl MachineDescriptor {
    /// Build a fresh descriptor. `created` is set now and never changes.
    pub fn new(
        dirs: &MachineDirs,
        name: impl Into<String>,
        resources: Resources,
        ssh: SshConfig,
        image_path: PathBuf,
    ) -> Self {
        let name = name.into();
        let now = Utc::now();
        Self {
            version: DESCRIPTOR_VERSION,
            path: dirs.descriptor_path(&name),
            name,
            resources,
            ssh,
            host_user: HostUser {
                rootful: false,
                uid: current_uid(),
                modified: false,
            },
            image_path,
            image_stream: String::new(),
            mounts: Vec::new(),
            created: now,
            last_up: unset_timestamp(),
            starting: false,
            provider: ProviderConfig::empty(dirs.vm_type),
        }
    }

    /// Whether a descriptor file exists for the name.
    pub fn exists(dirs: &MachineDirs, name: &str) -> bool {
        dirs.descriptor_path(name).exists()
    }

    /// Load a descriptor, migrating it if needed.
    pub fn load(dirs: &MachineDirs, name: &str) -> Result<Self> {
        let path = dirs.descriptor_path(name);
        Self::load_path(&path, dirs.vm_type).map_err(|e| match e {
            Error::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                Error::NoSuchVm(name.to_string())
            }
            other => other,
        })
    }

    fn load_path(path: &Path, vm_type: VmType) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let mut desc: MachineDescriptor =
            serde_json::from_slice(&bytes).map_err(|e| Error::Descriptor {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        desc.path = path.to_path_buf();

        if desc.provider.vm_type() != vm_type {
            return Err(Error::Descriptor {
                path: path.to_path_buf(),
                message: format!(
                    "hypervisor block is {} but the descriptor lives in the {} namespace",
                    desc.provider.vm_type(),
                    vm_type
                ),
            });
        }

        if desc.created == unset_timestamp() {
            let modified = std::fs::metadata(path)?.modified()?;
            desc.created = DateTime::<Utc>::from(modified);
            tracing::info!(
                machine = %desc.name,
                created = %desc.created,
                "migrating descriptor without creation time"
            );
            desc.write()?;
        }

        Ok(desc)
    }

    /// Load every descriptor in the backend's namespace, keyed by name.
    ///
    /// Unreadable descriptors are logged and skipped.
    pub fn load_all(dirs: &MachineDirs) -> Result<BTreeMap<String, Self>> {
        let mut out = BTreeMap::new();
        let entries = match std::fs::read_dir(&dirs.config_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::load_path(&path, dirs.vm_type) {
                Ok(desc) => {
                    out.insert(desc.name.clone(), desc);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable descriptor");
                }
            }
        }
        Ok(out)
    }

    /// Persist the descriptor atomically.
    pub fn write(&self) -> Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| Error::Descriptor {
                path: self.path.clone(),
                message: "descriptor path has no parent".into(),
            })?;
        std::fs::create_dir_all(dir)?;

        let json = serde_json::to_vec_pretty(self)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&json)?;
        tmp.write_all(b"\n")?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        tracing::debug!(machine = %self.name, path = %self.path.display(), "wrote descriptor");
        Ok(())
    }

    /// Path of the descriptor file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Backend kind of this machine.
    pub fn vm_type(&self) -> VmType {
        self.provider.vm_type()
    }

    /// The machine has never been started.
    pub fn is_first_boot(&self) -> bool {
        self.last_up == unset_timestamp()
    }

    /// Record a transition to running or stopped.
    pub fn touch_last_up(&mut self) {
        self.last_up = Utc::now();
    }

    /// Toggle rootful mode.
    pub fn set_rootful(&mut self, rootful: bool) {
        if self.host_user.rootful != rootful {
            self.host_user.rootful = rootful;
            self.host_user.modified = true;
        }
    }

    /// Guest engine socket that the API forwarder targets.
    pub fn guest_api_socket(&self) -> String {
        if self.host_user.rootful {
            "/run/podman/podman.sock".to_string()
        } else {
            format!("/run/user/{}/podman/podman.sock", self.host_user.uid)
        }
    }

    /// Files removed together with this machine, honoring `preserve`.
    pub fn dependent_files(&self, dirs: &MachineDirs, preserve: Preserve) -> Vec<PathBuf> {
        let mut files = Vec::new();
        if !preserve.keys {
            files.push(self.ssh.identity_path.clone());
            files.push(public_key_path(&self.ssh.identity_path));
        }
        if !preserve.guest_config {
            files.push(dirs.guest_config_path(&self.name));
        }
        if !preserve.image {
            files.push(self.image_path.clone());
        }
        files.push(self.path.clone());
        files.push(dirs.api_socket(&self.name));
        files.push(dirs.ready_socket(&self.name));
        files.push(dirs.forwarder_pid_file(&self.name));
        files.push(dirs.forwarder_log(&self.name));
        files
    }

    /// Sub-descriptor accessors.
    pub fn apple_hv(&self) -> Option<&AppleHvConfig> {
        match &self.provider {
            ProviderConfig::AppleHv(c) => Some(c),
            _ => None,
        }
    }

    /// WSL block, if this is a WSL machine.
    pub fn wsl(&self) -> Option<&WslConfig> {
        match &self.provider {
            ProviderConfig::Wsl(c) => Some(c),
            _ => None,
        }
    }

    /// QEMU block, if this is a QEMU machine.
    pub fn qemu(&self) -> Option<&QemuConfig> {
        match &self.provider {
            ProviderConfig::Qemu(c) => Some(c),
            _ => None,
        }
    }

    /// VirtualBox block, if this is a VirtualBox machine.
    pub fn virtualbox(&self) -> Option<&VirtualBoxConfig> {
        match &self.provider {
            ProviderConfig::VirtualBox(c) => Some(c),
            _ => None,
        }
    }

    /// Sub-descriptor of the wrong kind.
    pub(crate) fn mismatch(&self, expected: VmType) -> Error {
        Error::Descriptor {
            path: self.path.clone(),
            message: format!(
                "expected a {} hypervisor block, found {}",
                expected,
                self.provider.vm_type()
            ),
        }
    }
}

/// Public half of an SSH identity.
pub fn public_key_path(identity: &Path) -> PathBuf {
    let mut s = identity.as_os_str().to_owned();
    s.push(".pub");
    PathBuf::from(s)
}
