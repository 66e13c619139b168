//! Global machina configuration.
//!
//! Read from `machina.toml` under the config root. A missing file yields the
//! defaults; every field is optional so older files keep loading.

use crate::error::{Error, Result};
use crate::machine::VmType;
use crate::paths::BaseDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides the configured provider.
pub const PROVIDER_ENV: &str = "MACHINA_PROVIDER";

/// Global machina configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MachinaConfig {
    /// Backend override; platform default when unset.
    pub provider: Option<VmType>,
    /// Defaults for new machines.
    pub machine: MachineDefaults,
    /// External helper binaries.
    pub helpers: HelperBinaries,
    /// API forwarding settings.
    pub network: NetworkSettings,
    /// Bounded waits.
    pub timeouts: Timeouts,
}

/// Defaults applied by `init`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineDefaults {
    /// Virtual CPUs.
    pub cpus: u64,
    /// Memory in MiB.
    pub memory: u64,
    /// Disk size in GiB.
    pub disk_size: u64,
    /// Guest login user.
    pub user: String,
    /// Disk image reference.
    pub image: String,
    /// Forward the rootful engine socket.
    pub rootful: bool,
    /// Use shared user-mode networking where supported.
    pub user_mode_networking: bool,
}

impl Default for MachineDefaults {
    fn default() -> Self {
        Self {
            cpus: 1,
            memory: 2048,
            disk_size: 100,
            user: "core".to_string(),
            image: String::new(),
            rootful: false,
            user_mode_networking: false,
        }
    }
}

/// Paths or names of external tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperBinaries {
    /// User-mode network and API forwarding helper.
    pub forwarder: String,
    /// Windows named-pipe SSH proxy.
    pub win_sshproxy: String,
    /// vfkit.
    pub vfkit: String,
    /// QEMU system emulator.
    pub qemu: String,
    /// QEMU image tool.
    pub qemu_img: String,
    /// VirtualBox CLI.
    pub vboxmanage: String,
    /// WSL CLI.
    pub wsl: String,
    /// Key generator.
    pub ssh_keygen: String,
    /// SSH client for readiness checks and guest mounts.
    pub ssh: String,
    /// Extra directories searched before `PATH`.
    pub search_dirs: Vec<PathBuf>,
}

impl Default for HelperBinaries {
    fn default() -> Self {
        let qemu = match std::env::consts::ARCH {
            "aarch64" => "qemu-system-aarch64",
            _ => "qemu-system-x86_64",
        };
        Self {
            forwarder: "gvproxy".to_string(),
            win_sshproxy: "win-sshproxy".to_string(),
            vfkit: "vfkit".to_string(),
            qemu: qemu.to_string(),
            qemu_img: "qemu-img".to_string(),
            vboxmanage: "VBoxManage".to_string(),
            wsl: "wsl".to_string(),
            ssh_keygen: "ssh-keygen".to_string(),
            ssh: "ssh".to_string(),
            search_dirs: vec![
                PathBuf::from("/opt/homebrew/bin"),
                PathBuf::from("/usr/local/bin"),
                PathBuf::from("/usr/libexec/podman"),
                PathBuf::from("/usr/local/libexec/podman"),
            ],
        }
    }
}

impl HelperBinaries {
    /// Resolve a helper: absolute paths are taken as-is, otherwise the search
    /// directories are tried before falling back to `PATH` lookup at spawn.
    pub fn resolve(&self, binary: &str) -> PathBuf {
        let path = Path::new(binary);
        if path.is_absolute() || binary.contains(std::path::MAIN_SEPARATOR) {
            return path.to_path_buf();
        }
        self.search_dirs
            .iter()
            .map(|dir| dir.join(binary))
            .find(|candidate| candidate.is_file())
            .unwrap_or_else(|| path.to_path_buf())
    }
}

/// API forwarding settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// System-wide default API socket alias; claimed by the first machine to start.
    pub default_socket_alias: Option<PathBuf>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        let alias = if cfg!(unix) {
            Some(PathBuf::from("/var/run/docker.sock"))
        } else {
            None
        };
        Self {
            default_socket_alias: alias,
        }
    }
}

/// Bounded waits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Guest readiness after launch.
    #[serde(with = "duration_str")]
    pub ready: Duration,
    /// Grace period before a helper is force-killed.
    #[serde(with = "duration_str")]
    pub helper_stop: Duration,
    /// Interval between forwarding socket checks.
    #[serde(with = "duration_str")]
    pub socket_poll_interval: Duration,
    /// Number of forwarding socket checks.
    pub socket_poll_attempts: u32,
    /// SSH login attempts after the guest reports ready.
    pub ssh_ready_attempts: u32,
    /// First delay between SSH login attempts; doubles each retry.
    #[serde(with = "duration_str")]
    pub ssh_ready_backoff: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ready: Duration::from_secs(90),
            helper_stop: Duration::from_secs(10),
            socket_poll_interval: Duration::from_millis(100),
            socket_poll_attempts: 10,
            ssh_ready_attempts: 6,
            ssh_ready_backoff: Duration::from_millis(500),
        }
    }
}

mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

impl MachinaConfig {
    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    pub fn load() -> Result<Self> {
        let path = BaseDirs::from_env().config_file();
        let mut config = Self::load_from(&path)?;
        config.apply_env(std::env::var(PROVIDER_ENV).ok().as_deref())?;
        Ok(config)
    }

    /// Load configuration from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text)
                .map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::ConfigLoad(format!("{}: {}", path.display(), e))),
        }
    }

    /// Save configuration to an explicit path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::ConfigSave(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::ConfigSave(e.to_string()))?;
        }
        std::fs::write(path, text).map_err(|e| Error::ConfigSave(e.to_string()))
    }

    fn apply_env(&mut self, provider: Option<&str>) -> Result<()> {
        if let Some(raw) = provider.filter(|p| !p.trim().is_empty()) {
            self.provider = Some(raw.parse()?);
        }
        Ok(())
    }

    /// Backend selected for this host.
    pub fn vm_type(&self) -> VmType {
        self.provider.unwrap_or_else(VmType::platform_default)
    }
}
