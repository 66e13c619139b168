//! On-disk layout for machine descriptors, images and runtime sockets.

use crate::error::Result;
use crate::machine::VmType;
use std::path::{Path, PathBuf};

/// Application directory name under the platform config/data/runtime roots.
const APP_NAME: &str = "machina";

/// Root directories shared by every backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseDirs {
    /// Configuration root (`~/.config/machina`).
    pub config: PathBuf,
    /// Data root (`~/.local/share/machina`).
    pub data: PathBuf,
    /// Runtime root (`$XDG_RUNTIME_DIR/machina`).
    pub runtime: PathBuf,
}

impl BaseDirs {
    /// Resolve the platform directories.
    pub fn from_env() -> Self {
        let config = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(APP_NAME);
        let data = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(APP_NAME);
        let runtime = dirs::runtime_dir()
            .or_else(dirs::cache_dir)
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(APP_NAME);
        Self {
            config,
            data,
            runtime,
        }
    }

    /// Place every root under a single directory.
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            config: root.join("config"),
            data: root.join("data"),
            runtime: root.join("run"),
        }
    }

    /// Directories for one backend kind.
    pub fn machine_dirs(&self, vm_type: VmType) -> MachineDirs {
        MachineDirs {
            vm_type,
            config_dir: self.config.join("machine").join(vm_type.name()),
            data_dir: self.data.join("machine").join(vm_type.name()),
            runtime_dir: self.runtime.join(vm_type.name()),
            ssh_dir: self.data.join("machine").join("ssh"),
        }
    }

    /// Path of the global configuration file.
    pub fn config_file(&self) -> PathBuf {
        self.config.join(format!("{}.toml", APP_NAME))
    }
}

/// Backend-namespaced directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineDirs {
    /// Backend owning this namespace.
    pub vm_type: VmType,
    /// Descriptor files and guest-config payloads.
    pub config_dir: PathBuf,
    /// Disk images and backend artifacts.
    pub data_dir: PathBuf,
    /// Sockets, PID records and logs.
    pub runtime_dir: PathBuf,
    /// SSH identities (shared by all backends).
    pub ssh_dir: PathBuf,
}

impl MachineDirs {
    /// Create every directory.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            &self.config_dir,
            &self.data_dir,
            &self.runtime_dir,
            &self.ssh_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Descriptor file for a machine.
    pub fn descriptor_path(&self, name: &str) -> PathBuf {
        self.config_dir.join(format!("{}.json", name))
    }

    /// Guest-config payload for a machine.
    pub fn guest_config_path(&self, name: &str) -> PathBuf {
        self.config_dir.join(format!("{}.ign", name))
    }

    /// SSH private key for a machine; the public key sits next to it with `.pub`.
    pub fn identity_path(&self, name: &str) -> PathBuf {
        self.ssh_dir.join(name)
    }

    /// Disk image for a machine.
    pub fn image_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!(
            "{}-{}.{}",
            name,
            std::env::consts::ARCH,
            self.vm_type.image_extension()
        ))
    }

    /// Machine-specific API forwarding socket.
    pub fn api_socket(&self, name: &str) -> PathBuf {
        self.runtime_dir.join(format!("{}-api.sock", name))
    }

    /// Network helper's VM-side endpoint.
    pub fn network_socket(&self, name: &str) -> PathBuf {
        self.runtime_dir.join(format!("{}-gvproxy.sock", name))
    }

    /// PID record of the network helper.
    pub fn forwarder_pid_file(&self, name: &str) -> PathBuf {
        self.runtime_dir.join(format!("{}-gvproxy.pid", name))
    }

    /// Log file of the network helper.
    pub fn forwarder_log(&self, name: &str) -> PathBuf {
        self.runtime_dir.join(format!("{}-gvproxy.log", name))
    }

    /// Socket the guest signals readiness on.
    pub fn ready_socket(&self, name: &str) -> PathBuf {
        self.runtime_dir.join(format!("{}-ready.sock", name))
    }

    /// Socket serving the guest-config payload on first boot.
    pub fn guest_config_socket(&self, name: &str) -> PathBuf {
        self.runtime_dir.join(format!("{}-ignition.sock", name))
    }

    /// Per-machine advisory lock file.
    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.runtime_dir.join(format!("{}.lock", name))
    }

    /// Backend-wide lock serializing starts when only one machine may run.
    /// Machine names start alphanumeric, so this never shadows a machine lock.
    pub fn start_lock_path(&self) -> PathBuf {
        self.runtime_dir.join(".start.lock")
    }

    /// Marker directory for the shared user-mode network.
    pub fn network_markers_dir(&self) -> PathBuf {
        self.data_dir.join("umn-markers")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_dirs_are_backend_namespaced() {
        let base = BaseDirs::under("/root");
        let qemu = base.machine_dirs(VmType::Qemu);
        let wsl = base.machine_dirs(VmType::Wsl);

        assert_eq!(qemu.config_dir, PathBuf::from("/root/config/machine/qemu"));
        assert_eq!(wsl.config_dir, PathBuf::from("/root/config/machine/wsl"));
        assert_ne!(qemu.descriptor_path("dev1"), wsl.descriptor_path("dev1"));
        assert_eq!(qemu.ssh_dir, wsl.ssh_dir, "identities are shared");
    }

    #[test]
    fn test_derived_paths_use_machine_name() {
        let dirs = BaseDirs::under("/root").machine_dirs(VmType::AppleHv);
        assert_eq!(
            dirs.descriptor_path("dev1"),
            PathBuf::from("/root/config/machine/applehv/dev1.json")
        );
        assert_eq!(
            dirs.api_socket("dev1"),
            PathBuf::from("/root/run/applehv/dev1-api.sock")
        );
        assert_eq!(
            dirs.start_lock_path(),
            PathBuf::from("/root/run/applehv/.start.lock")
        );
        assert_ne!(dirs.start_lock_path(), dirs.lock_path("start"));
        assert!(dirs
            .image_path("dev1")
            .to_string_lossy()
            .ends_with(".raw"));
    }

    #[test]
    fn test_ensure_creates_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = BaseDirs::under(tmp.path()).machine_dirs(VmType::Qemu);
        dirs.ensure().unwrap();
        assert!(dirs.config_dir.is_dir());
        assert!(dirs.data_dir.is_dir());
        assert!(dirs.runtime_dir.is_dir());
        assert!(dirs.ssh_dir.is_dir());
    }
}
