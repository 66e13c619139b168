//! Machine identity, backend kinds and lifecycle states.

pub mod descriptor;
pub mod mount;

pub use descriptor::{
    public_key_path, AppleHvConfig, HostUser, MachineDescriptor, Preserve, ProviderConfig,
    QemuConfig, Resources, SshConfig, VirtualBoxConfig, WslConfig,
};
pub use mount::{parse_volumes, Mount, MountType};

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Hypervisor backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmType {
    /// Apple Virtualization.framework driven through the vfkit helper process.
    #[serde(rename = "applehv")]
    AppleHv,
    /// Windows Subsystem for Linux distribution.
    Wsl,
    /// QEMU driven through its command line and QMP socket.
    Qemu,
    /// Oracle VirtualBox driven through VBoxManage.
    #[serde(rename = "vbox")]
    VirtualBox,
}

impl VmType {
    /// Every backend kind, in registry order.
    pub const ALL: [VmType; 4] = [VmType::AppleHv, VmType::Wsl, VmType::Qemu, VmType::VirtualBox];

    /// Get the backend name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            VmType::AppleHv => "applehv",
            VmType::Wsl => "wsl",
            VmType::Qemu => "qemu",
            VmType::VirtualBox => "vbox",
        }
    }

    /// The backend used when nothing is configured.
    pub fn platform_default() -> Self {
        if cfg!(target_os = "macos") {
            VmType::AppleHv
        } else if cfg!(target_os = "windows") {
            VmType::Wsl
        } else {
            VmType::Qemu
        }
    }

    /// Disk image file extension used by the backend.
    pub fn image_extension(&self) -> &'static str {
        match self {
            VmType::AppleHv => "raw",
            VmType::Wsl => "tar",
            VmType::Qemu => "qcow2",
            VmType::VirtualBox => "raw",
        }
    }
}

impl std::fmt::Display for VmType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for VmType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "applehv" | "vfkit" => Ok(VmType::AppleHv),
            "wsl" => Ok(VmType::Wsl),
            "qemu" => Ok(VmType::Qemu),
            "vbox" | "virtualbox" => Ok(VmType::VirtualBox),
            other => Err(Error::Config(format!("unknown machine provider: {}", other))),
        }
    }
}

/// Live lifecycle state of a machine. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    /// Powered off, or the control endpoint is unreachable.
    Stopped,
    /// Launched but the control endpoint has not yet reported running.
    Starting,
    /// Running.
    Running,
}

impl VmState {
    /// Get the state name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            VmState::Stopped => "stopped",
            VmState::Starting => "starting",
            VmState::Running => "running",
        }
    }

    /// Running or on its way there.
    pub fn is_active(&self) -> bool {
        matches!(self, VmState::Running | VmState::Starting)
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// State as reported by a backend before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendStatus {
    /// Powered off.
    Stopped,
    /// Booting.
    Starting,
    /// Running.
    Running,
    /// Suspended by the hypervisor.
    Paused,
    /// Hypervisor reports a failure.
    Error(String),
}

impl BackendStatus {
    /// Normalize to a lifecycle state: paused counts as running, error is terminal.
    pub fn normalize(self, machine: &str) -> Result<VmState> {
        match self {
            BackendStatus::Stopped => Ok(VmState::Stopped),
            BackendStatus::Starting => Ok(VmState::Starting),
            BackendStatus::Running | BackendStatus::Paused => Ok(VmState::Running),
            BackendStatus::Error(reason) => Err(Error::VmFailed {
                machine: machine.to_string(),
                reason,
            }),
        }
    }
}

/// Validate a machine name.
///
/// Names become file names, socket names and hypervisor instance names.
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 30
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "invalid machine name {:?}: use up to 30 letters, digits, '-', '_' or '.'",
            name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_type_round_trips_through_name() {
        for vm_type in VmType::ALL {
            let parsed: VmType = vm_type.name().parse().unwrap();
            assert_eq!(parsed, vm_type, "{:?}.name()", vm_type);
        }
        assert_eq!("VirtualBox".parse::<VmType>().unwrap(), VmType::VirtualBox);
        assert!("hyperv".parse::<VmType>().is_err());
    }

    #[test]
    fn test_backend_status_normalization() {
        // (reported, expected)
        let cases = [
            (BackendStatus::Stopped, VmState::Stopped),
            (BackendStatus::Starting, VmState::Starting),
            (BackendStatus::Running, VmState::Running),
            (BackendStatus::Paused, VmState::Running),
        ];
        for (status, expected) in cases {
            let label = format!("{:?}", status);
            assert_eq!(status.normalize("dev1").unwrap(), expected, "{}", label);
        }

        let err = BackendStatus::Error("guest panicked".into())
            .normalize("dev1")
            .unwrap_err();
        assert!(matches!(err, Error::VmFailed { .. }));
    }

    #[test]
    fn test_vm_state_is_active() {
        let cases = [
            (VmState::Stopped, false),
            (VmState::Starting, true),
            (VmState::Running, true),
        ];
        for (state, active) in cases {
            assert_eq!(state.is_active(), active, "{:?}.is_active()", state);
        }
    }

    #[test]
    fn test_validate_name() {
        for ok in ["dev1", "machina-default", "a.b_c"] {
            assert!(validate_name(ok).is_ok(), "{} should be valid", ok);
        }
        for bad in ["", "-dev", "has space", "x/y", "n".repeat(31).as_str()] {
            assert!(validate_name(bad).is_err(), "{:?} should be invalid", bad);
        }
    }
}
