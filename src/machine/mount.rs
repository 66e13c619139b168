//! Host directories shared into the guest.
//!
//! Volumes are given as `SOURCE[:TARGET[:ro|rw]]`. Each one gets a device tag
//! `vol<index>` that ties the backend's share device to the guest mount.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How a backend exposes host directories to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountType {
    /// virtio-fs share device.
    VirtioFs,
    /// 9p over virtio.
    NineP,
    /// Backend cannot share directories.
    None,
}

impl MountType {
    /// Filesystem type for `mount -t` in the guest.
    pub fn fs_type(&self) -> Option<&'static str> {
        match self {
            MountType::VirtioFs => Some("virtiofs"),
            MountType::NineP => Some("9p"),
            MountType::None => None,
        }
    }
}

/// One host directory shared into the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Mount {
    /// Canonical host directory.
    pub source: PathBuf,
    /// Absolute guest path.
    pub target: PathBuf,
    /// Device tag shared by the backend device and the guest mount.
    pub tag: String,
    /// Mount read-only in the guest.
    #[serde(default)]
    pub read_only: bool,
}

impl Mount {
    /// Shell command run in the guest to mount this share, or `None` when
    /// the backend has no share device.
    pub fn guest_command(&self, mount_type: MountType) -> Option<String> {
        let fs_type = mount_type.fs_type()?;
        let mut options = Vec::new();
        if mount_type == MountType::NineP {
            options.push("trans=virtio");
            options.push("version=9p2000.L");
        }
        if self.read_only {
            options.push("ro");
        }
        let target = shell_quote(&self.target.to_string_lossy());
        let mut command = format!(
            "sudo mkdir -p {target} && sudo mount -t {fs_type}",
            target = target,
            fs_type = fs_type
        );
        if !options.is_empty() {
            command.push_str(" -o ");
            command.push_str(&options.join(","));
        }
        command.push(' ');
        command.push_str(&shell_quote(&self.tag));
        command.push(' ');
        command.push_str(&target);
        Some(command)
    }
}

/// Parse volume specifications into mounts tagged `vol0`, `vol1`, ...
pub fn parse_volumes(specs: &[String]) -> Result<Vec<Mount>> {
    specs
        .iter()
        .enumerate()
        .map(|(i, spec)| parse_volume(spec, format!("vol{}", i)))
        .collect()
}

/// Parse a single `SOURCE[:TARGET[:ro|rw]]` specification.
///
/// The target defaults to the source path. The source must be an existing
/// directory and is canonicalized.
fn parse_volume(spec: &str, tag: String) -> Result<Mount> {
    let parts: Vec<&str> = spec.split(':').collect();
    if parts.len() > 3 || parts[0].is_empty() {
        return Err(Error::mount(format!(
            "invalid volume specification '{}': expected source[:target[:ro]]",
            spec
        )));
    }

    let source = PathBuf::from(parts[0]);
    if !source.exists() {
        return Err(Error::MountSourceNotFound { path: source });
    }
    if !source.is_dir() {
        return Err(Error::mount(format!(
            "volume source must be a directory: {}",
            source.display()
        )));
    }
    let source = source.canonicalize().map_err(|e| {
        Error::mount(format!("failed to resolve volume source '{}': {}", parts[0], e))
    })?;

    let target = match parts.get(1) {
        Some(target) if !target.is_empty() => PathBuf::from(target),
        _ => source.clone(),
    };
    if !target.is_absolute() {
        return Err(Error::mount(format!(
            "volume target must be absolute: {}",
            target.display()
        )));
    }

    let read_only = match parts.get(2).copied() {
        None | Some("rw") => false,
        Some("ro") => true,
        Some(other) => {
            return Err(Error::mount(format!(
                "unknown volume option '{}' in '{}'",
                other, spec
            )))
        }
    };

    Ok(Mount {
        source,
        target,
        tag,
        read_only,
    })
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_volumes_assigns_tags() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().canonicalize().unwrap();
        let specs = vec![
            format!("{}", src.display()),
            format!("{}:/work:ro", src.display()),
        ];

        let mounts = parse_volumes(&specs).unwrap();
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].tag, "vol0");
        assert_eq!(mounts[0].target, src, "target defaults to source");
        assert!(!mounts[0].read_only);
        assert_eq!(mounts[1].tag, "vol1");
        assert_eq!(mounts[1].target, PathBuf::from("/work"));
        assert!(mounts[1].read_only);
    }

    #[test]
    fn test_parse_volume_rejects_bad_specs() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("file");
        std::fs::write(&file, "x").unwrap();
        let dir = tmp.path().display().to_string();

        let missing = parse_volumes(&[format!("{}/nope:/x", dir)]).unwrap_err();
        assert!(matches!(missing, Error::MountSourceNotFound { .. }), "{}", missing);

        for spec in [
            format!("{}:/x", file.display()),
            format!("{}:relative", dir),
            format!("{}:/x:bogus", dir),
            format!("{}:/x:ro:extra", dir),
            ":/x".to_string(),
        ] {
            let err = parse_volumes(&[spec.clone()]).unwrap_err();
            assert!(matches!(err, Error::Mount(_)), "{}: {}", spec, err);
        }
    }

    #[test]
    fn test_guest_command_per_mount_type() {
        let mount = Mount {
            source: PathBuf::from("/Users/me/src"),
            target: PathBuf::from("/mnt/my src"),
            tag: "vol0".into(),
            read_only: true,
        };

        assert_eq!(
            mount.guest_command(MountType::VirtioFs).unwrap(),
            "sudo mkdir -p '/mnt/my src' && sudo mount -t virtiofs -o ro 'vol0' '/mnt/my src'"
        );
        assert_eq!(
            mount.guest_command(MountType::NineP).unwrap(),
            "sudo mkdir -p '/mnt/my src' && sudo mount -t 9p -o trans=virtio,version=9p2000.L,ro 'vol0' '/mnt/my src'"
        );
        assert!(mount.guest_command(MountType::None).is_none());
    }

    #[test]
    fn test_mount_serializes_pascal_case() {
        let mount = Mount {
            source: PathBuf::from("/src"),
            target: PathBuf::from("/dst"),
            tag: "vol0".into(),
            read_only: false,
        };
        let json = serde_json::to_value(&mount).unwrap();
        assert_eq!(json["Source"], "/src");
        assert_eq!(json["Tag"], "vol0");
        assert_eq!(json["ReadOnly"], false);
    }
}
