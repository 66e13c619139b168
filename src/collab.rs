//! External collaborators the orchestrator consumes: guest-config payload
//! generation, disk-image acquisition and SSH key generation.
//!
//! All three are synchronous and fallible. Their filesystem side effects are
//! registered for rollback by the caller.

use crate::config::MachinaConfig;
use crate::error::{Error, Result};
use crate::machine::public_key_path;
use crate::process;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Inputs for a first-boot guest-config payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestConfigOptions {
    /// Machine name, used as the guest hostname.
    pub name: String,
    /// Guest login user.
    pub user: String,
    /// Authorized public key.
    pub public_key: String,
    /// Also authorize the key for root.
    pub rootful: bool,
}

/// Produces the opaque first-boot payload.
pub trait GuestConfigBuilder: Send + Sync {
    /// Build the payload bytes.
    fn build(&self, opts: &GuestConfigOptions) -> Result<Vec<u8>>;
}

/// Makes a disk image available locally.
pub trait ImageSource: Send + Sync {
    /// Materialize `image` at `dest` and return the local path.
    fn acquire(&self, image: &str, dest: &Path) -> Result<PathBuf>;
}

/// Creates SSH identities.
pub trait KeyGenerator: Send + Sync {
    /// Ensure a key pair at `identity` and return the public key.
    fn generate(&self, identity: &Path) -> Result<String>;
}

/// The three collaborators handed to the orchestrator.
pub struct Collaborators {
    /// Guest-config payload builder.
    pub guest_config: Box<dyn GuestConfigBuilder>,
    /// Disk image source.
    pub images: Box<dyn ImageSource>,
    /// SSH key generator.
    pub keys: Box<dyn KeyGenerator>,
}

impl Collaborators {
    /// Default collaborators for `config`.
    pub fn defaults(config: &MachinaConfig) -> Self {
        Self {
            guest_config: Box::new(IgnitionBuilder),
            images: Box::new(LocalImage),
            keys: Box::new(SshKeygen {
                binary: config.helpers.resolve(&config.helpers.ssh_keygen),
            }),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Minimal Ignition v3 config: login user, authorized key and hostname.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnitionBuilder;

const IGNITION_VERSION: &str = "3.4.0";

impl GuestConfigBuilder for IgnitionBuilder {
    fn build(&self, opts: &GuestConfigOptions) -> Result<Vec<u8>> {
        let key = opts.public_key.trim();
        let mut users = vec![json!({
            "name": opts.user,
            "sshAuthorizedKeys": [key],
        })];
        if opts.rootful {
            users.push(json!({ "name": "root", "sshAuthorizedKeys": [key] }));
        }
        let config = json!({
            "ignition": { "version": IGNITION_VERSION },
            "passwd": { "users": users },
            "storage": {
                "files": [{
                    "path": "/etc/hostname",
                    "mode": 0o644,
                    "overwrite": true,
                    "contents": { "source": format!("data:,{}", opts.name) },
                }],
            },
        });
        Ok(serde_json::to_vec_pretty(&config)?)
    }
}

/// Copies a local disk image into the machine's data directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalImage;

impl ImageSource for LocalImage {
    fn acquire(&self, image: &str, dest: &Path) -> Result<PathBuf> {
        if image.is_empty() {
            return Err(Error::Config(
                "no disk image configured; pass --image or set machine.image".to_string(),
            ));
        }
        if image.contains("://") {
            return Err(Error::not_implemented("local image source", "downloading remote images"));
        }
        let source = Path::new(image);
        if !source.is_file() {
            return Err(Error::Config(format!("disk image {} not found", source.display())));
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        tracing::info!(source = %source.display(), dest = %dest.display(), "copying disk image");
        std::fs::copy(source, dest)?;
        Ok(dest.to_path_buf())
    }
}

/// Runs `ssh-keygen`, reusing an existing pair.
#[derive(Debug, Clone)]
pub struct SshKeygen {
    /// `ssh-keygen` binary.
    pub binary: PathBuf,
}

impl KeyGenerator for SshKeygen {
    fn generate(&self, identity: &Path) -> Result<String> {
        let public = public_key_path(identity);
        if !(identity.exists() && public.exists()) {
            if let Some(parent) = identity.parent() {
                std::fs::create_dir_all(parent)?;
            }
            process::run_checked(
                "ssh-keygen",
                Command::new(&self.binary)
                    .args(["-t", "ed25519", "-N", "", "-q", "-f"])
                    .arg(identity),
            )?;
            tracing::debug!(identity = %identity.display(), "generated ssh key pair");
        }
        Ok(std::fs::read_to_string(&public)?.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn options(rootful: bool) -> GuestConfigOptions {
        GuestConfigOptions {
            name: "dev1".to_string(),
            user: "core".to_string(),
            public_key: "ssh-ed25519 AAAA dev1\n".to_string(),
            rootful,
        }
    }

    #[test]
    fn test_ignition_payload() {
        let raw = IgnitionBuilder.build(&options(false)).unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(doc["ignition"]["version"], IGNITION_VERSION);
        let users = doc["passwd"]["users"].as_array().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0]["name"], "core");
        assert_eq!(users[0]["sshAuthorizedKeys"][0], "ssh-ed25519 AAAA dev1");
        assert_eq!(doc["storage"]["files"][0]["contents"]["source"], "data:,dev1");

        let raw = IgnitionBuilder.build(&options(true)).unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(doc["passwd"]["users"][1]["name"], "root");
    }

    #[test]
    fn test_local_image() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("fcos.raw");
        std::fs::write(&source, b"disk").unwrap();
        let dest = tmp.path().join("data/dev1.raw");

        let got = LocalImage.acquire(&source.display().to_string(), &dest).unwrap();
        assert_eq!(got, dest);
        assert_eq!(std::fs::read(&dest).unwrap(), b"disk");

        // (image, rejected as not implemented)
        let cases = [
            ("", false),
            ("https://example.com/fcos.raw.xz", true),
            ("/nonexistent/image.raw", false),
        ];
        for (image, not_implemented) in cases {
            let err = LocalImage.acquire(image, &dest).unwrap_err();
            assert_eq!(
                matches!(err, Error::NotImplemented { .. }),
                not_implemented,
                "{}: {}",
                image,
                err
            );
        }
    }

    #[test]
    fn test_ssh_keygen_generates_and_reuses() {
        let tmp = tempfile::tempdir().unwrap();
        let binary = tmp.path().join("ssh-keygen");
        let count = tmp.path().join("count");
        let script = format!(
            "#!/bin/sh\necho x >> {}\nfor last; do :; done\necho private > \"$last\"\necho \"ssh-ed25519 KEY\" > \"$last.pub\"\n",
            count.display()
        );
        std::fs::write(&binary, script).unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
        let keygen = SshKeygen { binary };
        let identity = tmp.path().join("ssh/dev1");

        assert_eq!(keygen.generate(&identity).unwrap(), "ssh-ed25519 KEY");
        assert_eq!(keygen.generate(&identity).unwrap(), "ssh-ed25519 KEY");
        let runs = std::fs::read_to_string(&count).unwrap().lines().count();
        assert_eq!(runs, 1, "existing pair is reused");
    }
}
