//! Port and socket/pipe name allocation.
//!
//! Availability is always probed against the OS (bind or connect), never
//! tracked in bookkeeping.

use crate::error::{Error, Result};
use std::net::{Ipv4Addr, TcpListener};
use std::path::{Path, PathBuf};

/// Ask the kernel for a free ephemeral TCP port on the loopback interface.
pub fn free_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .map_err(|e| Error::PortAllocation(format!("bind 127.0.0.1:0: {}", e)))?;
    Ok(listener.local_addr()?.port())
}

/// Whether `port` can currently be bound on the loopback interface.
pub fn is_port_free(port: u16) -> bool {
    port != 0 && TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

/// Keep `port` if it can still be bound, otherwise pick a new one.
///
/// Returns the port to use and whether it changed.
pub fn ensure_port(port: u16) -> Result<(u16, bool)> {
    if is_port_free(port) {
        return Ok((port, false));
    }
    let fresh = free_port()?;
    tracing::info!(old = port, new = fresh, "port in use, reassigned");
    Ok((fresh, true))
}

/// What is at a socket path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    /// Nothing exists at the path.
    Free,
    /// A file exists but nobody accepts connections on it.
    Stale,
    /// Something is listening.
    InUse,
}

/// Probe a Unix socket path.
pub fn probe_socket(path: &Path) -> SocketStatus {
    if std::fs::symlink_metadata(path).is_err() {
        return SocketStatus::Free;
    }
    match std::os::unix::net::UnixStream::connect(path) {
        Ok(_) => SocketStatus::InUse,
        Err(_) => SocketStatus::Stale,
    }
}

/// Make `path` available for a new listener.
///
/// Stale leftovers are removed. Returns false if something is listening.
pub fn claim_socket_path(path: &Path) -> Result<bool> {
    match probe_socket(path) {
        SocketStatus::Free => Ok(true),
        SocketStatus::Stale => {
            tracing::debug!(path = %path.display(), "removing stale socket");
            crate::cleanup::remove_if_exists(path)?;
            Ok(true)
        }
        SocketStatus::InUse => Ok(false),
    }
}

/// First free socket path of the form `<dir>/<stem>.sock`, `<dir>/<stem>-1.sock`, ...
pub fn free_socket_path(dir: &Path, stem: &str) -> Result<PathBuf> {
    for n in 0..100 {
        let name = if n == 0 {
            format!("{}.sock", stem)
        } else {
            format!("{}-{}.sock", stem, n)
        };
        let candidate = dir.join(name);
        if claim_socket_path(&candidate)? {
            return Ok(candidate);
        }
    }
    Err(Error::forwarding(format!(
        "no free socket path for {} in {}",
        stem,
        dir.display()
    )))
}

/// Windows named-pipe namespace.
pub const PIPE_PREFIX: &str = r"\\.\pipe\";

/// Full path of a named pipe.
pub fn pipe_path(name: &str) -> PathBuf {
    PathBuf::from(format!("{}{}", PIPE_PREFIX, name))
}

/// First pipe name `base`, `base-1`, ... that `exists` reports as unused.
pub fn free_pipe_name<F>(base: &str, mut exists: F) -> Result<String>
where
    F: FnMut(&Path) -> bool,
{
    for n in 0..100 {
        let name = if n == 0 {
            base.to_string()
        } else {
            format!("{}-{}", base, n)
        };
        if !exists(&pipe_path(&name)) {
            return Ok(name);
        }
    }
    Err(Error::forwarding(format!("no free pipe name for {}", base)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    #[test]
    fn test_free_port_is_bindable() {
        let port = free_port().unwrap();
        assert_ne!(port, 0);
        assert!(is_port_free(port));
    }

    #[test]
    fn test_ensure_port_reassigns_on_collision() {
        let holder = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let busy = holder.local_addr().unwrap().port();

        let (port, changed) = ensure_port(busy).unwrap();
        assert!(changed);
        assert_ne!(port, busy);

        drop(holder);
        let (port, changed) = ensure_port(busy).unwrap();
        assert!(!changed);
        assert_eq!(port, busy);
    }

    #[test]
    fn test_probe_socket_states() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("api.sock");
        assert_eq!(probe_socket(&path), SocketStatus::Free);

        let listener = UnixListener::bind(&path).unwrap();
        assert_eq!(probe_socket(&path), SocketStatus::InUse);

        drop(listener);
        assert_eq!(probe_socket(&path), SocketStatus::Stale);
    }

    #[test]
    fn test_claim_removes_stale_socket() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("api.sock");
        drop(UnixListener::bind(&path).unwrap());

        assert!(claim_socket_path(&path).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_free_socket_path_skips_live_listener() {
        let tmp = tempfile::tempdir().unwrap();
        let _live = UnixListener::bind(tmp.path().join("dev1-api.sock")).unwrap();

        let path = free_socket_path(tmp.path(), "dev1-api").unwrap();
        assert_eq!(path, tmp.path().join("dev1-api-1.sock"));
    }

    #[test]
    fn test_free_pipe_name_increments() {
        let taken = [pipe_path("machina-dev1"), pipe_path("machina-dev1-1")];
        let name = free_pipe_name("machina-dev1", |p| taken.iter().any(|t| t == p)).unwrap();
        assert_eq!(name, "machina-dev1-2");
    }
}
