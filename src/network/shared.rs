//! Shared user-mode network process, reference counted across machines.
//!
//! Every machine using the shared process owns a marker file in a common
//! directory. The directory is guarded by an exclusive file lock because the
//! machines are driven by separate CLI invocations. The lock is held only
//! while markers are added, removed and recounted; starting or stopping the
//! shared process happens outside it.

use crate::error::Result;
use crate::lock::FileLock;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = ".lock";

/// Marker directory for one shared network process.
#[derive(Debug, Clone)]
pub struct SharedNetwork {
    dir: PathBuf,
}

impl SharedNetwork {
    /// Markers live in `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Marker directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock(&self) -> Result<FileLock> {
        std::fs::create_dir_all(&self.dir)?;
        FileLock::acquire(self.dir.join(LOCK_FILE))
    }

    /// Register `machine` as a user, then start the shared process if it is
    /// not already running.
    pub fn acquire<R, S>(&self, machine: &str, is_running: R, start: S) -> Result<()>
    where
        R: FnOnce() -> Result<bool>,
        S: FnOnce() -> Result<()>,
    {
        let users = {
            let _guard = self.lock()?;
            std::fs::write(self.dir.join(machine), b"")?;
            self.markers()?.len()
        };
        tracing::debug!(machine, users, "registered shared network user");

        if is_running()? {
            return Ok(());
        }
        tracing::info!(machine, "starting shared network");
        start()
    }

    /// Drop `machine`'s marker, prune markers of machines that are no longer
    /// running and stop the shared process when nobody is left.
    ///
    /// Returns the number of remaining users.
    pub fn release<R, S>(&self, machine: &str, mut instance_running: R, stop: S) -> Result<usize>
    where
        R: FnMut(&str) -> bool,
        S: FnOnce() -> Result<()>,
    {
        let remaining = {
            let _guard = self.lock()?;
            crate::cleanup::remove_if_exists(&self.dir.join(machine))?;

            let mut live = 0;
            for marker in self.markers()? {
                if instance_running(&marker) {
                    live += 1;
                } else {
                    tracing::info!(machine = %marker, "pruning stale shared network marker");
                    crate::cleanup::remove_if_exists(&self.dir.join(&marker))?;
                }
            }
            live
        };

        if remaining == 0 {
            tracing::info!(machine, "last shared network user gone, stopping it");
            stop()?;
        } else {
            tracing::debug!(machine, remaining, "shared network still in use");
        }
        Ok(remaining)
    }

    /// Current marker names.
    pub fn markers(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name != LOCK_FILE {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    /// Simulated distributions: which machines run and whether the shared process is up.
    #[derive(Default)]
    struct World {
        running: BTreeSet<String>,
        shared_up: bool,
        starts: u32,
        stops: u32,
    }

    fn start(shared: &SharedNetwork, world: &Arc<Mutex<World>>, name: &str) {
        world.lock().running.insert(name.to_string());
        let w1 = world.clone();
        let w2 = world.clone();
        shared
            .acquire(
                name,
                move || Ok(w1.lock().shared_up),
                move || {
                    let mut w = w2.lock();
                    w.shared_up = true;
                    w.starts += 1;
                    Ok(())
                },
            )
            .unwrap();
    }

    fn stop(shared: &SharedNetwork, world: &Arc<Mutex<World>>, name: &str) -> usize {
        world.lock().running.remove(name);
        let snapshot = world.lock().running.clone();
        let w = world.clone();
        shared
            .release(
                name,
                move |m| snapshot.contains(m),
                move || {
                    let mut w = w.lock();
                    w.shared_up = false;
                    w.stops += 1;
                    Ok(())
                },
            )
            .unwrap()
    }

    #[test]
    fn test_two_machines_share_one_process() {
        let tmp = tempfile::tempdir().unwrap();
        let shared = SharedNetwork::new(tmp.path().join("markers"));
        let world = Arc::new(Mutex::new(World::default()));

        start(&shared, &world, "a");
        start(&shared, &world, "b");
        assert_eq!(world.lock().starts, 1, "second user reuses the running process");
        assert_eq!(shared.markers().unwrap(), vec!["a", "b"]);

        assert_eq!(stop(&shared, &world, "a"), 1);
        assert!(world.lock().shared_up, "b still needs the shared network");

        assert_eq!(stop(&shared, &world, "b"), 0);
        assert!(!world.lock().shared_up);
        assert_eq!(world.lock().stops, 1);
        assert!(shared.markers().unwrap().is_empty());
    }

    #[test]
    fn test_stale_marker_of_crashed_machine_is_pruned() {
        let tmp = tempfile::tempdir().unwrap();
        let shared = SharedNetwork::new(tmp.path().join("markers"));
        let world = Arc::new(Mutex::new(World::default()));

        start(&shared, &world, "a");
        start(&shared, &world, "crashed");
        // Crash: the instance disappears without releasing its marker.
        world.lock().running.remove("crashed");

        assert_eq!(stop(&shared, &world, "a"), 0, "stale marker must not keep it alive");
        assert!(!world.lock().shared_up);
        assert!(shared.markers().unwrap().is_empty());
    }

    #[test]
    fn test_release_without_marker_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let shared = SharedNetwork::new(tmp.path().join("never-created"));
        let mut stopped = false;
        let remaining = shared
            .release("a", |_| false, || {
                stopped = true;
                Ok(())
            })
            .unwrap();
        assert_eq!(remaining, 0);
        assert!(stopped);
    }

    #[test]
    fn test_lock_file_is_not_a_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let shared = SharedNetwork::new(tmp.path());
        let _guard = shared.lock().unwrap();
        assert!(shared.markers().unwrap().is_empty());
    }
}
