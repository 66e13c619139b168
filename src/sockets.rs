//! Bounded waits on local sockets.

use crate::alloc;
use crate::error::{Error, Result};
use std::io::{BufRead, BufReader, ErrorKind};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Poll interval while waiting on a nonblocking listener.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Wait for `path` to appear, sleeping `interval * n` before the n-th retry.
///
/// `alive` is checked before each sleep; returning false aborts immediately.
pub fn wait_for_path<F>(path: &Path, attempts: u32, interval: Duration, mut alive: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let started = Instant::now();
    for n in 1..=attempts.max(1) {
        if path.exists() {
            tracing::debug!(path = %path.display(), attempts = n, "socket ready");
            return Ok(());
        }
        if !alive() {
            return Err(Error::forwarding(format!(
                "process exited before {} appeared",
                path.display()
            )));
        }
        std::thread::sleep(interval * n);
    }
    if path.exists() {
        return Ok(());
    }
    Err(Error::timeout(
        format!("waiting for {}", path.display()),
        started.elapsed(),
    ))
}

/// Listener the guest connects to and writes `Ready` once booted.
#[derive(Debug)]
pub struct ReadyListener {
    listener: UnixListener,
    path: PathBuf,
}

impl ReadyListener {
    /// Bind at `path`, replacing a stale socket.
    pub fn bind(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !alloc::claim_socket_path(&path)? {
            return Err(Error::forwarding(format!(
                "ready socket {} is already in use",
                path.display()
            )));
        }
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener, path })
    }

    /// Socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the guest reports ready, `timeout` elapses or `alive` is false.
    pub fn wait<F>(&self, timeout: Duration, mut alive: F) -> Result<()>
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    stream.set_read_timeout(Some(remaining.max(Duration::from_millis(1))))?;
                    let mut reader = BufReader::new(stream);
                    let mut line = String::new();
                    loop {
                        line.clear();
                        match reader.read_line(&mut line) {
                            Ok(0) => break,
                            Ok(_) if line.trim() == "Ready" => {
                                tracing::debug!(path = %self.path.display(), "guest is ready");
                                return Ok(());
                            }
                            Ok(_) => continue,
                            Err(e)
                                if e.kind() == ErrorKind::WouldBlock
                                    || e.kind() == ErrorKind::TimedOut =>
                            {
                                return Err(Error::timeout("guest ready signal", timeout));
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }

            if !alive() {
                return Err(Error::forwarding("vm process exited before reporting ready"));
            }
            if Instant::now() >= deadline {
                return Err(Error::timeout("guest ready signal", timeout));
            }
            std::thread::sleep(ACCEPT_POLL);
        }
    }
}

impl Drop for ReadyListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
