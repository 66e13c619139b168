//! Helper-process PID record.
//!
//! A one-line text file: the PID, optionally followed by a thread id for
//! helpers that are stopped by posting to a thread.

use crate::error::{Error, Result};
use std::path::Path;

/// Identifies a helper process for a later stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PidRecord {
    /// Process id.
    pub pid: i32,
    /// Thread id receiving the quit request, if any.
    pub tid: Option<u32>,
}

impl PidRecord {
    /// Record for a process without a thread id.
    pub fn new(pid: i32) -> Self {
        Self { pid, tid: None }
    }

    /// Write the record, replacing any previous one.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = match self.tid {
            Some(tid) => format!("{} {}\n", self.pid, tid),
            None => format!("{}\n", self.pid),
        };
        std::fs::write(path, line)?;
        Ok(())
    }

    /// Read the record; `None` if the file does not exist.
    pub fn read(path: &Path) -> Result<Option<Self>> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Self::parse(&text)
            .map(Some)
            .ok_or_else(|| Error::forwarding(format!("malformed pid file {}: {:?}", path.display(), text.trim())))
    }

    fn parse(text: &str) -> Option<Self> {
        let mut fields = text.split_whitespace();
        let pid = fields.next()?.parse().ok().filter(|p: &i32| *p > 0)?;
        let tid = match fields.next() {
            Some(raw) => Some(raw.parse().ok()?),
            None => None,
        };
        Some(Self { pid, tid })
    }
}
