//! Error types for machina.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using machina's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in machina operations.
#[derive(Error, Debug)]
pub enum Error {
    // Machine lifecycle errors
    /// No descriptor exists for the machine.
    #[error("machine not found: {0}")]
    NoSuchVm(String),

    /// A descriptor (or hypervisor instance) already exists for the name.
    #[error("machine already exists: {0}")]
    VmAlreadyExists(String),

    /// Operation is not valid for the machine's current state.
    #[error("invalid machine state for {machine}: expected {expected}, got {actual}")]
    WrongState {
        /// Machine name.
        machine: String,
        /// Expected state.
        expected: String,
        /// Actual state.
        actual: String,
    },

    /// Machine is already running or starting.
    #[error("machine {0} is already running")]
    VmAlreadyRunning(String),

    /// Another machine of an exclusive backend is already active.
    #[error("{vm_type} only supports one active machine; {active} is currently running")]
    MultipleActiveVm {
        /// Backend kind.
        vm_type: String,
        /// Name of the machine already running.
        active: String,
    },

    /// Backend does not support the requested operation.
    #[error("not implemented by {vm_type}: {operation}")]
    NotImplemented {
        /// Backend kind.
        vm_type: String,
        /// Operation that was requested.
        operation: String,
    },

    /// Disk can only grow.
    #[error("new disk size must be larger than current disk size: {requested}GiB <= {current}GiB")]
    NewDiskSizeTooSmall {
        /// Current disk size in GiB.
        current: u64,
        /// Requested disk size in GiB.
        requested: u64,
    },

    // Backend errors
    /// Backend failed during a lifecycle step.
    #[error("{step} failed for machine {machine}: {source}")]
    Backend {
        /// Machine name.
        machine: String,
        /// Lifecycle step that failed.
        step: &'static str,
        /// Underlying error.
        #[source]
        source: Box<Error>,
    },

    /// Backend reported an unrecoverable state.
    #[error("machine {machine} is in an error state: {reason}")]
    VmFailed {
        /// Machine name.
        machine: String,
        /// Backend-reported reason.
        reason: String,
    },

    /// Backend is not available on this host.
    #[error("hypervisor unavailable: {0}")]
    HypervisorUnavailable(String),

    // Descriptor errors
    /// Descriptor file could not be interpreted.
    #[error("invalid machine descriptor {}: {message}", path.display())]
    Descriptor {
        /// Descriptor path.
        path: PathBuf,
        /// What was wrong with it.
        message: String,
    },

    // Networking errors
    /// Network forwarding could not be established or torn down.
    #[error("network forwarding error: {0}")]
    Forwarding(String),

    /// No usable port could be allocated.
    #[error("port allocation failed: {0}")]
    PortAllocation(String),

    // Mount errors
    /// Volume specification or guest mount failed.
    #[error("mount error: {0}")]
    Mount(String),

    /// Mount source path does not exist.
    #[error("mount source not found: {}", path.display())]
    MountSourceNotFound {
        /// Path that was not found.
        path: PathBuf,
    },

    // Configuration errors
    /// Generic configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to load configuration.
    #[error("failed to load config: {0}")]
    ConfigLoad(String),

    /// Failed to save configuration.
    #[error("failed to save config: {0}")]
    ConfigSave(String),

    // Command execution errors
    /// External command failed.
    #[error("command failed: {command}: {message}")]
    CommandFailed {
        /// The command that failed.
        command: String,
        /// Error message.
        message: String,
    },

    /// Bounded wait elapsed.
    #[error("timed out after {}: {what}", humantime::format_duration(*.after))]
    Timeout {
        /// What was being waited for.
        what: String,
        /// How long we waited.
        after: std::time::Duration,
    },

    /// Retry budget was exhausted.
    #[error("{what}: gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Operation that was retried.
        what: String,
        /// Number of attempts made.
        attempts: u32,
        /// Error from the final attempt.
        #[source]
        last: Box<Error>,
    },

    // IO errors
    /// IO error wrapper.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error wrapper.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a wrong-state error.
    pub fn wrong_state(
        machine: impl Into<String>,
        expected: impl Into<String>,
        actual: impl std::fmt::Display,
    ) -> Self {
        Self::WrongState {
            machine: machine.into(),
            expected: expected.into(),
            actual: actual.to_string(),
        }
    }

    /// Create a not-implemented error.
    pub fn not_implemented(vm_type: impl std::fmt::Display, operation: impl Into<String>) -> Self {
        Self::NotImplemented {
            vm_type: vm_type.to_string(),
            operation: operation.into(),
        }
    }

    /// Create a command failed error.
    pub fn command_failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create a mount error with a message.
    pub fn mount(msg: impl Into<String>) -> Self {
        Self::Mount(msg.into())
    }

    /// Create a forwarding error with a message.
    pub fn forwarding(msg: impl Into<String>) -> Self {
        Self::Forwarding(msg.into())
    }

    /// Create a timeout error.
    pub fn timeout(what: impl Into<String>, after: std::time::Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            after,
        }
    }

    /// Annotate an error with the machine and lifecycle step it came from.
    ///
    /// Taxonomy errors pass through untouched so callers can still match on them.
    pub fn in_step(self, machine: &str, step: &'static str) -> Self {
        if self.is_taxonomy() {
            return self;
        }
        Self::Backend {
            machine: machine.to_string(),
            step,
            source: Box::new(self),
        }
    }

    fn is_taxonomy(&self) -> bool {
        matches!(
            self,
            Error::NoSuchVm(_)
                | Error::VmAlreadyExists(_)
                | Error::WrongState { .. }
                | Error::VmAlreadyRunning(_)
                | Error::MultipleActiveVm { .. }
                | Error::NotImplemented { .. }
                | Error::NewDiskSizeTooSmall { .. }
                | Error::Backend { .. }
        )
    }
}

/// Extension for attaching lifecycle context to backend results.
pub trait StepContext<T> {
    /// Annotate the error (if any) with machine name and step.
    fn step(self, machine: &str, step: &'static str) -> Result<T>;
}

impl<T> StepContext<T> for Result<T> {
    fn step(self, machine: &str, step: &'static str) -> Result<T> {
        self.map_err(|e| e.in_step(machine, step))
    }
}
