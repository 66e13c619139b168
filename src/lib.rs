//! machina - local virtual machine lifecycle manager for container hosts.
//!
//! A machine is a Linux guest VM that runs a container engine. machina
//! creates, starts, stops, reconfigures and removes machines on one of four
//! hypervisor backends and forwards the guest's container API socket to the
//! host.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐      ┌──────────────────┐      ┌────────────────────┐
//! │  machina CLI │ ───► │  MachineManager  │ ───► │ Provider (backend) │
//! └──────────────┘      │  descriptor, lock│      │ applehv wsl qemu   │
//!                       │  cleanup, network│      │ vbox               │
//!                       └──────────────────┘      └────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use machina::{BaseDirs, InitOptions, MachinaConfig, MachineManager};
//!
//! let config = MachinaConfig::load()?;
//! let manager = MachineManager::from_config(&BaseDirs::from_env(), config.clone())?;
//! manager.init(&InitOptions::from_defaults("dev", &config))?;
//! manager.start("dev")?;
//! # Ok::<(), machina::Error>(())
//! ```

#![warn(missing_docs)]

pub mod alloc;
pub mod cleanup;
pub mod collab;
pub mod config;
pub mod delivery;
pub mod error;
pub mod lifecycle;
pub mod lock;
pub mod machine;
pub mod network;
pub mod paths;
pub mod process;
pub mod provider;
pub mod retry;
pub mod sockets;
pub mod ssh;

#[cfg(test)]
pub(crate) mod testing;

pub use config::MachinaConfig;
pub use error::{Error, Result};
pub use lifecycle::{MachineInfo, MachineManager, MachineSummary, RemovalPlan, RemoveOptions};
pub use machine::{MachineDescriptor, Mount, MountType, Preserve, VmState, VmType};
pub use paths::{BaseDirs, MachineDirs};
pub use provider::{InitOptions, Provider, ProviderRegistry, SetOptions};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
