//! Set command implementation.

use super::parsers::{parse_memory, parse_positive};
use super::DEFAULT_MACHINE;
use clap::Args;
use machina::{MachineManager, SetOptions};

/// Change settings of a stopped machine.
#[derive(Args, Debug)]
pub struct SetCmd {
    /// Machine name.
    #[arg(default_value = DEFAULT_MACHINE)]
    pub name: String,

    /// Number of virtual CPUs.
    #[arg(long, value_parser = parse_positive)]
    pub cpus: Option<u64>,

    /// Memory in MiB (suffixes M and G accepted).
    #[arg(short, long, value_parser = parse_memory)]
    pub memory: Option<u64>,

    /// Disk size in GiB; can only grow.
    #[arg(long, value_parser = parse_positive)]
    pub disk_size: Option<u64>,

    /// Forward the rootful engine socket.
    #[arg(long)]
    pub rootful: Option<bool>,

    /// Use shared user-mode networking (WSL only).
    #[arg(long)]
    pub user_mode_networking: Option<bool>,

    /// Replace the shared directories: SOURCE[:TARGET[:ro]] (repeatable).
    #[arg(short = 'v', long = "volume", value_name = "VOLUME")]
    pub volumes: Vec<String>,

    /// Remove every shared directory.
    #[arg(long, conflicts_with = "volumes")]
    pub clear_volumes: bool,
}

impl SetCmd {
    fn options(&self) -> SetOptions {
        SetOptions {
            cpus: self.cpus,
            memory: self.memory,
            disk_size: self.disk_size,
            rootful: self.rootful,
            user_mode_networking: self.user_mode_networking,
            volumes: if self.clear_volumes {
                Some(Vec::new())
            } else if self.volumes.is_empty() {
                None
            } else {
                Some(self.volumes.clone())
            },
        }
    }

    /// Execute the set command.
    pub fn run(self, manager: &MachineManager) -> machina::Result<()> {
        let opts = self.options();
        if opts.is_empty() {
            println!("Nothing to change");
            return Ok(());
        }
        manager.set(&self.name, &opts)?;
        println!("Machine {} updated", self.name);
        Ok(())
    }
}
