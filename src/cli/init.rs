//! Init command implementation.

use super::parsers::{parse_memory, parse_positive};
use super::DEFAULT_MACHINE;
use clap::Args;
use machina::{InitOptions, MachinaConfig, MachineManager};

/// Create a new machine.
#[derive(Args, Debug)]
pub struct InitCmd {
    /// Machine name.
    #[arg(default_value = DEFAULT_MACHINE)]
    pub name: String,

    /// Number of virtual CPUs.
    #[arg(long, value_parser = parse_positive)]
    pub cpus: Option<u64>,

    /// Memory in MiB (suffixes M and G accepted).
    #[arg(short, long, value_parser = parse_memory)]
    pub memory: Option<u64>,

    /// Disk size in GiB.
    #[arg(long, value_parser = parse_positive)]
    pub disk_size: Option<u64>,

    /// Disk image to boot from.
    #[arg(long)]
    pub image: Option<String>,

    /// Guest login user.
    #[arg(long)]
    pub username: Option<String>,

    /// Forward the rootful engine socket.
    #[arg(long)]
    pub rootful: bool,

    /// Use shared user-mode networking (WSL only).
    #[arg(long)]
    pub user_mode_networking: bool,

    /// Share a host directory: SOURCE[:TARGET[:ro]] (repeatable).
    #[arg(short = 'v', long = "volume", value_name = "VOLUME")]
    pub volumes: Vec<String>,

    /// Start the machine once created.
    #[arg(long)]
    pub now: bool,
}

impl InitCmd {
    /// Build creation options on top of the configured defaults.
    pub fn options(&self, config: &MachinaConfig) -> InitOptions {
        let mut opts = InitOptions::from_defaults(&self.name, config);
        if let Some(cpus) = self.cpus {
            opts.cpus = cpus;
        }
        if let Some(memory) = self.memory {
            opts.memory = memory;
        }
        if let Some(disk_size) = self.disk_size {
            opts.disk_size = disk_size;
        }
        if let Some(image) = &self.image {
            opts.image = image.clone();
        }
        if let Some(username) = &self.username {
            opts.username = username.clone();
        }
        opts.rootful |= self.rootful;
        opts.user_mode_networking |= self.user_mode_networking;
        opts.volumes = self.volumes.clone();
        opts
    }

    /// Execute the init command.
    pub fn run(self, manager: &MachineManager, config: &MachinaConfig) -> machina::Result<()> {
        let desc = manager.init(&self.options(config))?;
        println!("Machine {} created ({})", desc.name, desc.vm_type());

        if self.now {
            manager.start(&desc.name)?;
            println!("Machine {} started", desc.name);
        } else {
            println!("To start your machine run:\n\n\tmachina start {}", desc.name);
        }
        Ok(())
    }
}
