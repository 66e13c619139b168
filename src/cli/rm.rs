//! Rm command implementation.

use super::{confirm, DEFAULT_MACHINE};
use clap::Args;
use machina::{MachineManager, Preserve, RemoveOptions};

/// Remove a machine and its files.
#[derive(Args, Debug)]
pub struct RmCmd {
    /// Machine name.
    #[arg(default_value = DEFAULT_MACHINE)]
    pub name: String,

    /// Stop a running machine and skip the confirmation.
    #[arg(short, long)]
    pub force: bool,

    /// Keep the SSH identity.
    #[arg(long)]
    pub save_keys: bool,

    /// Keep the guest-config payload.
    #[arg(long)]
    pub save_ignition: bool,

    /// Keep the disk image.
    #[arg(long)]
    pub save_image: bool,
}

impl RmCmd {
    fn options(&self) -> RemoveOptions {
        RemoveOptions {
            force: self.force,
            preserve: Preserve {
                keys: self.save_keys,
                guest_config: self.save_ignition,
                image: self.save_image,
            },
        }
    }

    /// Execute the rm command.
    pub fn run(self, manager: &MachineManager) -> machina::Result<()> {
        let plan = manager.remove(&self.name, self.options())?;

        if !self.force {
            print!("{}", plan.confirmation_text());
            println!();
            if !confirm("Are you sure you want to continue?") {
                println!("Cancelled");
                return Ok(());
            }
        }

        plan.execute()?;
        println!("Machine {} removed", self.name);
        Ok(())
    }
}
