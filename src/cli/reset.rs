//! Reset command implementation.

use super::confirm;
use clap::Args;
use machina::MachineManager;

/// Remove every machine and all machina data.
#[derive(Args, Debug)]
pub struct ResetCmd {
    /// Skip the confirmation.
    #[arg(short, long)]
    pub force: bool,
}

impl ResetCmd {
    /// Execute the reset command.
    pub fn run(&self, manager: &MachineManager) -> machina::Result<()> {
        let machines = manager.list()?;
        if !self.force {
            println!("Warning: this removes all machines and their data:\n");
            for m in &machines {
                println!("  {} ({})", m.name, m.vm_type);
            }
            println!();
            if !confirm("Are you sure you want to continue?") {
                println!("Cancelled");
                return Ok(());
            }
        }
        manager.reset()?;
        println!("Removed {} machine(s)", machines.len());
        Ok(())
    }
}
