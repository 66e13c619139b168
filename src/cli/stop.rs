//! Stop command implementation.

use super::DEFAULT_MACHINE;
use clap::Args;
use machina::MachineManager;

/// Stop a running machine.
#[derive(Args, Debug)]
pub struct StopCmd {
    /// Machine name.
    #[arg(default_value = DEFAULT_MACHINE)]
    pub name: String,

    /// Power off without a graceful guest shutdown.
    #[arg(short, long)]
    pub force: bool,
}

impl StopCmd {
    /// Execute the stop command.
    pub fn run(self, manager: &MachineManager) -> machina::Result<()> {
        manager.stop(&self.name, self.force)?;
        println!("Machine {} stopped", self.name);
        Ok(())
    }
}
