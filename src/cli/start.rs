//! Start command implementation.

use super::DEFAULT_MACHINE;
use clap::Args;
use machina::MachineManager;

/// Start a stopped machine.
#[derive(Args, Debug)]
pub struct StartCmd {
    /// Machine name.
    #[arg(default_value = DEFAULT_MACHINE)]
    pub name: String,
}

impl StartCmd {
    /// Execute the start command.
    pub fn run(self, manager: &MachineManager) -> machina::Result<()> {
        println!("Starting machine {}", self.name);
        let desc = manager.start(&self.name)?;
        println!(
            "Machine {} started; ssh port {}",
            desc.name, desc.ssh.port
        );
        Ok(())
    }
}
