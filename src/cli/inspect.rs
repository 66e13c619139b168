//! Inspect command implementation.

use super::DEFAULT_MACHINE;
use clap::Args;
use machina::MachineManager;

/// Show machine details as JSON.
#[derive(Args, Debug)]
pub struct InspectCmd {
    /// Machine names.
    #[arg(default_value = DEFAULT_MACHINE)]
    pub names: Vec<String>,
}

impl InspectCmd {
    /// Execute the inspect command.
    pub fn run(&self, manager: &MachineManager) -> machina::Result<()> {
        let infos = self
            .names
            .iter()
            .map(|name| manager.inspect(name))
            .collect::<machina::Result<Vec<_>>>()?;
        println!("{}", serde_json::to_string_pretty(&infos)?);
        Ok(())
    }
}
