//! List command implementation.

use clap::Args;
use machina::{MachineManager, MachineSummary, VmState};

/// List machines of every backend.
#[derive(Args, Debug)]
pub struct ListCmd {
    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

impl ListCmd {
    /// Execute the list command.
    pub fn run(&self, manager: &MachineManager) -> machina::Result<()> {
        let machines = manager.list()?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&machines)?);
            return Ok(());
        }
        if machines.is_empty() {
            println!("No machines found");
            return Ok(());
        }

        println!(
            "{:<24} {:<8} {:<22} {:<5} {:<8} {:<8}",
            "NAME", "TYPE", "LAST UP", "CPUS", "MEMORY", "DISK"
        );
        for m in &machines {
            println!(
                "{:<24} {:<8} {:<22} {:<5} {:<8} {:<8}",
                m.name,
                m.vm_type,
                last_up(m),
                m.cpus,
                format!("{}MiB", m.memory),
                format!("{}GiB", m.disk_size),
            );
        }
        Ok(())
    }
}

fn last_up(m: &MachineSummary) -> String {
    match (m.state, m.last_up) {
        (VmState::Running, _) => "Currently running".to_string(),
        (VmState::Starting, _) => "Currently starting".to_string(),
        (VmState::Stopped, Some(at)) => at.format("%Y-%m-%d %H:%M:%S").to_string(),
        (VmState::Stopped, None) => "Never".to_string(),
    }
}
