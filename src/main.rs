//! machina CLI entry point.

use clap::{Parser, Subcommand, ValueEnum};
use machina::{BaseDirs, MachinaConfig, MachineManager};
use tracing_subscriber::EnvFilter;

mod cli;

/// machina - local virtual machines for container hosts
#[derive(Parser, Debug)]
#[command(name = "machina")]
#[command(about = "Manage local virtual machines for container hosts")]
#[command(version)]
struct Cli {
    /// Log filter (e.g. "debug", "machina=trace"); overrides RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new machine.
    Init(cli::init::InitCmd),

    /// Start a stopped machine.
    Start(cli::start::StartCmd),

    /// Stop a running machine.
    Stop(cli::stop::StopCmd),

    /// Remove a machine.
    Rm(cli::rm::RmCmd),

    /// Change settings of a stopped machine.
    Set(cli::set::SetCmd),

    /// List machines.
    #[command(alias = "ls")]
    List(cli::list::ListCmd),

    /// Show machine details.
    Inspect(cli::inspect::InspectCmd),

    /// Remove every machine and all data.
    Reset(cli::reset::ResetCmd),
}

fn main() {
    let cli = Cli::parse();

    init_logging(cli.log_level.as_deref(), cli.log_format);

    tracing::debug!(version = machina::VERSION, "starting machina");

    if let Err(e) = run(cli.command) {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(command: Commands) -> machina::Result<()> {
    let config = MachinaConfig::load()?;
    let manager = MachineManager::from_config(&BaseDirs::from_env(), config.clone())?;
    tracing::debug!(provider = %config.vm_type(), "using provider");

    match command {
        Commands::Init(cmd) => cmd.run(&manager, &config),
        Commands::Start(cmd) => cmd.run(&manager),
        Commands::Stop(cmd) => cmd.run(&manager),
        Commands::Rm(cmd) => cmd.run(&manager),
        Commands::Set(cmd) => cmd.run(&manager),
        Commands::List(cmd) => cmd.run(&manager),
        Commands::Inspect(cmd) => cmd.run(&manager),
        Commands::Reset(cmd) => cmd.run(&manager),
    }
}

/// Initialize the tracing subscriber.
fn init_logging(level: Option<&str>, format: LogFormat) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("machina=warn")),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
