use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
use commands::{execute_keygen_command, execute_run_command, execute_simulate_command, KeygenArgs, RunArgs, SimulateArgs};

#[derive(Parser)]
#[command(name = "hashweave")]
#[command(about = "Hashweave - hashgraph consensus node")]
#[command(version = "0.1.0")]
pub struct Cli {
    /// Log filter, e.g. "info" or "hashweave=debug,info"
    #[arg(long, global = true, default_value = "hashweave=info,warn")]
    pub log: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a validator key pair
    Keygen(KeygenArgs),
    /// Run a validator node
    Run(RunArgs),
    /// Run a local network in memory and report what it agreed on
    Simulate(SimulateArgs),
}

fn init_tracing(filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log);

    match cli.command {
        Commands::Keygen(args) => execute_keygen_command(args),
        Commands::Run(args) => execute_run_command(args).await,
        Commands::Simulate(args) => execute_simulate_command(args).await,
    }
}
