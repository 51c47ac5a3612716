use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "broker", version, about = "Service broker operation orchestrator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the orchestrator daemon with config file
    Start {
        #[arg(short, long)]
        config: PathBuf,
    },
}
