use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod commands;

#[derive(Parser)]
#[command(name = "agent-bus")]
#[command(about = "In-process agent bus with prioritized events and verified shutdown")]
#[command(long_about = "agent-bus hosts a priority event dispatcher and agent registry, checks the \
                       system before shutdown, and drives agents through a phased shutdown when \
                       it receives SIGTERM or SIGINT.")]
pub struct Cli {
    /// Configuration file (defaults to agent-bus.toml when present)
    #[arg(long, global = true, help = "Path to a TOML configuration file")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true, help = "Emit structured JSON logs")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the bus and run until a termination signal completes shutdown
    Run,
    /// Run the pre-shutdown diagnostics and print the report as JSON
    Diagnose,
    /// Print the effective configuration as TOML
    Config {
        /// Write the configuration to this path instead of printing it
        #[arg(long, help = "Write the effective configuration to a file")]
        write: Option<PathBuf>,
    },
}
