use anyhow::Result;
use clap::Parser;

use agent_bus::cli::commands::{ConfigCommand, DiagnoseCommand, RunCommand};
use agent_bus::cli::{Cli, Commands};
use agent_bus::{init_telemetry, BusConfig};

fn main() -> Result<()> {
    let cli = Cli::parse();

    BusConfig::load_env_file()?;
    let mut config = BusConfig::load(cli.config.as_deref())?;
    if cli.json_logs {
        config.observability.json_logs = true;
    }

    match cli.command {
        Commands::Run => {
            init_telemetry(&config.observability)?;
            let code = tokio::runtime::Runtime::new()?
                .block_on(async { RunCommand::new(config).execute().await })?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Commands::Diagnose => {
            init_telemetry(&config.observability)?;
            let code = tokio::runtime::Runtime::new()?
                .block_on(async { DiagnoseCommand::new(config).execute().await })?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Commands::Config { write } => ConfigCommand::new(config, write).execute(),
    }
}
