use anyhow::Result;
use std::path::PathBuf;

use crate::config::BusConfig;

pub struct ConfigCommand {
    config: BusConfig,
    write: Option<PathBuf>,
}

impl ConfigCommand {
    pub fn new(config: BusConfig, write: Option<PathBuf>) -> Self {
        Self { config, write }
    }

    pub fn execute(&self) -> Result<()> {
        match &self.write {
            Some(path) => {
                self.config.save_to_file(path)?;
                println!("Configuration written to {}", path.display());
            }
            None => print!("{}", toml::to_string_pretty(&self.config)?),
        }
        Ok(())
    }
}
