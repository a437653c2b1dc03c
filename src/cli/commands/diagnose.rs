use anyhow::Result;

use crate::bus::AgentBus;
use crate::config::BusConfig;

pub struct DiagnoseCommand {
    config: BusConfig,
}

impl DiagnoseCommand {
    pub fn new(config: BusConfig) -> Self {
        Self { config }
    }

    /// Print the report; returns the process exit code (1 when critical warnings exist)
    pub async fn execute(self) -> Result<i32> {
        let bus = AgentBus::new(self.config);
        bus.start();

        let report = bus.run_pre_shutdown_diagnostics().await;
        println!("{}", serde_json::to_string_pretty(&report)?);

        bus.dispatcher().stop().await;
        Ok(if report.critical_warnings.is_empty() { 0 } else { 1 })
    }
}
