use anyhow::Result;
use tracing::{info, warn};

use crate::bus::AgentBus;
use crate::config::BusConfig;
use crate::shutdown::ShutdownStage;

pub struct RunCommand {
    config: BusConfig,
}

impl RunCommand {
    pub fn new(config: BusConfig) -> Self {
        Self { config }
    }

    /// Serve until a signal-triggered shutdown; returns the process exit code
    pub async fn execute(self) -> Result<i32> {
        let bus = AgentBus::new(self.config);
        bus.prepare_state_dirs().await?;
        bus.start();
        let signals = bus.install_signal_handlers()?;

        info!("Agent bus running, waiting for SIGTERM or SIGINT");
        bus.wait_for_shutdown().await;

        let code = exit_code(&bus);
        if code != 0 {
            warn!(
                stage = ?bus.coordinator().stage(),
                "Shutdown attempt did not complete; stopping anyway"
            );
        }
        signals.abort();
        bus.stop().await;
        Ok(code)
    }
}

/// 0 only when the shutdown attempt completed
fn exit_code(bus: &AgentBus) -> i32 {
    match bus.coordinator().stage() {
        ShutdownStage::Completed => 0,
        _ => 1,
    }
}
