// Emergency shutdown support - process exit hook and the best-effort state snapshot

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::info;

use crate::error::Result;

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

/// Exit hook used by emergency shutdown, swapped out in tests
#[cfg_attr(any(test, feature = "testing"), automock)]
pub trait ProcessControl: Send + Sync {
    fn exit(&self, code: i32);
}

/// Terminates the real process
pub struct StdProcessControl;

impl ProcessControl for StdProcessControl {
    fn exit(&self, code: i32) {
        std::process::exit(code)
    }
}

/// What the bus knew about its agents when emergency shutdown started
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencySnapshot {
    pub reason: String,
    pub active_agents: Vec<String>,
    pub ready_agents: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub hostname: String,
    pub pid: u32,
}

impl EmergencySnapshot {
    pub fn capture(reason: &str, active_agents: Vec<String>, ready_agents: Vec<String>) -> Self {
        Self {
            reason: reason.to_string(),
            active_agents,
            ready_agents,
            timestamp: Utc::now(),
            hostname: hostname::get()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string(),
            pid: std::process::id(),
        }
    }

    /// Write as pretty JSON through a temporary file and rename
    pub async fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let serialized = serde_json::to_string_pretty(self)?;
        let temp_file = path.with_extension("json.tmp");
        fs::write(&temp_file, serialized).await?;
        fs::rename(&temp_file, path).await?;

        info!(
            path = %path.display(),
            active_agents = self.active_agents.len(),
            "Emergency snapshot written"
        );
        Ok(())
    }

    pub async fn read_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }
}
