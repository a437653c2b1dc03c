// Shutdown directives - per-phase instructions broadcast to every active agent

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};
use uuid::Uuid;

use super::ShutdownPhase;
use crate::events::Event;
use crate::priority::EventPriority;

pub const DIRECTIVE_KIND: &str = "shutdown_directive";

/// What an agent is asked to do during one phase
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseDirectiveConfig {
    pub description: String,
    pub actions: Vec<String>,
}

/// Phase name to directive mapping, loaded from TOML or JSON
#[derive(Debug, Clone, Default)]
pub struct DirectiveTemplate {
    phases: HashMap<ShutdownPhase, PhaseDirectiveConfig>,
}

impl DirectiveTemplate {
    /// Load the template, falling back to empty directives when absent or unreadable
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            debug!("No shutdown directive template configured, using empty directives");
            return Self::default();
        };

        match Self::from_file(path) {
            Ok(template) => template,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %format!("{:#}", e),
                    "Failed to load shutdown directive template, using empty directives"
                );
                Self::default()
            }
        }
    }

    /// Parse a template file; the format follows the extension (`.json`, otherwise TOML)
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let raw: HashMap<String, PhaseDirectiveConfig> = if is_json {
            serde_json::from_str(&content).context("parsing JSON directive template")?
        } else {
            toml::from_str(&content).context("parsing TOML directive template")?
        };

        let mut phases = HashMap::new();
        for (name, config) in raw {
            match name.parse::<ShutdownPhase>() {
                Ok(phase) => {
                    phases.insert(phase, config);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Ignoring directive entry"),
            }
        }
        Ok(Self { phases })
    }

    pub fn for_phase(&self, phase: ShutdownPhase) -> PhaseDirectiveConfig {
        self.phases.get(&phase).cloned().unwrap_or_default()
    }
}

/// One directive instance; every agent in a phase receives the same directive id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownPhaseDirective {
    pub directive_id: Uuid,
    pub phase: ShutdownPhase,
    pub config: PhaseDirectiveConfig,
    pub timestamp: DateTime<Utc>,
}

impl ShutdownPhaseDirective {
    pub fn new(phase: ShutdownPhase, config: PhaseDirectiveConfig) -> Self {
        Self {
            directive_id: Uuid::new_v4(),
            phase,
            config,
            timestamp: Utc::now(),
        }
    }

    /// SYSTEM event carrying this directive to a single agent
    pub fn to_event(&self, source_id: &str, agent_id: &str) -> Event {
        Event::system(DIRECTIVE_KIND, source_id)
            .with_target(agent_id)
            .with_priority(EventPriority::Critical)
            .with_field("directive_id", self.directive_id.to_string())
            .with_field("phase", self.phase.as_str())
            .with_field("config", json!(self.config))
            .with_field("timestamp", self.timestamp.to_rfc3339())
    }
}
