use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::shutdown::ShutdownPhase;

/// Main configuration structure for the agent bus
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BusConfig {
    /// Event queue and delivery settings
    pub dispatcher: DispatcherConfig,
    /// Health-check locations and thresholds
    pub diagnostics: DiagnosticsConfig,
    /// Shutdown phase timeouts and emergency settings
    pub shutdown: ShutdownConfig,
    /// Logging settings
    pub observability: ObservabilityConfig,
}

/// What to do when a bounded queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Refuse the new event with `QueueFull`
    Reject,
    /// Evict the least urgent queued event if the new one is more urgent
    DropLowest,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Maximum queued events; unbounded when unset
    pub queue_capacity: Option<usize>,
    /// Policy applied once `queue_capacity` is reached
    pub overflow_policy: OverflowPolicy,
    /// Upper bound for a single handler invocation
    pub handler_timeout_ms: u64,
    /// How long `stop()` keeps delivering already-queued events
    pub drain_timeout_ms: u64,
}

impl DispatcherConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: None,
            overflow_policy: OverflowPolicy::DropLowest,
            handler_timeout_ms: 30_000,
            drain_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Root directory for bus state
    pub state_dir: PathBuf,
    /// Directory holding one sub-directory per agent (mailbox.json, tasks.json)
    pub agent_state_dir: PathBuf,
    /// Scratch directory for in-flight writes and probes
    pub runtime_dir: PathBuf,
    /// Extra directories that must exist and be writable
    pub extra_required_dirs: Vec<PathBuf>,
    /// Open descriptor count above which the resource check reports a leak
    pub max_open_handles: usize,
    /// Treat a non-empty event queue as a failed check instead of a warning
    pub queue_backlog_is_failure: bool,
}

impl DiagnosticsConfig {
    /// Directories verified by the state_files check
    pub fn required_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = vec![
            self.state_dir.clone(),
            self.agent_state_dir.clone(),
            self.runtime_dir.clone(),
        ];
        dirs.extend(self.extra_required_dirs.iter().cloned());
        dirs
    }

    /// Lay out all directories under one root
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            state_dir: root.to_path_buf(),
            agent_state_dir: root.join("agents"),
            runtime_dir: root.join("run"),
            ..Self::default()
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".agent-bus"),
            agent_state_dir: PathBuf::from(".agent-bus/agents"),
            runtime_dir: PathBuf::from(".agent-bus/run"),
            extra_required_dirs: Vec::new(),
            max_open_handles: 1024,
            queue_backlog_is_failure: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub prep_timeout_ms: u64,
    pub persist_timeout_ms: u64,
    pub cleanup_timeout_ms: u64,
    pub broadcast_timeout_ms: u64,
    /// How long verification waits for agents to report SHUTDOWN_READY
    pub verification_timeout_ms: u64,
    /// Optional TOML/JSON document mapping phase name to {description, actions}
    pub directive_template: Option<PathBuf>,
    /// Where emergency shutdown writes its snapshot
    pub emergency_snapshot_path: PathBuf,
}

impl ShutdownConfig {
    pub fn phase_timeout(&self, phase: ShutdownPhase) -> Duration {
        let ms = match phase {
            ShutdownPhase::Prep => self.prep_timeout_ms,
            ShutdownPhase::Persist => self.persist_timeout_ms,
            ShutdownPhase::Cleanup => self.cleanup_timeout_ms,
            ShutdownPhase::Broadcast => self.broadcast_timeout_ms,
        };
        Duration::from_millis(ms)
    }

    pub fn verification_timeout(&self) -> Duration {
        Duration::from_millis(self.verification_timeout_ms)
    }

    /// Set every phase timeout at once
    pub fn with_phase_timeouts(mut self, timeout: Duration) -> Self {
        let ms = timeout.as_millis() as u64;
        self.prep_timeout_ms = ms;
        self.persist_timeout_ms = ms;
        self.cleanup_timeout_ms = ms;
        self.broadcast_timeout_ms = ms;
        self
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            prep_timeout_ms: 5_000,
            persist_timeout_ms: 10_000,
            cleanup_timeout_ms: 10_000,
            broadcast_timeout_ms: 5_000,
            verification_timeout_ms: 5_000,
            directive_template: None,
            emergency_snapshot_path: PathBuf::from(".agent-bus/emergency-snapshot.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level used when RUST_LOG is unset
    pub log_level: String,
    /// Emit JSON lines instead of human-readable output
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl BusConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration file (explicit path, or agent-bus.toml if present)
    /// 3. Environment variables (prefixed with AGENT_BUS__, `__` separated)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        match path {
            Some(path) => {
                builder = builder.add_source(File::from(path.to_path_buf()));
            }
            None => {
                if Path::new("agent-bus.toml").exists() {
                    builder = builder.add_source(File::with_name("agent-bus"));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("AGENT_BUS")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let bus_config: BusConfig = config.try_deserialize()?;
        Ok(bus_config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}
