use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::BusError;

pub const AGENT_STATUS_CHECK: &str = "agent_status";
pub const STATE_FILES_CHECK: &str = "state_files";
pub const RESOURCES_CHECK: &str = "resources";
pub const EVENT_SYSTEM_CHECK: &str = "event_system";

/// Result of a single diagnostic check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub passed: bool,
    /// A failing critical check blocks shutdown
    pub critical: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub details: Value,
}

impl CheckResult {
    pub fn pass(details: Value) -> Self {
        Self {
            passed: true,
            critical: false,
            errors: Vec::new(),
            warnings: Vec::new(),
            details,
        }
    }

    /// Passed when `errors` is empty; `critical` only sticks to a failing result
    pub fn from_errors(errors: Vec<String>, critical: bool, details: Value) -> Self {
        let passed = errors.is_empty();
        Self {
            passed,
            critical: critical && !passed,
            errors,
            warnings: Vec::new(),
            details,
        }
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    /// A check that could not run at all
    pub fn check_failure(check: &str, reason: impl Into<String>) -> Self {
        let error = BusError::DiagnosticCheckFailure {
            check: check.to_string(),
            reason: reason.into(),
        };
        Self {
            passed: false,
            critical: true,
            errors: vec![error.to_string()],
            warnings: Vec::new(),
            details: Value::Null,
        }
    }
}

/// Diagnostic report containing all check results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsReport {
    pub checks: BTreeMap<String, CheckResult>,
    pub total_passed: usize,
    pub total_failed: usize,
    /// Errors from every failing critical check, flattened
    pub critical_warnings: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl DiagnosticsReport {
    pub fn from_checks(checks: BTreeMap<String, CheckResult>) -> Self {
        let total_passed = checks.values().filter(|check| check.passed).count();
        let total_failed = checks.len() - total_passed;
        let critical_warnings = checks
            .values()
            .filter(|check| !check.passed && check.critical)
            .flat_map(|check| check.errors.iter().cloned())
            .collect();

        Self {
            checks,
            total_passed,
            total_failed,
            critical_warnings,
            timestamp: Utc::now(),
        }
    }

    pub fn check(&self, name: &str) -> Option<&CheckResult> {
        self.checks.get(name)
    }

    /// True when some failing check is critical
    pub fn blocks_shutdown(&self) -> bool {
        self.total_failed > 0
            && self
                .checks
                .values()
                .any(|check| !check.passed && check.critical)
    }

    /// Value published with the `pre_shutdown_check` event
    pub fn status_label(&self) -> &'static str {
        if self.blocks_shutdown() {
            "errors_detected"
        } else {
            "ready_for_shutdown"
        }
    }
}
