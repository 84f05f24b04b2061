use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeSet;

/// Diagnostic keys the kernel recognizes. Anything else is "missing"
/// and subject to the `log_missing_keys` policy.
pub const KNOWN_DIAG_KEYS: &[&str] = &[
    "Executive",
    "StateMachine",
    "Milestone",
    "TimePeriod",
    "Validity",
    "Task",
    "Resources",
    "Port",
    "PortManager",
    "Model",
];

/// Selects the executive implementation. A single ordered implementation
/// ships today; the selector is kept so configurations stay portable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutiveKind {
    #[default]
    Ordered,
}

/// Per-component tracing switches.
///
/// Lookups for unknown keys return false; with `log_missing_keys` set the
/// key is additionally recorded (and warned once through `tracing`) so a
/// misspelled switch is discoverable after the run.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    enabled: BTreeSet<String>,
    pub log_missing_keys: bool,
    #[serde(skip)]
    missing: RefCell<BTreeSet<String>>,
}

impl DiagnosticsConfig {
    pub fn enable(&mut self, key: &str) -> &mut Self {
        self.enabled.insert(key.to_string());
        self
    }

    pub fn disable(&mut self, key: &str) -> &mut Self {
        self.enabled.remove(key);
        self
    }

    /// True when tracing for `key` was switched on.
    pub fn is_enabled(&self, key: &str) -> bool {
        if self.enabled.contains(key) {
            return true;
        }
        if !KNOWN_DIAG_KEYS.contains(&key) && self.log_missing_keys {
            let mut missing = self.missing.borrow_mut();
            if missing.insert(key.to_string()) {
                tracing::warn!(target: "sim_lite::diag", key, "unknown diagnostic key");
            }
        }
        false
    }

    /// Unknown keys observed so far (only populated with `log_missing_keys`).
    pub fn missing_keys(&self) -> Vec<String> {
        self.missing.borrow().iter().cloned().collect()
    }
}

/// Kernel configuration, handed in explicitly at model construction.
/// There is no process-global registry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimConfig {
    /// Cap on simultaneously live detachable event threads. Requests past
    /// the cap fail into the error log instead of spawning.
    pub worker_threads: usize,
    /// When true, events requested in the past are promoted to `now`
    /// instead of failing.
    pub ignore_causality_violations: bool,
    pub executive: ExecutiveKind,
    /// When true, any error-log deposit stops the executive.
    pub abort_on_error: bool,
    pub diagnostics: DiagnosticsConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            worker_threads: 1024,
            ignore_causality_violations: false,
            executive: ExecutiveKind::Ordered,
            abort_on_error: false,
            diagnostics: DiagnosticsConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostics_unknown_key_is_false_and_recorded() {
        let mut diag = DiagnosticsConfig {
            log_missing_keys: true,
            ..Default::default()
        };
        diag.enable("Executive");
        assert!(diag.is_enabled("Executive"));
        assert!(!diag.is_enabled("Task"));
        assert!(!diag.is_enabled("Exexutive"));
        assert_eq!(diag.missing_keys(), vec!["Exexutive".to_string()]);
    }

    #[test]
    fn config_round_trips_through_json() {
        let mut cfg = SimConfig::default();
        cfg.ignore_causality_violations = true;
        cfg.diagnostics.enable("Milestone");
        let text = serde_json::to_string(&cfg).unwrap();
        let back: SimConfig = serde_json::from_str(&text).unwrap();
        assert!(back.ignore_causality_violations);
        assert!(back.diagnostics.is_enabled("Milestone"));
        assert_eq!(back.worker_threads, cfg.worker_threads);
    }
}
