//! Facade configuration.
//!
//! Mirrors `PSPConfig` in the original source almost field-for-field, loaded
//! the way the teacher's `main.rs` loads its kill-switch thresholds: defaults
//! baked in, overridable by environment variable, with `dotenv` populating
//! the process environment from a local `.env` first.

use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PspConfig {
    /// If true, the commit gate fails when available funds are short.
    pub commit_gate_strict: bool,
    /// The pay gate can never be bypassed regardless of this flag; it exists
    /// only so a misconfiguration can't silently disable it either.
    pub pay_gate_always_enforced: bool,
    /// How long a `held` reservation lives before it expires.
    pub reservation_ttl_hours: i64,
    /// Rail used when a batch doesn't specify one.
    pub default_rail: String,
    /// Funding model assumed at commit time when the batch doesn't specify
    /// one: `prefund_all`, `prefund_taxes`, or `postfund`.
    pub default_funding_model: String,
    /// When false, the facade still performs every gate/ledger/orchestrator
    /// step but emits no domain events - useful for replaying historical
    /// batches without re-publishing their timeline.
    pub emit_events: bool,
}

impl Default for PspConfig {
    fn default() -> Self {
        Self {
            commit_gate_strict: false,
            pay_gate_always_enforced: true,
            reservation_ttl_hours: 24,
            default_rail: "ach".to_string(),
            default_funding_model: "prefund_all".to_string(),
            emit_events: true,
        }
    }
}

impl PspConfig {
    /// Load defaults, then a TOML file if present, then environment
    /// overrides (`PSP_COMMIT_GATE_STRICT`, `PSP_DEFAULT_RAIL`, ...).
    pub fn load(toml_path: Option<&Path>) -> anyhow::Result<Self> {
        let _ = dotenv::dotenv();

        let mut config = match toml_path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)?;
                toml::from_str(&raw)?
            }
            _ => PspConfig::default(),
        };

        if let Ok(v) = env::var("PSP_COMMIT_GATE_STRICT") {
            config.commit_gate_strict = matches!(v.as_str(), "1" | "true" | "TRUE" | "on");
        }
        if let Ok(v) = env::var("PSP_PAY_GATE_ALWAYS_ENFORCED") {
            config.pay_gate_always_enforced = matches!(v.as_str(), "1" | "true" | "TRUE" | "on");
        }
        if let Ok(v) = env::var("PSP_RESERVATION_TTL_HOURS") {
            if let Ok(hours) = v.parse::<i64>() {
                config.reservation_ttl_hours = hours;
            }
        }
        if let Ok(v) = env::var("PSP_DEFAULT_RAIL") {
            config.default_rail = v;
        }
        if let Ok(v) = env::var("PSP_DEFAULT_FUNDING_MODEL") {
            config.default_funding_model = v;
        }
        if let Ok(v) = env::var("PSP_EMIT_EVENTS") {
            config.emit_events = matches!(v.as_str(), "1" | "true" | "TRUE" | "on");
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = PspConfig::default();
        assert!(!config.commit_gate_strict);
        assert!(config.pay_gate_always_enforced);
        assert_eq!(config.default_funding_model, "prefund_all");
    }

    #[test]
    fn missing_toml_path_falls_back_to_defaults() {
        let config = PspConfig::load(Some(Path::new("/nonexistent/psp.toml"))).unwrap();
        assert_eq!(config.default_rail, "ach");
    }
}
