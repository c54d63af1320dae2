//! Logging and metrics configuration.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::validation;

/// Telemetry configuration.
#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct TelemetryConfig {
    /// Fallback filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    #[validate(custom(function = validation::validate_log_level))]
    pub log_level: String,

    /// Include thread names in log lines.
    #[serde(default = "default_true")]
    pub thread_names: bool,

    /// Prefix for every exported metric.
    #[serde(default = "default_namespace")]
    #[validate(custom(function = validation::validate_metrics_namespace))]
    pub metrics_namespace: String,
}

fn default_log_level() -> String {
    "info".into()
}

fn default_true() -> bool {
    true
}

fn default_namespace() -> String {
    "kvarn".into()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            thread_names: default_true(),
            metrics_namespace: default_namespace(),
        }
    }
}
