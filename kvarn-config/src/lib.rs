//! # Kvarn Configuration System
//!
//! Hierarchical configuration for the kvarn packet runtime: table sizes,
//! scheduler tuning, predefined pools and telemetry.
//!
//! ## Features
//! - **Layered sources**: defaults, YAML files and `KVARN_*` environment variables
//! - **Validation**: field ranges via `validator` plus cross-field limit checks
//! - **Environment awareness**: `KVARN_ENV` selects an override file

#![warn(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

mod error;
mod pool;
mod runtime;
mod telemetry;
mod validation;

pub use error::ConfigError;
pub use pool::{PoolConfig, PoolKind};
pub use runtime::{BackoffStrategy, RuntimeConfig};
pub use telemetry::TelemetryConfig;

const BASE_FILE: &str = "config/kvarn.yaml";
const ENV_PREFIX: &str = "KVARN_";

/// Top-level configuration container for the kvarn runtime.
#[derive(Debug, Serialize, Deserialize, Validate, Default, Clone)]
pub struct KvarnConfig {
    /// Resource tables, scheduler tuning and predefined pools.
    #[validate(nested)]
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Logging and metrics settings.
    #[validate(nested)]
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl KvarnConfig {
    /// Load configuration from default files and environment.
    ///
    /// Hierarchy:
    /// 1. Default values
    /// 2. `config/kvarn.yaml` if present
    /// 3. `config/<KVARN_ENV>.yaml` (`production` when unset) if present
    /// 4. `KVARN_*` environment variables, `__` separating nested keys
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(KvarnConfig::default()));

        if Path::new(BASE_FILE).exists() {
            figment = figment.merge(Yaml::file(BASE_FILE));
        } else {
            tracing::debug!("{} not found, using default configuration", BASE_FILE);
        }

        let env = std::env::var("KVARN_ENV").unwrap_or_else(|_| "production".into());
        let env_file = format!("config/{}.yaml", env);
        if Path::new(&env_file).exists() {
            figment = figment.merge(Yaml::file(env_file));
        }

        Self::finish(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Load configuration from a specific file plus environment overrides.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(PathBuf::from(path)));
        }

        Self::finish(
            Figment::from(Serialized::defaults(KvarnConfig::default()))
                .merge(Yaml::file(path))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    /// Runs field validation followed by the cross-field limit checks.
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()?;
        self.runtime.check_limits()
    }

    fn finish(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.check()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn default_config_validates() {
        let config = KvarnConfig::default();
        config.check().expect("default config should validate");
    }

    #[test]
    fn loads_base_file_and_environment_override() {
        Jail::expect_with(|jail| {
            jail.create_dir("config")?;
            jail.create_file(
                "config/kvarn.yaml",
                r#"
runtime:
  max_queues: 64
  sched_batch: 8
  pools:
    - name: pkt
      kind: packet
      capacity: 512
      seg_size: 256
telemetry:
  log_level: debug
"#,
            )?;
            jail.set_env("KVARN_RUNTIME__SCHED_PRIORITIES", "4");

            let config = KvarnConfig::load().map_err(|e| e.to_string())?;
            assert_eq!(config.runtime.max_queues, 64);
            assert_eq!(config.runtime.sched_batch, 8);
            assert_eq!(config.runtime.sched_priorities, 4);
            assert_eq!(config.runtime.pools.len(), 1);
            assert_eq!(config.runtime.pools[0].kind, PoolKind::Packet);
            assert_eq!(config.runtime.pools[0].headroom, 64);
            assert_eq!(config.telemetry.log_level, "debug");
            Ok(())
        });
    }

    #[test]
    fn environment_file_overrides_base() {
        Jail::expect_with(|jail| {
            jail.create_dir("config")?;
            jail.create_file("config/kvarn.yaml", "runtime:\n  sched_batch: 2\n")?;
            jail.create_file("config/bench.yaml", "runtime:\n  sched_batch: 16\n")?;
            jail.set_env("KVARN_ENV", "bench");

            let config = KvarnConfig::load().map_err(|e| e.to_string())?;
            assert_eq!(config.runtime.sched_batch, 16);
            Ok(())
        });
    }

    #[test]
    fn missing_file_is_reported() {
        let err = KvarnConfig::load_from_path("does/not/exist.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn out_of_range_value_fails_validation() {
        Jail::expect_with(|jail| {
            jail.create_file("kvarn.yaml", "runtime:\n  sched_priorities: 0\n")?;
            let err = KvarnConfig::load_from_path("kvarn.yaml").unwrap_err();
            assert!(matches!(err, ConfigError::Validation(_)));
            assert!(err.to_string().contains("sched_priorities"));
            Ok(())
        });
    }

    #[test]
    fn metrics_namespace_must_be_a_metric_prefix() {
        Jail::expect_with(|jail| {
            jail.create_file("kvarn.yaml", "telemetry:\n  metrics_namespace: edge-node\n")?;
            let err = KvarnConfig::load_from_path("kvarn.yaml").unwrap_err();
            assert!(matches!(err, ConfigError::Validation(_)));
            assert!(err.to_string().contains("metrics_namespace"));

            jail.create_file("kvarn.yaml", "telemetry:\n  metrics_namespace: edge_node\n")?;
            let config = KvarnConfig::load_from_path("kvarn.yaml").map_err(|e| e.to_string())?;
            assert_eq!(config.telemetry.metrics_namespace, "edge_node");
            Ok(())
        });
    }

        #[test]
    fn backoff_strategy_parses_lowercase() {
        Jail::expect_with(|jail| {
            jail.create_file("kvarn.yaml", "runtime:\n  backoff: yield\n")?;
            let config = KvarnConfig::load_from_path("kvarn.yaml").map_err(|e| e.to_string())?;
            assert_eq!(config.runtime.backoff, BackoffStrategy::Yield);
            Ok(())
        });
    }
}
