//! ## kvarn-telemetry::logging
//! **`tracing` subscriber setup**
//!
//! The runtime itself only emits `tracing` events; embedding programs call
//! [`EventLogger::init`] once to print them. `RUST_LOG` wins over the
//! configured level.

use kvarn_config::TelemetryConfig;
use tracing_subscriber::{fmt, EnvFilter};

use crate::TelemetryError;

#[derive(Clone)]
pub struct EventLogger;

impl EventLogger {
    /// Installs the global subscriber.
    ///
    /// # Panics
    /// If a global subscriber is already installed.
    pub fn init(config: &TelemetryConfig) {
        fmt()
            .with_env_filter(Self::filter(config))
            .with_thread_names(config.thread_names)
            .init()
    }

    /// Like [`EventLogger::init`], but reports an existing subscriber as an error.
    pub fn try_init(config: &TelemetryConfig) -> Result<(), TelemetryError> {
        fmt()
            .with_env_filter(Self::filter(config))
            .with_thread_names(config.thread_names)
            .try_init()
            .map_err(|e| TelemetryError::Subscriber(e.to_string()))
    }

    fn filter(config: &TelemetryConfig) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.log_level))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_install_is_an_error() {
        let config = TelemetryConfig::default();
        let _ = EventLogger::try_init(&config);
        assert!(matches!(
            EventLogger::try_init(&config),
            Err(TelemetryError::Subscriber(_))
        ));
    }
}
