//! # Kvarn Telemetry
//!
//! Logging setup and Prometheus metrics for the kvarn runtime.

use thiserror::Error;

pub mod logging;
pub mod metrics;

pub use logging::EventLogger;
pub use metrics::MetricsRecorder;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("metrics registry error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("metrics output is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),

    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}
