//! Logging initialization for test harnesses driving tidepool
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` and either a
//! JSON or human-readable formatter. `RUST_LOG` overrides the default filter.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Default filter when `RUST_LOG` is not set
pub const DEFAULT_FILTER: &str = "info,tidepool=debug,kube=info,tower=warn,hyper=warn";

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The filter directive could not be parsed
    #[error("invalid log filter: {0}")]
    Filter(String),

    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Configuration for logging initialization
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Emit JSON lines instead of human-readable output
    pub json: bool,

    /// Filter used when `RUST_LOG` is unset
    pub default_filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            json: std::env::var("TIDEPOOL_LOG_JSON").is_ok_and(|v| v == "true" || v == "1"),
            default_filter: DEFAULT_FILTER.to_string(),
        }
    }
}

/// Initialize logging with the given configuration
///
/// Fails if a global subscriber is already installed, so test binaries that
/// call this from several tests should ignore the error.
///
/// ```ignore
/// use tidepool_common::telemetry::{init_logging, LogConfig};
///
/// let _ = init_logging(LogConfig::default());
/// ```
pub fn init_logging(config: LogConfig) -> Result<(), TelemetryError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.default_filter)
            .map_err(|e| TelemetryError::Filter(e.to_string()))?,
    };

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::SubscriberInit(e.to_string())
        })?;

    Ok(())
}
