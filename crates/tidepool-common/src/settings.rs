//! Runtime settings for a tidepool testbed
//!
//! Defaults match a disposable test cluster pushing to an anonymous
//! registry. `Settings::from_env` overlays `TIDEPOOL_*` variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Namespace every instance is deployed into
pub const DEFAULT_NAMESPACE: &str = "tidepool";
/// Registry that commit pushes changed images to
pub const DEFAULT_IMAGE_REGISTRY: &str = "ttl.sh";
/// Tag doubling as the image lifetime on ttl.sh
pub const DEFAULT_IMAGE_TTL: &str = "24h";
/// Image of the OpenTelemetry collector sidecar, without the version tag
pub const DEFAULT_OTEL_COLLECTOR_IMAGE: &str = "otel/opentelemetry-collector-contrib";
/// Image of the fault-injection sidecar
pub const DEFAULT_FAULT_INJECTION_IMAGE: &str = "ghcr.io/celestiaorg/bittwister:0.0.12";
/// Image of the init container applying volume ownership
pub const DEFAULT_INIT_IMAGE: &str = "docker.io/busybox:1.36";

/// Runtime settings shared by every instance of a testbed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// Kubernetes namespace for all resources
    pub namespace: String,
    /// Registry host for pushed images
    pub image_registry: String,
    /// Tag used for pushed images
    pub image_ttl: String,
    /// Upper bound on the readiness wait after start
    pub readiness_timeout_secs: u64,
    /// Interval between readiness polls
    pub readiness_poll_interval_ms: u64,
    /// Tunnel attempts before port forwarding gives up
    pub port_forward_attempts: u32,
    /// Fixed pause between tunnel attempts
    pub port_forward_retry_delay_secs: u64,
    /// Collector image (version appended from the observability config)
    pub otel_collector_image: String,
    /// Fault-injection sidecar image
    pub fault_injection_image: String,
    /// Init container image for volume ownership
    pub init_image: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            image_registry: DEFAULT_IMAGE_REGISTRY.to_string(),
            image_ttl: DEFAULT_IMAGE_TTL.to_string(),
            readiness_timeout_secs: 60,
            readiness_poll_interval_ms: 1000,
            port_forward_attempts: 5,
            port_forward_retry_delay_secs: 5,
            otel_collector_image: DEFAULT_OTEL_COLLECTOR_IMAGE.to_string(),
            fault_injection_image: DEFAULT_FAULT_INJECTION_IMAGE.to_string(),
            init_image: DEFAULT_INIT_IMAGE.to_string(),
        }
    }
}

impl Settings {
    /// Read settings from `TIDEPOOL_*` environment variables over defaults
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup over defaults
    ///
    /// Keys are the upper-snake field names prefixed with `TIDEPOOL_`, e.g.
    /// `TIDEPOOL_READINESS_TIMEOUT_SECS`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut settings = Self::default();

        if let Some(v) = lookup("TIDEPOOL_NAMESPACE") {
            settings.namespace = v;
        }
        if let Some(v) = lookup("TIDEPOOL_IMAGE_REGISTRY") {
            settings.image_registry = v;
        }
        if let Some(v) = lookup("TIDEPOOL_IMAGE_TTL") {
            settings.image_ttl = v;
        }
        if let Some(v) = lookup("TIDEPOOL_READINESS_TIMEOUT_SECS") {
            settings.readiness_timeout_secs = parse_number("TIDEPOOL_READINESS_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("TIDEPOOL_READINESS_POLL_INTERVAL_MS") {
            settings.readiness_poll_interval_ms =
                parse_number("TIDEPOOL_READINESS_POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("TIDEPOOL_PORT_FORWARD_ATTEMPTS") {
            settings.port_forward_attempts = parse_number("TIDEPOOL_PORT_FORWARD_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("TIDEPOOL_PORT_FORWARD_RETRY_DELAY_SECS") {
            settings.port_forward_retry_delay_secs =
                parse_number("TIDEPOOL_PORT_FORWARD_RETRY_DELAY_SECS", &v)?;
        }
        if let Some(v) = lookup("TIDEPOOL_OTEL_COLLECTOR_IMAGE") {
            settings.otel_collector_image = v;
        }
        if let Some(v) = lookup("TIDEPOOL_FAULT_INJECTION_IMAGE") {
            settings.fault_injection_image = v;
        }
        if let Some(v) = lookup("TIDEPOOL_INIT_IMAGE") {
            settings.init_image = v;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings that would make every start or port forward fail
    pub fn validate(&self) -> Result<(), Error> {
        if self.namespace.is_empty() {
            return Err(Error::validation("namespace must not be empty"));
        }
        if self.image_registry.is_empty() {
            return Err(Error::validation("image registry must not be empty"));
        }
        if self.readiness_poll_interval_ms == 0 {
            return Err(Error::validation(
                "readiness poll interval must be greater than zero",
            ));
        }
        if self.port_forward_attempts == 0 {
            return Err(Error::validation(
                "port forward attempts must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Readiness wait deadline
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    /// Interval between readiness polls
    pub fn readiness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_interval_ms)
    }

    /// Pause between tunnel attempts
    pub fn port_forward_retry_delay(&self) -> Duration {
        Duration::from_secs(self.port_forward_retry_delay_secs)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, Error> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::validation(format!("{key}={value:?} is not a valid number")))
}
