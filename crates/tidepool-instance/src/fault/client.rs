//! Client for the fault-injection sidecar's shaping API

use async_trait::async_trait;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

/// Errors reported by the fault-injection sidecar
#[derive(Debug, Error)]
pub enum FaultClientError {
    /// The shaping service has not been initialized on the interface
    #[error("traffic shaping service not initialized")]
    NotInitialized,

    /// The shaping service is not ready to accept requests
    #[error("traffic shaping service not ready")]
    NotReady,

    /// The shaping mode is not running
    #[error("traffic shaping service not started")]
    NotStarted,

    /// Any other failure talking to the sidecar
    #[error("traffic shaping request failed: {0}")]
    Request(String),
}

impl FaultClientError {
    /// True when stopping failed only because nothing was running
    pub fn is_idle(&self) -> bool {
        matches!(
            self,
            FaultClientError::NotInitialized
                | FaultClientError::NotReady
                | FaultClientError::NotStarted
        )
    }
}

/// Shaping modes, at most one active per instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShapingKind {
    Bandwidth,
    LatencyJitter,
    PacketLoss,
}

impl std::fmt::Display for ShapingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ShapingKind::Bandwidth => "bandwidth",
            ShapingKind::LatencyJitter => "latency/jitter",
            ShapingKind::PacketLoss => "packet loss",
        };
        f.write_str(s)
    }
}

/// Talks to the fault-injection sidecar of a running instance
///
/// `target` is the Service name of the fault-injection sidecar, which shares
/// the shaped instance's pod.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FaultInjectionClient: Send + Sync {
    /// Limit bandwidth on `interface` to `limit_bps` bits per second
    async fn start_bandwidth(
        &self,
        target: &str,
        port: u16,
        interface: &str,
        limit_bps: u64,
    ) -> Result<(), FaultClientError>;

    /// Add latency and jitter, in milliseconds, on `interface`
    async fn start_latency(
        &self,
        target: &str,
        port: u16,
        interface: &str,
        latency_ms: u64,
        jitter_ms: u64,
    ) -> Result<(), FaultClientError>;

    /// Drop `percent` of packets on `interface`
    async fn start_packet_loss(
        &self,
        target: &str,
        port: u16,
        interface: &str,
        percent: u8,
    ) -> Result<(), FaultClientError>;

    /// Stop a shaping mode
    async fn stop(&self, target: &str, port: u16, kind: ShapingKind)
        -> Result<(), FaultClientError>;
}
