//! Network faults on running instances
//!
//! Traffic shaping goes through the fault-injection sidecar injected at first
//! start. At most one shaping mode is active per instance; switching modes
//! stops the previous one first. Isolation is a NetworkPolicy on the pod and
//! needs no sidecar.

pub mod client;

pub use client::{FaultClientError, FaultInjectionClient, ShapingKind};

#[cfg(test)]
pub use client::MockFaultInjectionClient;

use tracing::{debug, info};

use crate::compiler::compile_isolation_policy;
use crate::instance::InstanceId;
use crate::k8s::{ClusterResource, ResourceKind};
use crate::state::Operation;
use crate::testbed::Testbed;
use tidepool_common::Error;

/// A shaping mode with its parameters
#[derive(Clone, Copy, Debug)]
enum Shaping {
    Bandwidth { limit_bps: u64 },
    LatencyJitter { latency_ms: u64, jitter_ms: u64 },
    PacketLoss { percent: u8 },
}

impl Shaping {
    fn kind(self) -> ShapingKind {
        match self {
            Shaping::Bandwidth { .. } => ShapingKind::Bandwidth,
            Shaping::LatencyJitter { .. } => ShapingKind::LatencyJitter,
            Shaping::PacketLoss { .. } => ShapingKind::PacketLoss,
        }
    }
}

impl Testbed {
    /// Limit the instance's bandwidth to `limit_bps` bits per second
    pub async fn set_bandwidth_limit(
        &mut self,
        id: InstanceId,
        limit_bps: u64,
    ) -> Result<(), Error> {
        self.shape(id, Operation::SetBandwidthLimit, Some(Shaping::Bandwidth { limit_bps }))
            .await
    }

    /// Delay the instance's traffic by `latency_ms` plus up to `jitter_ms`
    pub async fn set_latency_and_jitter(
        &mut self,
        id: InstanceId,
        latency_ms: u64,
        jitter_ms: u64,
    ) -> Result<(), Error> {
        self.shape(
            id,
            Operation::SetLatencyAndJitter,
            Some(Shaping::LatencyJitter { latency_ms, jitter_ms }),
        )
        .await
    }

    /// Drop `percent` (0 to 100) of the instance's packets
    pub async fn set_packet_loss(&mut self, id: InstanceId, percent: u8) -> Result<(), Error> {
        if percent > 100 {
            let name = self.instance(id)?.name();
            return Err(Error::validation_for(
                name,
                format!("packet loss must be between 0 and 100 percent, got {}", percent),
            ));
        }
        self.shape(id, Operation::SetPacketLoss, Some(Shaping::PacketLoss { percent }))
            .await
    }

    /// Stop the active shaping mode, if any
    pub async fn clear_shaping(&mut self, id: InstanceId) -> Result<(), Error> {
        self.shape(id, Operation::ClearShaping, None).await
    }

    async fn shape(
        &mut self,
        id: InstanceId,
        operation: Operation,
        shaping: Option<Shaping>,
    ) -> Result<(), Error> {
        let idx = self.index(id)?;
        let instance = &self.instances[idx];
        instance.guard(operation)?;
        let name = instance.name().to_string();
        let config = instance.fault_injection().clone();

        if !config.enabled {
            return Err(Error::validation_for(&name, "fault injection is not enabled"));
        }
        let target = config
            .sidecar
            .clone()
            .ok_or_else(|| Error::invariant(&name, "fault-injection sidecar was never injected"))?;
        let client = self
            .deps
            .fault
            .clone()
            .ok_or_else(|| Error::validation_for(&name, "no fault-injection client configured"))?;
        let op = operation.as_str();

        // the requested kind is stopped too in case the sidecar kept stale shaping
        let mut to_stop: Vec<ShapingKind> = config.active_mode.into_iter().collect();
        if let Some(kind) = shaping.map(Shaping::kind) {
            if !to_stop.contains(&kind) {
                to_stop.push(kind);
            }
        }
        for kind in to_stop {
            match client.stop(&target, config.port, kind).await {
                Ok(()) => debug!(instance = %name, mode = %kind, "Stopped shaping"),
                Err(e) if e.is_idle() => {
                    debug!(instance = %name, mode = %kind, error = %e, "Shaping was not running")
                }
                Err(e) => return Err(Error::collaborator(&name, op, e)),
            }
        }
        self.instances[idx].fault.active_mode = None;

        let Some(shaping) = shaping else {
            info!(instance = %name, "Cleared traffic shaping");
            return Ok(());
        };

        let interface = config.interface.as_str();
        let started = match shaping {
            Shaping::Bandwidth { limit_bps } => {
                client
                    .start_bandwidth(&target, config.port, interface, limit_bps)
                    .await
            }
            Shaping::LatencyJitter { latency_ms, jitter_ms } => {
                client
                    .start_latency(&target, config.port, interface, latency_ms, jitter_ms)
                    .await
            }
            Shaping::PacketLoss { percent } => {
                client
                    .start_packet_loss(&target, config.port, interface, percent)
                    .await
            }
        };
        started.map_err(|e| Error::collaborator(&name, op, e))?;

        self.instances[idx].fault.active_mode = Some(shaping.kind());
        info!(
            instance = %name,
            shaping = ?shaping,
            interface = %interface,
            "Applied traffic shaping"
        );
        Ok(())
    }

    // =========================================================================
    // Isolation
    // =========================================================================

    /// Cut the instance's pod off from everything but executor instances
    pub async fn disable_network(&self, id: InstanceId) -> Result<(), Error> {
        let idx = self.index(id)?;
        let instance = &self.instances[idx];
        instance.guard(Operation::DisableNetwork)?;

        let policy = compile_isolation_policy(&self.pod_owner(idx)?, &self.deps.settings.namespace);
        self.deps
            .cluster
            .apply(&ClusterResource::NetworkPolicy(policy))
            .await
            .map_err(|e| {
                Error::collaborator(instance.name(), Operation::DisableNetwork.as_str(), e)
            })?;
        info!(instance = %instance.name(), "Disabled network");
        Ok(())
    }

    /// Remove the isolation policy
    pub async fn enable_network(&self, id: InstanceId) -> Result<(), Error> {
        let idx = self.index(id)?;
        let instance = &self.instances[idx];
        instance.guard(Operation::EnableNetwork)?;

        self.deps
            .cluster
            .delete(ResourceKind::NetworkPolicy, &self.pod_owner(idx)?, None)
            .await
            .map_err(|e| {
                Error::collaborator(instance.name(), Operation::EnableNetwork.as_str(), e)
            })?;
        info!(instance = %instance.name(), "Enabled network");
        Ok(())
    }

    pub async fn network_is_disabled(&self, id: InstanceId) -> Result<bool, Error> {
        let idx = self.index(id)?;
        let instance = &self.instances[idx];
        instance.guard(Operation::NetworkIsDisabled)?;

        self.deps
            .cluster
            .exists(ResourceKind::NetworkPolicy, &self.pod_owner(idx)?)
            .await
            .map_err(|e| {
                Error::collaborator(instance.name(), Operation::NetworkIsDisabled.as_str(), e)
            })
    }
}
