//! Deployment: start, stop, readiness and image replacement
//!
//! The first start from Committed injects the observability and
//! fault-injection sidecars, then applies every supporting resource followed
//! by the ReplicaSet. A restart from Stopped only re-applies the ReplicaSet;
//! volumes, ConfigMaps, RBAC and Services survive a stop.

use tracing::{debug, info};

use crate::compiler::{CompiledPod, InstanceCompiler};
use crate::instance::{Instance, InstanceId, OTEL_CONFIG_PATH};
use crate::k8s::{ClusterResource, ResourceKind};
use crate::state::{InstanceState, Operation};
use crate::testbed::Testbed;
use tidepool_common::kube_utils::poll_until;
use tidepool_common::Error;

impl Testbed {
    /// Deploy the instance and wait until its pod is ready
    pub async fn start(&mut self, id: InstanceId) -> Result<(), Error> {
        self.start_without_wait(id).await?;
        self.wait_running(id).await
    }

    /// Deploy the instance and return as soon as the ReplicaSet is applied
    pub async fn start_without_wait(&mut self, id: InstanceId) -> Result<(), Error> {
        let idx = self.index(id)?;
        self.instances[idx].guard(Operation::Start)?;
        self.ensure_not_sidecar(idx, Operation::Start)?;
        for sidecar in self.instances[idx].sidecars.clone() {
            self.instance(sidecar)?.guard(Operation::Start)?;
        }

        let first_start = self.instances[idx].state == InstanceState::Committed;
        if first_start {
            self.inject_sidecars(idx).await?;
        }

        let compiled = self.compile_pod(idx)?;
        let name = self.instances[idx].name().to_string();
        let operation = Operation::Start.as_str();
        let cluster = &self.deps.cluster;

        if first_start {
            debug!(
                instance = %name,
                resources = ?compiled.supporting_names(),
                "Applying supporting resources"
            );
            for resource in &compiled.supporting {
                cluster
                    .apply(resource)
                    .await
                    .map_err(|e| Error::collaborator(&name, operation, e))?;
            }
        }
        cluster
            .apply(&ClusterResource::ReplicaSet(compiled.replica_set))
            .await
            .map_err(|e| Error::collaborator(&name, operation, e))?;

        self.set_pod_state(idx, InstanceState::Started);
        info!(instance = %name, first_start, "Started instance");
        Ok(())
    }

    /// Remove the compute unit, keeping volumes and other supporting resources
    pub async fn stop(&mut self, id: InstanceId) -> Result<(), Error> {
        let idx = self.index(id)?;
        self.instances[idx].guard(Operation::Stop)?;
        self.ensure_not_sidecar(idx, Operation::Stop)?;
        for sidecar in self.instances[idx].sidecars.clone() {
            self.instance(sidecar)?.guard(Operation::Stop)?;
        }

        let instance = &self.instances[idx];
        self.deps
            .cluster
            .delete(ResourceKind::ReplicaSet, instance.k8s_name(), None)
            .await
            .map_err(|e| Error::collaborator(instance.name(), Operation::Stop.as_str(), e))?;

        self.set_pod_state(idx, InstanceState::Stopped);
        let instance = &mut self.instances[idx];
        // shaping dies with the pod
        instance.fault.active_mode = None;
        info!(instance = %instance.name(), "Stopped instance");
        Ok(())
    }

    /// True when the instance's pod has a ready replica
    pub async fn is_running(&self, id: InstanceId) -> Result<bool, Error> {
        let idx = self.index(id)?;
        let instance = &self.instances[idx];
        instance.guard(Operation::IsRunning)?;
        self.deps
            .cluster
            .replica_set_ready(&self.pod_owner(idx)?)
            .await
            .map_err(|e| Error::collaborator(instance.name(), Operation::IsRunning.as_str(), e))
    }

    /// Poll readiness until the configured timeout or cancellation
    pub async fn wait_running(&self, id: InstanceId) -> Result<(), Error> {
        let idx = self.index(id)?;
        let instance = &self.instances[idx];
        instance.guard(Operation::WaitRunning)?;

        let owner = self.pod_owner(idx)?;
        let cluster = &self.deps.cluster;
        let settings = &self.deps.settings;
        poll_until(
            instance.name(),
            Operation::WaitRunning.as_str(),
            settings.readiness_poll_interval(),
            Some(settings.readiness_timeout()),
            &self.cancel,
            || cluster.replica_set_ready(&owner),
        )
        .await?;
        debug!(instance = %instance.name(), "Instance is running");
        Ok(())
    }

    /// Poll until the compute unit is gone
    ///
    /// There is no deadline; only the testbed's cancellation token ends the
    /// wait early.
    pub async fn wait_stopped(&self, id: InstanceId) -> Result<(), Error> {
        let idx = self.index(id)?;
        let instance = &self.instances[idx];
        instance.guard(Operation::WaitStopped)?;

        let owner = self.pod_owner(idx)?;
        poll_until(
            instance.name(),
            Operation::WaitStopped.as_str(),
            self.deps.settings.readiness_poll_interval(),
            None,
            &self.cancel,
            || self.replica_set_gone(&owner),
        )
        .await
    }

    async fn replica_set_gone(&self, owner: &str) -> Result<bool, Error> {
        let exists = self.deps.cluster.exists(ResourceKind::ReplicaSet, owner).await?;
        Ok(!exists)
    }

    /// Swap the image of a running instance by recreating its ReplicaSet
    ///
    /// `grace_period_secs` of `None` uses the cluster default. The instance
    /// keeps its previous image if any step fails.
    pub(crate) async fn replace_compute_unit(
        &mut self,
        idx: usize,
        image: &str,
        grace_period_secs: Option<u32>,
    ) -> Result<(), Error> {
        let previous = self.instances[idx].image.replace(image.to_string());
        let result = self.redeploy_replica_set(idx, grace_period_secs).await;
        let instance = &mut self.instances[idx];
        match &result {
            Ok(()) => info!(instance = %instance.name(), image = %image, "Replaced image"),
            Err(_) => instance.image = previous,
        }
        result
    }

    async fn redeploy_replica_set(
        &self,
        idx: usize,
        grace_period_secs: Option<u32>,
    ) -> Result<(), Error> {
        let replica_set = self.compile_pod(idx)?.replica_set;
        let instance = &self.instances[idx];
        let name = instance.name();
        let owner = instance.k8s_name();
        let operation = Operation::SetImage.as_str();
        let cluster = &self.deps.cluster;

        cluster
            .delete(ResourceKind::ReplicaSet, owner, grace_period_secs)
            .await
            .map_err(|e| Error::collaborator(name, operation, e))?;
        poll_until(
            name,
            operation,
            self.deps.settings.readiness_poll_interval(),
            Some(self.deps.settings.readiness_timeout()),
            &self.cancel,
            || self.replica_set_gone(owner),
        )
        .await?;
        cluster
            .apply(&ClusterResource::ReplicaSet(replica_set))
            .await
            .map_err(|e| Error::collaborator(name, operation, e))
    }

    fn compile_pod(&self, idx: usize) -> Result<CompiledPod, Error> {
        let parent = &self.instances[idx];
        let sidecars = parent
            .sidecars
            .iter()
            .map(|id| self.instance(*id))
            .collect::<Result<Vec<&Instance>, Error>>()?;
        let settings = &self.deps.settings;
        InstanceCompiler::new(parent, &settings.namespace)
            .with_sidecars(&sidecars)
            .with_init_image(&settings.init_image)
            .compile()
    }

    fn set_pod_state(&mut self, idx: usize, state: InstanceState) {
        for sidecar in self.instances[idx].sidecars.clone() {
            self.instances[sidecar.0].state = state;
        }
        self.instances[idx].state = state;
    }

    // =========================================================================
    // Sidecar injection
    // =========================================================================

    /// Attach the configured sidecars that are not attached yet
    ///
    /// A start that failed after injection leaves the parent Committed with
    /// its sidecars in place; the retry must not add a second copy.
    async fn inject_sidecars(&mut self, idx: usize) -> Result<(), Error> {
        let parent = &self.instances[idx];
        let wants_collector = parent.observability().is_enabled() && parent.collector.is_none();
        let wants_fault = parent.fault_injection().enabled && parent.fault.sidecar.is_none();

        if wants_collector {
            self.inject_collector(idx).await?;
        }
        if wants_fault {
            self.inject_fault_sidecar(idx).await?;
        }
        Ok(())
    }

    async fn inject_collector(&mut self, idx: usize) -> Result<(), Error> {
        let parent = &self.instances[idx];
        let parent_id = parent.id();
        let observability = parent.observability().clone();
        let sidecar_name = format!("{}-otel-collector", parent.name());
        let image = format!(
            "{}:{}",
            self.deps.settings.otel_collector_image, observability.collector_version
        );
        let config = serde_json::to_vec_pretty(&observability.collector_config())
            .map_err(|e| Error::serialization_for_kind("collector config", e.to_string()))?;

        let collector = self.create_instance(&sidecar_name)?;
        self.set_image(collector, &image).await?;
        self.commit(collector).await?;

        let sidecar = self.instance_mut(collector)?;
        sidecar.add_file_bytes(config, OTEL_CONFIG_PATH, "0:0").await?;
        sidecar.set_args(["--config", OTEL_CONFIG_PATH])?;
        for port in observability.receiver_ports_tcp() {
            if !sidecar.ports_tcp().contains(&port) {
                sidecar.add_port_tcp(port)?;
            }
        }
        for port in observability.receiver_ports_udp() {
            if !sidecar.ports_udp().contains(&port) {
                sidecar.add_port_udp(port)?;
            }
        }

        self.add_sidecar(parent_id, collector)?;
        self.instances[idx].collector = Some(collector);
        debug!(
            instance = %self.instances[idx].name(),
            image = %image,
            "Injected collector sidecar"
        );
        Ok(())
    }

    async fn inject_fault_sidecar(&mut self, idx: usize) -> Result<(), Error> {
        let parent = &self.instances[idx];
        let parent_id = parent.id();
        let port = parent.fault_injection().port;
        let sidecar_name = format!("{}-fault", parent.name());
        let image = self.deps.settings.fault_injection_image.clone();

        let fault = self.create_instance(&sidecar_name)?;
        self.set_image(fault, &image).await?;
        self.commit(fault).await?;

        let sidecar = self.instance_mut(fault)?;
        sidecar.set_privileged(true)?;
        sidecar.add_capability("NET_ADMIN")?;
        sidecar.add_port_tcp(port)?;
        sidecar.set_env("SERVE_ADDR", format!("0.0.0.0:{}", port))?;
        let sidecar_k8s = sidecar.k8s_name().to_string();

        self.add_sidecar(parent_id, fault)?;
        let parent = &mut self.instances[idx];
        parent.fault.sidecar = Some(sidecar_k8s);
        debug!(instance = %parent.name(), image = %image, "Injected fault-injection sidecar");
        Ok(())
    }
}
