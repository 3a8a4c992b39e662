//! The instance registry
//!
//! A [`Testbed`] owns every instance it creates together with the
//! collaborators they are deployed through. Instances are addressed by
//! [`InstanceId`]; parent/sidecar links are id lookups into the registry.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::builder::{GitContext, ImageBuilder, PassthroughBuilder};
use crate::cache::BuildCache;
use crate::cluster::{ClusterClient, CustomResourceType};
use crate::compiler::compile_service;
use crate::fault::FaultInjectionClient;
use crate::instance::{Instance, InstanceId};
use crate::k8s::ClusterResource;
use crate::names::{NameGenerator, RandomNameGenerator};
use crate::proxy::{host_prefix, Proxy};
use crate::state::{InstanceState, Operation};
use tidepool_common::{Error, Settings};

/// Collaborators shared by every instance of a testbed
#[derive(Clone)]
pub struct Dependencies {
    pub cluster: Arc<dyn ClusterClient>,
    pub builder: Arc<dyn ImageBuilder>,
    pub fault: Option<Arc<dyn FaultInjectionClient>>,
    pub proxy: Option<Arc<dyn Proxy>>,
    pub names: Arc<dyn NameGenerator>,
    pub cache: Arc<BuildCache>,
    pub settings: Settings,
}

impl Dependencies {
    /// Prebuilt images only, random names, a fresh build cache
    pub fn new(cluster: Arc<dyn ClusterClient>, settings: Settings) -> Self {
        Self {
            cluster,
            builder: Arc::new(PassthroughBuilder),
            fault: None,
            proxy: None,
            names: Arc::new(RandomNameGenerator),
            cache: Arc::new(BuildCache::new()),
            settings,
        }
    }

    pub fn with_builder(mut self, builder: Arc<dyn ImageBuilder>) -> Self {
        self.builder = builder;
        self
    }

    pub fn with_fault_client(mut self, fault: Arc<dyn FaultInjectionClient>) -> Self {
        self.fault = Some(fault);
        self
    }

    pub fn with_proxy(mut self, proxy: Arc<dyn Proxy>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_name_generator(mut self, names: Arc<dyn NameGenerator>) -> Self {
        self.names = names;
        self
    }

    /// Share a build cache with other testbeds
    pub fn with_cache(mut self, cache: Arc<BuildCache>) -> Self {
        self.cache = cache;
        self
    }
}

/// Registry of instances and the entry point for every lifecycle operation
pub struct Testbed {
    pub(crate) deps: Dependencies,
    pub(crate) instances: Vec<Instance>,
    pub(crate) cancel: CancellationToken,
}

impl Testbed {
    pub fn new(deps: Dependencies) -> Self {
        Self {
            deps,
            instances: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Token that aborts every readiness and stop wait when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn settings(&self) -> &Settings {
        &self.deps.settings
    }

    /// All instances in creation order
    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.instances.iter()
    }

    pub(crate) fn index(&self, id: InstanceId) -> Result<usize, Error> {
        if id.0 < self.instances.len() {
            Ok(id.0)
        } else {
            Err(Error::validation(format!("unknown instance {}", id)))
        }
    }

    pub fn instance(&self, id: InstanceId) -> Result<&Instance, Error> {
        Ok(&self.instances[self.index(id)?])
    }

    pub fn instance_mut(&mut self, id: InstanceId) -> Result<&mut Instance, Error> {
        let idx = self.index(id)?;
        Ok(&mut self.instances[idx])
    }

    /// Cluster name of the compute unit an instance runs in
    ///
    /// A sidecar runs in its parent's pod.
    pub(crate) fn pod_owner(&self, idx: usize) -> Result<String, Error> {
        let instance = &self.instances[idx];
        match instance.parent {
            Some(parent) => Ok(self.instance(parent)?.k8s_name().to_string()),
            None => Ok(instance.k8s_name().to_string()),
        }
    }

    /// Register a new instance in state None
    pub fn create_instance(&mut self, name: &str) -> Result<InstanceId, Error> {
        let k8s_name = self.deps.names.generate(name)?;
        self.push_instance(|id| Instance::new(id, name, k8s_name))
    }

    fn push_instance(
        &mut self,
        make: impl FnOnce(InstanceId) -> Instance,
    ) -> Result<InstanceId, Error> {
        let id = InstanceId(self.instances.len());
        let instance = make(id);
        if self.instances.iter().any(|i| i.k8s_name() == instance.k8s_name()) {
            return Err(Error::invariant(
                instance.name(),
                format!("cluster name {} is already in use", instance.k8s_name()),
            ));
        }
        debug!(instance = %instance.name(), k8s_name = %instance.k8s_name(), "Created instance");
        self.instances.push(instance);
        Ok(id)
    }

    // =========================================================================
    // Image selection
    // =========================================================================

    /// Choose the base image, or replace the image of a running instance
    ///
    /// The first call opens a build context and moves the instance to
    /// Preparing. While Started the compute unit is replaced with the default
    /// grace period.
    pub async fn set_image(&mut self, id: InstanceId, image: &str) -> Result<(), Error> {
        let idx = self.index(id)?;
        let instance = &self.instances[idx];
        instance.guard(Operation::SetImage)?;

        if instance.state == InstanceState::Started {
            self.ensure_not_sidecar(idx, Operation::SetImage)?;
            return self.replace_compute_unit(idx, image, None).await;
        }

        let ctx = self
            .deps
            .builder
            .open(image)
            .await
            .map_err(|e| {
                Error::collaborator(self.instances[idx].name(), Operation::SetImage.as_str(), e)
            })?;

        let instance = &mut self.instances[idx];
        instance.build_context = Some(ctx);
        instance.state = InstanceState::Preparing;
        info!(instance = %instance.name(), image = %image, state = %instance.state, "Set image");
        Ok(())
    }

    /// Replace the image of a running instance without a grace period
    pub async fn set_image_instant(&mut self, id: InstanceId, image: &str) -> Result<(), Error> {
        let idx = self.index(id)?;
        self.instances[idx].guard(Operation::SetImageInstant)?;
        self.ensure_not_sidecar(idx, Operation::SetImageInstant)?;
        self.replace_compute_unit(idx, image, Some(0)).await
    }

    /// Build the image from a git source and start preparing from it
    pub async fn set_git_repo(&mut self, id: InstanceId, git: &GitContext) -> Result<(), Error> {
        let idx = self.index(id)?;
        self.instances[idx].guard(Operation::SetGitRepo)?;

        let image_name = git.image_name(&self.deps.settings.image_registry);
        let ctx = self
            .deps
            .builder
            .open_git(git, &image_name)
            .await
            .map_err(|e| {
                Error::collaborator(self.instances[idx].name(), Operation::SetGitRepo.as_str(), e)
            })?;

        let instance = &mut self.instances[idx];
        instance.build_context = Some(ctx);
        instance.state = InstanceState::Preparing;
        info!(instance = %instance.name(), repo = %git.repo, image = %image_name, "Set git repo");
        Ok(())
    }

    pub(crate) fn ensure_not_sidecar(&self, idx: usize, operation: Operation) -> Result<(), Error> {
        let instance = &self.instances[idx];
        if instance.is_sidecar() {
            return Err(Error::invariant(
                instance.name(),
                format!("{} is not allowed on a sidecar; its parent drives it", operation),
            ));
        }
        Ok(())
    }

    // =========================================================================
    // Cloning
    // =========================================================================

    /// Copy a committed instance under the same name and a new cluster name
    ///
    /// Sidecars are cloned along with the parent. A cloned sidecar is detached.
    pub fn clone_instance(&mut self, id: InstanceId) -> Result<InstanceId, Error> {
        let name = self.instance(id)?.name().to_string();
        self.clone_with_name(id, &name)
    }

    /// Copy a committed instance under a new name
    pub fn clone_with_name(&mut self, id: InstanceId, name: &str) -> Result<InstanceId, Error> {
        let idx = self.index(id)?;
        self.instances[idx].guard(Operation::Clone)?;
        let sidecar_ids = self.instances[idx].sidecars.clone();
        for sidecar in &sidecar_ids {
            self.instance(*sidecar)?.guard(Operation::Clone)?;
        }

        let k8s_name = self.deps.names.generate(name)?;
        let source = self.instances[idx].clone();
        let clone_id = self.push_instance(|new_id| source.duplicate(new_id, name, k8s_name))?;

        for sidecar in sidecar_ids {
            let sidecar_source = self.instance(sidecar)?.clone();
            let sidecar_k8s = self.deps.names.generate(sidecar_source.name())?;
            let sidecar_name = sidecar_source.name().to_string();
            let sidecar_clone = self.push_instance(|new_id| {
                let mut copy = sidecar_source.duplicate(new_id, sidecar_name, sidecar_k8s);
                copy.parent = Some(clone_id);
                copy
            })?;
            self.instances[clone_id.0].sidecars.push(sidecar_clone);
        }

        info!(
            instance = %self.instances[idx].name(),
            clone = %self.instances[clone_id.0].k8s_name(),
            "Cloned instance"
        );
        Ok(clone_id)
    }

    // =========================================================================
    // Cluster objects and addressing
    // =========================================================================

    /// Create a custom resource named after the instance
    pub async fn create_custom_resource(
        &self,
        id: InstanceId,
        resource_type: &CustomResourceType,
        object: &serde_json::Value,
    ) -> Result<(), Error> {
        let instance = self.instance(id)?;
        instance.guard(Operation::CreateCustomResource)?;
        let operation = Operation::CreateCustomResource.as_str();

        let exists = self
            .deps
            .cluster
            .crd_exists(resource_type)
            .await
            .map_err(|e| Error::collaborator(instance.name(), operation, e))?;
        if !exists {
            return Err(Error::validation_for(
                instance.name(),
                format!("custom resource definition {} does not exist", resource_type.crd_name()),
            ));
        }

        self.deps
            .cluster
            .create_custom_resource(instance.k8s_name(), resource_type, object)
            .await
            .map_err(|e| Error::collaborator(instance.name(), operation, e))?;
        info!(instance = %instance.name(), kind = %resource_type.kind, "Created custom resource");
        Ok(())
    }

    /// Cluster IP of the instance's Service
    ///
    /// Deploys the Service if it does not exist yet and caches the address.
    pub async fn address(&mut self, id: InstanceId) -> Result<String, Error> {
        let idx = self.index(id)?;
        let instance = &self.instances[idx];
        instance.guard(Operation::Address)?;
        if let Some(ip) = &instance.service_ip {
            return Ok(ip.clone());
        }

        let operation = Operation::Address.as_str();
        let name = instance.name().to_string();
        let k8s_name = instance.k8s_name().to_string();
        let cluster = &self.deps.cluster;

        let mut ip = cluster
            .service_cluster_ip(&k8s_name)
            .await
            .map_err(|e| Error::collaborator(&name, operation, e))?;

        if ip.is_none() {
            let pod_owner = self.pod_owner(idx)?;
            let namespace = &self.deps.settings.namespace;
            let svc = compile_service(&self.instances[idx], &pod_owner, namespace)
                .ok_or_else(|| Error::validation_for(&name, "no ports registered to expose"))?;
            cluster
                .apply(&ClusterResource::Service(svc))
                .await
                .map_err(|e| Error::collaborator(&name, operation, e))?;
            debug!(instance = %name, "Deployed service for address lookup");
            ip = cluster
                .service_cluster_ip(&k8s_name)
                .await
                .map_err(|e| Error::collaborator(&name, operation, e))?;
        }

        let ip = ip
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| {
                Error::invariant(&name, format!("service {} has no cluster IP", k8s_name))
            })?;
        self.instances[idx].service_ip = Some(ip.clone());
        Ok(ip)
    }

    /// Expose `port` through the proxy and return the external URL
    pub async fn add_host(&self, id: InstanceId, port: u16) -> Result<String, Error> {
        let instance = self.instance(id)?;
        instance.guard(Operation::AddHost)?;
        let proxy = self
            .deps
            .proxy
            .as_ref()
            .ok_or_else(|| Error::validation_for(instance.name(), "no proxy configured"))?;

        let operation = Operation::AddHost.as_str();
        let prefix = host_prefix(instance.k8s_name(), port);
        proxy
            .add_host(instance.k8s_name(), &prefix, port)
            .await
            .map_err(|e| Error::collaborator(instance.name(), operation, e))?;
        let url = proxy
            .url(&prefix)
            .await
            .map_err(|e| Error::collaborator(instance.name(), operation, e))?;
        info!(instance = %instance.name(), port, url = %url, "Registered proxy host");
        Ok(url)
    }

    // =========================================================================
    // Commands and files
    // =========================================================================

    /// Run a command in the instance
    ///
    /// While preparing it runs against the build context; once started it runs
    /// through `/bin/sh -c` in the instance's container.
    pub async fn execute_command<I, S>(&self, id: InstanceId, command: I) -> Result<String, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let idx = self.index(id)?;
        let instance = &self.instances[idx];
        instance.guard(Operation::ExecuteCommand)?;
        let command: Vec<String> = command.into_iter().map(Into::into).collect();
        let operation = Operation::ExecuteCommand.as_str();

        if instance.state == InstanceState::Preparing {
            let ctx = build_context(instance)?;
            return ctx
                .execute(&command)
                .await
                .map_err(|e| Error::collaborator(instance.name(), operation, e));
        }

        let shell = vec!["/bin/sh".to_string(), "-c".to_string(), command.join(" ")];
        self.exec_in_container(idx, &shell).await
    }

    /// Read a file from the image, or from the running container once started
    pub async fn read_file(&self, id: InstanceId, path: &str) -> Result<Vec<u8>, Error> {
        let idx = self.index(id)?;
        let instance = &self.instances[idx];
        instance.guard(Operation::ReadFile)?;

        if instance.state != InstanceState::Started {
            let ctx = build_context(instance)?;
            return ctx
                .read_file(path)
                .await
                .map_err(|e| Error::collaborator(instance.name(), Operation::ReadFile.as_str(), e));
        }

        let command = vec!["cat".to_string(), path.to_string()];
        Ok(self.exec_in_container(idx, &command).await?.into_bytes())
    }

    async fn exec_in_container(&self, idx: usize, command: &[String]) -> Result<String, Error> {
        let instance = &self.instances[idx];
        let operation = Operation::ExecuteCommand.as_str();
        let cluster = &self.deps.cluster;

        let pod = cluster
            .first_pod(&self.pod_owner(idx)?)
            .await
            .map_err(|e| Error::collaborator(instance.name(), operation, e))?;
        debug!(instance = %instance.name(), pod = %pod, command = ?command, "Executing command");
        cluster
            .exec(&pod, instance.k8s_name(), command)
            .await
            .map_err(|e| Error::collaborator(instance.name(), operation, e))
    }
}

fn build_context(instance: &Instance) -> Result<Arc<dyn crate::builder::BuildContext>, Error> {
    instance
        .build_context
        .clone()
        .ok_or_else(|| Error::invariant(instance.name(), "instance has no build context"))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::builder::{MockBuildContext, MockImageBuilder};
    use crate::test_support::{committed, Fixture};

    #[tokio::test]
    async fn set_image_opens_context_and_moves_to_preparing() {
        let mut testbed = Fixture::new().testbed();
        let id = testbed.create_instance("web").unwrap();
        assert_eq!(testbed.instance(id).unwrap().state(), InstanceState::None);

        testbed.set_image(id, "nginx:1.27").await.unwrap();
        assert_eq!(testbed.instance(id).unwrap().state(), InstanceState::Preparing);

        // a second call before start is a state violation
        let err = testbed.set_image(id, "nginx:1.28").await.unwrap_err();
        assert!(err.is_state_violation());
    }

    #[tokio::test]
    async fn unknown_instance_is_rejected() {
        let testbed = Fixture::new().testbed();
        assert!(testbed.instance(InstanceId(7)).is_err());
    }

    #[tokio::test]
    async fn clone_copies_descriptor_and_sidecars() {
        let mut testbed = Fixture::new().testbed();
        let web = committed(&mut testbed, "web", "nginx:1.27").await;
        testbed.instance_mut(web).unwrap().add_port_tcp(80).unwrap();
        let side = committed(&mut testbed, "side", "busybox").await;
        testbed.add_sidecar(web, side).unwrap();

        let copy = testbed.clone_instance(web).unwrap();
        let copied = testbed.instance(copy).unwrap();
        assert_eq!(copied.name(), "web");
        assert_ne!(copied.k8s_name(), testbed.instance(web).unwrap().k8s_name());
        assert_eq!(copied.ports_tcp(), &[80]);
        assert_eq!(copied.state(), InstanceState::Committed);

        let copied_sidecar = copied.sidecars()[0];
        assert_ne!(copied_sidecar, side);
        assert_eq!(testbed.instance(copied_sidecar).unwrap().parent(), Some(copy));
    }

    #[tokio::test]
    async fn clone_of_sidecar_is_detached() {
        let mut testbed = Fixture::new().testbed();
        let web = committed(&mut testbed, "web", "nginx").await;
        let side = committed(&mut testbed, "side", "busybox").await;
        testbed.add_sidecar(web, side).unwrap();

        let copy = testbed.clone_with_name(side, "side-2").unwrap();
        let copied = testbed.instance(copy).unwrap();
        assert_eq!(copied.name(), "side-2");
        assert!(!copied.is_sidecar());
    }

    #[tokio::test]
    async fn clone_requires_committed() {
        let mut testbed = Fixture::new().testbed();
        let id = testbed.create_instance("web").unwrap();
        assert!(testbed.clone_instance(id).unwrap_err().is_state_violation());
    }

    #[tokio::test]
    async fn address_deploys_missing_service_once_and_caches() {
        let mut fixture = Fixture::new();
        let lookups = Arc::new(AtomicUsize::new(0));
        let counter = lookups.clone();
        fixture.cluster.expect_service_cluster_ip().times(2).returning(move |_| {
            // missing on the first lookup, present after the apply
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(None),
                _ => Ok(Some("10.96.0.12".to_string())),
            }
        });
        fixture.cluster.expect_apply().times(1).returning(|resource| {
            assert!(matches!(resource, ClusterResource::Service(_)));
            Ok(())
        });

        let mut testbed = fixture.testbed();
        let web = committed(&mut testbed, "web", "nginx").await;
        testbed.instance_mut(web).unwrap().add_port_tcp(80).unwrap();

        assert_eq!(testbed.address(web).await.unwrap(), "10.96.0.12");
        // cached: no further cluster calls
        assert_eq!(testbed.address(web).await.unwrap(), "10.96.0.12");
        assert_eq!(lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn address_without_ports_fails() {
        let mut fixture = Fixture::new();
        fixture.cluster.expect_service_cluster_ip().returning(|_| Ok(None));
        let mut testbed = fixture.testbed();
        let web = committed(&mut testbed, "web", "nginx").await;
        let err = testbed.address(web).await.unwrap_err();
        assert!(err.to_string().contains("no ports"));
    }

    #[tokio::test]
    async fn custom_resource_requires_crd() {
        let mut fixture = Fixture::new();
        fixture.cluster.expect_crd_exists().times(1).returning(|_| Ok(false));
        fixture.cluster.expect_create_custom_resource().never();
        let mut testbed = fixture.testbed();
        let web = committed(&mut testbed, "web", "nginx").await;

        let chaos = CustomResourceType {
            group: "chaos-mesh.org".to_string(),
            version: "v1alpha1".to_string(),
            kind: "NetworkChaos".to_string(),
            plural: "networkchaos".to_string(),
        };
        let err = testbed
            .create_custom_resource(web, &chaos, &json!({ "spec": {} }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("networkchaos.chaos-mesh.org"));
    }

    #[tokio::test]
    async fn add_host_uses_prefix_and_returns_url() {
        let mut fixture = Fixture::new();
        let mut proxy = crate::proxy::MockProxy::new();
        proxy.expect_add_host().times(1).returning(|service, prefix, port| {
            assert_eq!(prefix, format!("{}-8080", service));
            assert_eq!(port, 8080);
            Ok(())
        });
        proxy
            .expect_url()
            .returning(|prefix| Ok(format!("https://{}.proxy.example.com", prefix)));
        fixture.proxy = Some(proxy);

        let mut testbed = fixture.testbed();
        let web = committed(&mut testbed, "web", "nginx").await;
        let url = testbed.add_host(web, 8080).await.unwrap();
        assert!(url.ends_with("-8080.proxy.example.com"));
    }

    #[tokio::test]
    async fn execute_command_while_preparing_uses_build_context() {
        let mut ctx = MockBuildContext::new();
        ctx.expect_execute().returning(|command| {
            assert_eq!(command, ["ls".to_string(), "/".to_string()]);
            Ok("bin\netc\n".to_string())
        });
        let ctx: Arc<dyn crate::builder::BuildContext> = Arc::new(ctx);

        let mut builder = MockImageBuilder::new();
        builder.expect_open().returning(move |_| Ok(ctx.clone()));
        let mut fixture = Fixture::new();
        fixture.builder = Some(builder);
        let mut testbed = fixture.testbed();
        let id = testbed.create_instance("web").unwrap();
        testbed.set_image(id, "alpine").await.unwrap();

        let out = testbed.execute_command(id, ["ls", "/"]).await.unwrap();
        assert_eq!(out, "bin\netc\n");
    }

    #[tokio::test]
    async fn execute_command_rejected_when_committed() {
        let mut testbed = Fixture::new().testbed();
        let web = committed(&mut testbed, "web", "nginx").await;
        let err = testbed.execute_command(web, ["true"]).await.unwrap_err();
        assert!(err.is_state_violation());
    }

    #[tokio::test]
    async fn execute_command_in_sidecar_uses_parent_pod() {
        let mut fixture = Fixture::new();
        fixture.expect_deploy();
        fixture.cluster.expect_first_pod().returning(|replica_set| {
            assert_eq!(replica_set, "web-00000000");
            Ok("web-00000000-abcde".to_string())
        });
        fixture.cluster.expect_exec().returning(|pod, container, command| {
            assert_eq!(pod, "web-00000000-abcde");
            assert_eq!(container, "side-00000001");
            assert_eq!(command[2], "echo hi");
            Ok("hi\n".to_string())
        });

        let mut testbed = fixture.testbed();
        let web = committed(&mut testbed, "web", "nginx").await;
        let side = committed(&mut testbed, "side", "busybox").await;
        testbed.add_sidecar(web, side).unwrap();
        testbed.start_without_wait(web).await.unwrap();

        assert_eq!(testbed.execute_command(side, ["echo", "hi"]).await.unwrap(), "hi\n");
    }
}
