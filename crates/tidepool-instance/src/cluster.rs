//! Cluster client for applying and querying instance resources
//!
//! Provides a trait-based abstraction over the Kubernetes API, allowing tests
//! to mock cluster interactions while production code uses real API calls.

use std::net::{Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ReplicaSet as K8sReplicaSet;
use k8s_openapi::api::core::v1::{Pod, Service as K8sService};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{
    Api, AttachParams, DeleteParams, DynamicObject, ListParams, Patch, PatchParams,
};
use kube::Client;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::k8s::{ClusterResource, ResourceKind};
use tidepool_common::kube_utils::build_api_resource;
use tidepool_common::{Error, FIELD_MANAGER, LABEL_APP};

/// Group, version, kind and plural of a custom resource type
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CustomResourceType {
    /// API group, e.g. `chaos-mesh.org`
    pub group: String,
    /// Served version, e.g. `v1alpha1`
    pub version: String,
    /// Kind, e.g. `NetworkChaos`
    pub kind: String,
    /// Plural resource name, e.g. `networkchaos`
    pub plural: String,
}

impl CustomResourceType {
    /// `group/version` string
    pub fn api_version(&self) -> String {
        format!("{}/{}", self.group, self.version)
    }

    /// Name of the CustomResourceDefinition declaring this type
    pub fn crd_name(&self) -> String {
        format!("{}.{}", self.plural, self.group)
    }
}

/// Trait abstracting the cluster operations instances need
///
/// All names are resource names inside the client's namespace.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create or update a resource with server-side apply
    async fn apply(&self, resource: &ClusterResource) -> Result<(), Error>;

    /// Delete a resource; a missing resource is not an error
    async fn delete(
        &self,
        kind: ResourceKind,
        name: &str,
        grace_period_secs: Option<u32>,
    ) -> Result<(), Error>;

    /// Check whether a resource exists
    async fn exists(&self, kind: ResourceKind, name: &str) -> Result<bool, Error>;

    /// Cluster IP of a Service, `None` when the Service does not exist
    async fn service_cluster_ip(&self, name: &str) -> Result<Option<String>, Error>;

    /// True when the ReplicaSet has at least one ready replica
    async fn replica_set_ready(&self, name: &str) -> Result<bool, Error>;

    /// Name of the first pod owned by a ReplicaSet
    async fn first_pod(&self, replica_set: &str) -> Result<String, Error>;

    /// Run a command in a container and return its stdout
    async fn exec(&self, pod: &str, container: &str, command: &[String])
        -> Result<String, Error>;

    /// Forward `local_port` on 127.0.0.1 to `remote_port` of a pod
    ///
    /// Returns once the tunnel is established; forwarding continues in the
    /// background for the lifetime of the client.
    async fn port_forward(&self, pod: &str, local_port: u16, remote_port: u16)
        -> Result<(), Error>;

    /// Check that a CRD serving the given version is installed
    async fn crd_exists(&self, resource_type: &CustomResourceType) -> Result<bool, Error>;

    /// Create or update a custom resource named `name`
    async fn create_custom_resource(
        &self,
        name: &str,
        resource_type: &CustomResourceType,
        object: &serde_json::Value,
    ) -> Result<(), Error>;
}

/// Real cluster client backed by kube-rs
pub struct KubeClusterClient {
    client: Client,
    namespace: String,
    tunnels: CancellationToken,
}

impl KubeClusterClient {
    /// Create a client operating in `namespace`
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            tunnels: CancellationToken::new(),
        }
    }

    /// Namespace this client operates in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn dynamic_api(&self, kind: ResourceKind) -> Api<DynamicObject> {
        let ar = build_api_resource(kind.api_version(), kind.kind());
        Api::namespaced_with(self.client.clone(), &self.namespace, &ar)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

impl Drop for KubeClusterClient {
    fn drop(&mut self) {
        self.tunnels.cancel();
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn apply(&self, resource: &ClusterResource) -> Result<(), Error> {
        let kind = resource.kind();
        let obj: DynamicObject = serde_json::from_value(resource.to_json()?)
            .map_err(|e| Error::serialization_for_kind(kind.kind(), e.to_string()))?;

        self.dynamic_api(kind)
            .patch(
                resource.name(),
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&obj),
            )
            .await?;

        debug!(
            kind = %kind,
            name = %resource.name(),
            namespace = %self.namespace,
            "Applied resource"
        );
        Ok(())
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        name: &str,
        grace_period_secs: Option<u32>,
    ) -> Result<(), Error> {
        let mut params = DeleteParams::background();
        if let Some(grace) = grace_period_secs {
            params = params.grace_period(grace);
        }

        match self.dynamic_api(kind).delete(name, &params).await.map_err(Error::from) {
            Ok(_) => {
                debug!(kind = %kind, name = %name, "Deleted resource");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(kind = %kind, name = %name, "Resource already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn exists(&self, kind: ResourceKind, name: &str) -> Result<bool, Error> {
        Ok(self.dynamic_api(kind).get_opt(name).await?.is_some())
    }

    async fn service_cluster_ip(&self, name: &str) -> Result<Option<String>, Error> {
        let api: Api<K8sService> = Api::namespaced(self.client.clone(), &self.namespace);
        let ip = api
            .get_opt(name)
            .await?
            .and_then(|svc| svc.spec)
            .and_then(|spec| spec.cluster_ip)
            .filter(|ip| !ip.is_empty() && ip != "None");
        Ok(ip)
    }

    async fn replica_set_ready(&self, name: &str) -> Result<bool, Error> {
        let api: Api<K8sReplicaSet> = Api::namespaced(self.client.clone(), &self.namespace);
        let ready = api
            .get_opt(name)
            .await?
            .and_then(|rs| rs.status)
            .and_then(|status| status.ready_replicas)
            .unwrap_or(0);
        Ok(ready >= 1)
    }

    async fn first_pod(&self, replica_set: &str) -> Result<String, Error> {
        let params = ListParams::default().labels(&format!("{}={}", LABEL_APP, replica_set));
        let pods = self.pods().list(&params).await?;

        pods.items
            .into_iter()
            .find(|pod| pod.metadata.deletion_timestamp.is_none())
            .and_then(|pod| pod.metadata.name)
            .ok_or_else(|| {
                Error::internal_with_context(
                    "first_pod",
                    format!("no pods found for replica set {}", replica_set),
                )
            })
    }

    async fn exec(
        &self,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<String, Error> {
        let params = AttachParams::default()
            .container(container)
            .stdout(true)
            .stderr(true);
        let mut process = self.pods().exec(pod, command.to_vec(), &params).await?;

        let stdout_reader = process.stdout();
        let stderr_reader = process.stderr();
        let read_stdout = async move {
            let mut buf = String::new();
            if let Some(mut out) = stdout_reader {
                out.read_to_string(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        };
        let read_stderr = async move {
            let mut buf = String::new();
            if let Some(mut err) = stderr_reader {
                if let Err(e) = err.read_to_string(&mut buf).await {
                    debug!(error = %e, "Failed to read exec stderr");
                }
            }
            buf
        };
        let (stdout, stderr) = tokio::join!(read_stdout, read_stderr);
        let stdout = stdout.map_err(|e| {
            Error::internal_with_context("exec", format!("failed to read stdout: {}", e))
        })?;

        let status = match process.take_status() {
            Some(status) => status.await,
            None => None,
        };
        if let Some(status) = status {
            if status.status.as_deref() == Some("Failure") {
                return Err(Error::internal_with_context(
                    "exec",
                    format!(
                        "command {:?} failed in {}/{}: {} {}",
                        command,
                        pod,
                        container,
                        status.message.unwrap_or_default(),
                        stderr.trim()
                    ),
                ));
            }
        }

        Ok(stdout)
    }

    async fn port_forward(
        &self,
        pod: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Result<(), Error> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, local_port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            Error::internal_with_context(
                "port_forward",
                format!("failed to bind {}: {}", addr, e),
            )
        })?;

        // Fail fast if the pod is not reachable through the API server
        let mut probe = self.pods().portforward(pod, &[remote_port]).await?;
        drop(probe.take_stream(remote_port));

        let pods = self.pods();
        let pod_name = pod.to_string();
        let cancel = self.tunnels.child_token();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((conn, peer)) => {
                        debug!(pod = %pod_name, peer = %peer, "Accepted forwarded connection");
                        let pods = pods.clone();
                        let pod_name = pod_name.clone();
                        tokio::spawn(async move {
                            if let Err(e) = bridge(pods, &pod_name, remote_port, conn).await {
                                warn!(pod = %pod_name, error = %e, "Forwarded connection failed");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(pod = %pod_name, error = %e, "Failed to accept connection");
                    }
                }
            }
            debug!(pod = %pod_name, local_port, "Port forward listener closed");
        });

        info!(pod = %pod, local_port, remote_port, "Port forward established");
        Ok(())
    }

    async fn crd_exists(&self, resource_type: &CustomResourceType) -> Result<bool, Error> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let crd = api.get_opt(&resource_type.crd_name()).await?;
        Ok(crd.is_some_and(|crd| {
            crd.spec
                .versions
                .iter()
                .any(|v| v.name == resource_type.version && v.served)
        }))
    }

    async fn create_custom_resource(
        &self,
        name: &str,
        resource_type: &CustomResourceType,
        object: &serde_json::Value,
    ) -> Result<(), Error> {
        let api_version = resource_type.api_version();
        let mut ar = build_api_resource(&api_version, &resource_type.kind);
        ar.plural = resource_type.plural.clone();

        if !object.is_object() {
            return Err(Error::validation_for(
                name,
                "custom resource must be a JSON object",
            ));
        }
        let mut value = object.clone();
        value["apiVersion"] = serde_json::Value::String(api_version);
        value["kind"] = serde_json::Value::String(resource_type.kind.clone());
        value["metadata"]["name"] = serde_json::Value::String(name.to_string());
        value["metadata"]["namespace"] = serde_json::Value::String(self.namespace.clone());

        let obj: DynamicObject = serde_json::from_value(value)
            .map_err(|e| Error::serialization_for_kind(&resource_type.kind, e.to_string()))?;

        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &self.namespace, &ar);
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&obj),
        )
        .await?;

        info!(kind = %resource_type.kind, name = %name, "Created custom resource");
        Ok(())
    }
}

/// Bridge one local connection to a fresh port-forward stream
async fn bridge(
    pods: Api<Pod>,
    pod: &str,
    remote_port: u16,
    mut conn: TcpStream,
) -> Result<(), Error> {
    let mut forwarder = pods.portforward(pod, &[remote_port]).await?;
    let mut upstream = forwarder.take_stream(remote_port).ok_or_else(|| {
        Error::internal_with_context(
            "port_forward",
            format!("no stream for port {} on {}", remote_port, pod),
        )
    })?;

    tokio::io::copy_bidirectional(&mut conn, &mut upstream)
        .await
        .map_err(|e| Error::internal_with_context("port_forward", e.to_string()))?;

    drop(upstream);
    forwarder
        .join()
        .await
        .map_err(|e| Error::internal_with_context("port_forward", e.to_string()))
}
