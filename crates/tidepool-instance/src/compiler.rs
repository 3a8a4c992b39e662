//! InstanceCompiler: turns a parent instance and its sidecars into cluster resources
//!
//! Compilation is pure. The deployment layer decides which of the compiled
//! resources to apply: everything on the first start, only the ReplicaSet on
//! a restart from Stopped.
//!
//! ```rust,ignore
//! let compiled = InstanceCompiler::new(&parent, namespace)
//!     .with_sidecars(&sidecars)
//!     .with_init_image(&settings.init_image)
//!     .compile()?;
//! ```

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::instance::{Instance, InstanceType};
use crate::k8s::{
    Capabilities, ClusterResource, ConfigMap, Container, ContainerPort, EnvVar, LabelSelector,
    NetworkPolicy, PersistentVolumeClaim, PodMeta, PodSecurityContext, PodSpec, PodTemplateSpec,
    ReplicaSet, ReplicaSetSpec, ResourceKind, ResourceRequirements, Role, RoleBinding,
    SecurityContext, Service, ServiceAccount, ServicePort, Volume, VolumeMount,
};
use crate::names::label_value;
use tidepool_common::kube_utils::ObjectMeta;
use tidepool_common::settings::DEFAULT_INIT_IMAGE;
use tidepool_common::{Error, LABEL_APP, LABEL_NAME, LABEL_TYPE};

/// Name of the PersistentVolumeClaim backing an instance volume
pub fn volume_claim_name(k8s_name: &str) -> String {
    format!("{}-volume", k8s_name)
}

/// Name of the ConfigMap carrying an instance's files
pub fn config_map_name(k8s_name: &str) -> String {
    format!("{}-config", k8s_name)
}

/// Pod labels of the compute unit owned by `instance`
pub fn pod_labels(instance: &Instance) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_APP.to_string(), instance.k8s_name().to_string()),
        (LABEL_NAME.to_string(), label_value(instance.name())),
        (LABEL_TYPE.to_string(), instance.instance_type().as_str().to_string()),
    ])
}

/// Everything needed to run one pod
#[derive(Clone, Debug)]
pub struct CompiledPod {
    /// Volume claims, file ConfigMaps, RBAC and Services, in apply order
    pub supporting: Vec<ClusterResource>,
    /// The compute unit
    pub replica_set: ReplicaSet,
}

impl CompiledPod {
    /// Kinds and names of the supporting resources, for logging
    pub fn supporting_names(&self) -> Vec<(ResourceKind, &str)> {
        self.supporting.iter().map(|r| (r.kind(), r.name())).collect()
    }
}

/// Compiles a parent instance plus sidecars into one pod
pub struct InstanceCompiler<'a> {
    parent: &'a Instance,
    namespace: &'a str,
    sidecars: &'a [&'a Instance],
    init_image: &'a str,
}

impl<'a> InstanceCompiler<'a> {
    pub fn new(parent: &'a Instance, namespace: &'a str) -> Self {
        Self {
            parent,
            namespace,
            sidecars: &[],
            init_image: DEFAULT_INIT_IMAGE,
        }
    }

    /// Sidecars in container order
    pub fn with_sidecars(mut self, sidecars: &'a [&'a Instance]) -> Self {
        self.sidecars = sidecars;
        self
    }

    /// Image of the init container that fixes volume ownership
    pub fn with_init_image(mut self, image: &'a str) -> Self {
        self.init_image = image;
        self
    }

    fn members(&self) -> impl Iterator<Item = &'a Instance> + '_ {
        std::iter::once(self.parent).chain(self.sidecars.iter().copied())
    }

    fn service_account(&self) -> Option<String> {
        self.members()
            .any(|m| !m.policy_rules().is_empty())
            .then(|| self.parent.k8s_name().to_string())
    }

    /// Compile supporting resources and the ReplicaSet
    pub fn compile(&self) -> Result<CompiledPod, Error> {
        Ok(CompiledPod {
            supporting: self.supporting_resources(),
            replica_set: self.replica_set()?,
        })
    }

    /// Volume claims, ConfigMaps, RBAC and Services for the parent and each sidecar
    pub fn supporting_resources(&self) -> Vec<ClusterResource> {
        let mut resources = Vec::new();
        let service_account = self.service_account();

        if let Some(sa) = &service_account {
            resources.push(ClusterResource::ServiceAccount(ServiceAccount::new(
                sa.as_str(),
                self.namespace,
            )));
        }

        for member in self.members() {
            let name = member.k8s_name();

            if let Some(volume) = member.volume() {
                resources.push(ClusterResource::PersistentVolumeClaim(
                    PersistentVolumeClaim::new(
                        volume_claim_name(name),
                        self.namespace,
                        &volume.size,
                    ),
                ));
            }

            if let Some(cm) = compile_config_map(member, self.namespace) {
                resources.push(ClusterResource::ConfigMap(cm));
            }

            if let Some(sa) = &service_account {
                if !member.policy_rules().is_empty() {
                    resources.push(ClusterResource::Role(Role::new(
                        name,
                        self.namespace,
                        member.policy_rules().to_vec(),
                    )));
                    let mut binding = RoleBinding::for_service_account(name, self.namespace);
                    for subject in &mut binding.subjects {
                        subject.name = sa.clone();
                    }
                    resources.push(ClusterResource::RoleBinding(binding));
                }
            }

            if let Some(svc) = compile_service(member, self.parent.k8s_name(), self.namespace) {
                resources.push(ClusterResource::Service(svc));
            }
        }

        resources
    }

    /// The compute unit: one replica carrying the parent then each sidecar
    pub fn replica_set(&self) -> Result<ReplicaSet, Error> {
        let labels = pod_labels(self.parent);
        let mut spec = PodSpec {
            service_account_name: self.service_account(),
            ..Default::default()
        };

        for member in self.members() {
            let name = member.k8s_name();
            let mut mounts = Vec::new();

            if let Some(volume) = member.volume() {
                let volume_name = volume_claim_name(name);
                spec.volumes
                    .push(Volume::from_pvc(volume_name.as_str(), volume_name.as_str()));
                mounts.push(VolumeMount::new(volume_name.as_str(), volume.path.as_str()));

                if volume.owner != 0 {
                    spec.init_containers.push(Container {
                        name: format!("{}-init", name),
                        image: self.init_image.to_string(),
                        command: vec![
                            "sh".to_string(),
                            "-c".to_string(),
                            format!(
                                "chown -R {owner}:{owner} {path}",
                                owner = volume.owner,
                                path = volume.path
                            ),
                        ],
                        volume_mounts: vec![VolumeMount::new(
                            volume_name.as_str(),
                            volume.path.as_str(),
                        )],
                        ..Default::default()
                    });
                }
            }

            if member.files().next().is_some() {
                let cm_name = config_map_name(name);
                spec.volumes
                    .push(Volume::from_config_map(cm_name.as_str(), cm_name.as_str()));
                for (index, file) in member.files().enumerate() {
                    mounts.push(VolumeMount::file(
                        cm_name.as_str(),
                        file.dest.as_str(),
                        file_key(index),
                    ));
                }
            }

            spec.containers.push(compile_container(member, mounts)?);
        }

        // fsGroup applies pod-wide, so only the parent's file group is used
        let fs_group = self.parent.fs_group();
        if fs_group.is_some() {
            spec.security_context = Some(PodSecurityContext { fs_group });
        }

        Ok(ReplicaSet {
            api_version: ResourceKind::ReplicaSet.api_version().to_string(),
            kind: "ReplicaSet".to_string(),
            metadata: ObjectMeta::new(self.parent.k8s_name(), self.namespace).with_labels(&labels),
            spec: ReplicaSetSpec {
                replicas: 1,
                selector: LabelSelector::single(LABEL_APP, self.parent.k8s_name()),
                template: PodTemplateSpec {
                    metadata: PodMeta { labels },
                    spec,
                },
            },
        })
    }
}

fn file_key(index: usize) -> String {
    format!("file-{}", index)
}

fn compile_container(
    instance: &Instance,
    volume_mounts: Vec<VolumeMount>,
) -> Result<Container, Error> {
    let image = instance
        .image()
        .ok_or_else(|| {
            Error::invariant(instance.name(), "cannot deploy an instance without an image")
        })?;

    let ports = instance
        .ports_tcp()
        .iter()
        .map(|p| ContainerPort {
            name: String::new(),
            container_port: *p,
            protocol: "TCP".to_string(),
        })
        .chain(instance.ports_udp().iter().map(|p| ContainerPort {
            name: String::new(),
            container_port: *p,
            protocol: "UDP".to_string(),
        }))
        .collect();

    let mut resources = ResourceRequirements::default();
    if let Some(memory) = instance.memory_request() {
        resources.requests.insert("memory".to_string(), memory.to_string());
    }
    if let Some(cpu) = instance.cpu_request() {
        resources.requests.insert("cpu".to_string(), cpu.to_string());
    }
    if let Some(memory) = instance.memory_limit() {
        resources.limits.insert("memory".to_string(), memory.to_string());
    }

    let security = instance.security();
    let has_capabilities = !security.capabilities.is_empty();
    let security_context = (security.privileged || has_capabilities).then(|| SecurityContext {
        privileged: security.privileged.then_some(true),
        capabilities: has_capabilities.then(|| Capabilities {
            add: security.capabilities.clone(),
        }),
    });

    Ok(Container {
        name: instance.k8s_name().to_string(),
        image: image.to_string(),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: instance.command().to_vec(),
        args: instance.args().to_vec(),
        env: instance
            .env()
            .iter()
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: value.clone(),
            })
            .collect(),
        ports,
        resources: (!resources.is_empty()).then_some(resources),
        liveness_probe: instance.liveness_probe().cloned(),
        readiness_probe: instance.readiness_probe().cloned(),
        startup_probe: instance.startup_probe().cloned(),
        volume_mounts,
        security_context,
    })
}

/// ConfigMap with the instance's deployed files, keyed in file order
pub fn compile_config_map(instance: &Instance, namespace: &str) -> Option<ConfigMap> {
    if instance.files().next().is_none() {
        return None;
    }
    let mut cm = ConfigMap::new(config_map_name(instance.k8s_name()), namespace);
    cm.metadata = cm.metadata.with_label(LABEL_APP, instance.k8s_name());
    for (index, file) in instance.files().enumerate() {
        cm.binary_data.insert(file_key(index), BASE64.encode(&file.contents));
    }
    Some(cm)
}

/// Service exposing the instance's registered ports, `None` without ports
///
/// `selector_app` is the cluster name of the pod the instance runs in, which
/// for a sidecar is its parent's.
pub fn compile_service(
    instance: &Instance,
    selector_app: &str,
    namespace: &str,
) -> Option<Service> {
    if instance.ports_tcp().is_empty() && instance.ports_udp().is_empty() {
        return None;
    }
    let mut svc = Service::new(instance.k8s_name(), namespace);
    svc.metadata = svc.metadata.with_label(LABEL_APP, instance.k8s_name());
    svc.spec.selector = BTreeMap::from([(LABEL_APP.to_string(), selector_app.to_string())]);
    svc.spec.ports = instance
        .ports_tcp()
        .iter()
        .map(|p| ServicePort {
            name: format!("tcp-{}", p),
            port: *p,
            target_port: *p,
            protocol: "TCP".to_string(),
        })
        .chain(instance.ports_udp().iter().map(|p| ServicePort {
            name: format!("udp-{}", p),
            port: *p,
            target_port: *p,
            protocol: "UDP".to_string(),
        }))
        .collect();
    Some(svc)
}

/// Policy isolating the pod labelled `app=<pod_app>` from everything but executors
pub fn compile_isolation_policy(pod_app: &str, namespace: &str) -> NetworkPolicy {
    NetworkPolicy::isolate(
        pod_app,
        namespace,
        LabelSelector::single(LABEL_APP, pod_app),
        LabelSelector::single(LABEL_TYPE, InstanceType::Executor.as_str()),
    )
}
