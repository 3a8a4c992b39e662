//! Kubernetes resource types compiled from instances
//!
//! These mirror the subset of the Kubernetes API that instances need, with
//! camelCase serde so they can be applied directly as `DynamicObject`s.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tidepool_common::kube_utils::ObjectMeta;
use tidepool_common::Error;

// =============================================================================
// Resource kinds
// =============================================================================

/// Kinds of cluster resources an instance can own
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    ConfigMap,
    PersistentVolumeClaim,
    ServiceAccount,
    Role,
    RoleBinding,
    Service,
    ReplicaSet,
    NetworkPolicy,
}

impl ResourceKind {
    /// API version for this kind
    pub fn api_version(self) -> &'static str {
        match self {
            ResourceKind::ConfigMap
            | ResourceKind::PersistentVolumeClaim
            | ResourceKind::ServiceAccount
            | ResourceKind::Service => "v1",
            ResourceKind::Role | ResourceKind::RoleBinding => "rbac.authorization.k8s.io/v1",
            ResourceKind::ReplicaSet => "apps/v1",
            ResourceKind::NetworkPolicy => "networking.k8s.io/v1",
        }
    }

    /// Kind string for this kind
    pub fn kind(self) -> &'static str {
        match self {
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ResourceKind::ServiceAccount => "ServiceAccount",
            ResourceKind::Role => "Role",
            ResourceKind::RoleBinding => "RoleBinding",
            ResourceKind::Service => "Service",
            ResourceKind::ReplicaSet => "ReplicaSet",
            ResourceKind::NetworkPolicy => "NetworkPolicy",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())
    }
}

/// A resource ready to be applied to the cluster
#[derive(Clone, Debug, PartialEq)]
pub enum ClusterResource {
    ConfigMap(ConfigMap),
    PersistentVolumeClaim(PersistentVolumeClaim),
    ServiceAccount(ServiceAccount),
    Role(Role),
    RoleBinding(RoleBinding),
    Service(Service),
    ReplicaSet(ReplicaSet),
    NetworkPolicy(NetworkPolicy),
}

impl ClusterResource {
    /// Kind of the wrapped resource
    pub fn kind(&self) -> ResourceKind {
        match self {
            ClusterResource::ConfigMap(_) => ResourceKind::ConfigMap,
            ClusterResource::PersistentVolumeClaim(_) => ResourceKind::PersistentVolumeClaim,
            ClusterResource::ServiceAccount(_) => ResourceKind::ServiceAccount,
            ClusterResource::Role(_) => ResourceKind::Role,
            ClusterResource::RoleBinding(_) => ResourceKind::RoleBinding,
            ClusterResource::Service(_) => ResourceKind::Service,
            ClusterResource::ReplicaSet(_) => ResourceKind::ReplicaSet,
            ClusterResource::NetworkPolicy(_) => ResourceKind::NetworkPolicy,
        }
    }

    /// Metadata of the wrapped resource
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            ClusterResource::ConfigMap(r) => &r.metadata,
            ClusterResource::PersistentVolumeClaim(r) => &r.metadata,
            ClusterResource::ServiceAccount(r) => &r.metadata,
            ClusterResource::Role(r) => &r.metadata,
            ClusterResource::RoleBinding(r) => &r.metadata,
            ClusterResource::Service(r) => &r.metadata,
            ClusterResource::ReplicaSet(r) => &r.metadata,
            ClusterResource::NetworkPolicy(r) => &r.metadata,
        }
    }

    /// Name of the wrapped resource
    pub fn name(&self) -> &str {
        &self.metadata().name
    }

    /// Serialize to a JSON value suitable for server-side apply
    pub fn to_json(&self) -> Result<serde_json::Value, Error> {
        let value = match self {
            ClusterResource::ConfigMap(r) => serde_json::to_value(r),
            ClusterResource::PersistentVolumeClaim(r) => serde_json::to_value(r),
            ClusterResource::ServiceAccount(r) => serde_json::to_value(r),
            ClusterResource::Role(r) => serde_json::to_value(r),
            ClusterResource::RoleBinding(r) => serde_json::to_value(r),
            ClusterResource::Service(r) => serde_json::to_value(r),
            ClusterResource::ReplicaSet(r) => serde_json::to_value(r),
            ClusterResource::NetworkPolicy(r) => serde_json::to_value(r),
        };
        value.map_err(|e| Error::serialization_for_kind(self.kind().kind(), e.to_string()))
    }
}

// =============================================================================
// ConfigMap
// =============================================================================

/// Kubernetes ConfigMap holding files mounted into a container
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMap {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    /// UTF-8 file contents
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,
    /// Base64-encoded binary file contents
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub binary_data: BTreeMap<String, String>,
}

impl ConfigMap {
    /// Create a new ConfigMap
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            metadata: ObjectMeta::new(name, namespace),
            data: BTreeMap::new(),
            binary_data: BTreeMap::new(),
        }
    }
}

// =============================================================================
// PersistentVolumeClaim
// =============================================================================

/// Kubernetes PersistentVolumeClaim backing an instance volume
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaim {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: PvcSpec,
}

/// PVC spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PvcSpec {
    pub access_modes: Vec<String>,
    pub resources: PvcResources,
}

/// PVC storage request
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PvcResources {
    pub requests: BTreeMap<String, String>,
}

impl PersistentVolumeClaim {
    /// Create a ReadWriteOnce claim of the given size
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, size: &str) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "PersistentVolumeClaim".to_string(),
            metadata: ObjectMeta::new(name, namespace),
            spec: PvcSpec {
                access_modes: vec!["ReadWriteOnce".to_string()],
                resources: PvcResources {
                    requests: BTreeMap::from([("storage".to_string(), size.to_string())]),
                },
            },
        }
    }
}

// =============================================================================
// RBAC
// =============================================================================

/// Kubernetes ServiceAccount
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccount {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
}

impl ServiceAccount {
    /// Create a new ServiceAccount
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "ServiceAccount".to_string(),
            metadata: ObjectMeta::new(name, namespace),
        }
    }
}

/// A single RBAC rule granted to an instance's service account
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    /// API groups ("" for core)
    #[serde(default)]
    pub api_groups: Vec<String>,
    /// Resource plurals
    #[serde(default)]
    pub resources: Vec<String>,
    /// Verbs (get, list, watch, ...)
    pub verbs: Vec<String>,
    /// Restrict to named objects
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_names: Vec<String>,
}

/// Kubernetes Role
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub rules: Vec<PolicyRule>,
}

impl Role {
    /// Create a Role with the given rules
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        rules: Vec<PolicyRule>,
    ) -> Self {
        Self {
            api_version: ResourceKind::Role.api_version().to_string(),
            kind: "Role".to_string(),
            metadata: ObjectMeta::new(name, namespace),
            rules,
        }
    }
}

/// Kubernetes RoleBinding
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoleBinding {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub role_ref: RoleRef,
    pub subjects: Vec<Subject>,
}

/// Reference to the bound Role
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoleRef {
    pub api_group: String,
    pub kind: String,
    pub name: String,
}

/// Subject receiving the Role
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl RoleBinding {
    /// Bind the same-named Role to the same-named ServiceAccount
    pub fn for_service_account(name: &str, namespace: &str) -> Self {
        Self {
            api_version: ResourceKind::RoleBinding.api_version().to_string(),
            kind: "RoleBinding".to_string(),
            metadata: ObjectMeta::new(name, namespace),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "Role".to_string(),
                name: name.to_string(),
            },
            subjects: vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: name.to_string(),
                namespace: namespace.to_string(),
            }],
        }
    }
}

// =============================================================================
// Service
// =============================================================================

/// Kubernetes Service
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: ServiceSpec,
}

/// Service spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    pub selector: BTreeMap<String, String>,
    pub ports: Vec<ServicePort>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
}

/// Service port
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    pub name: String,
    pub port: u16,
    pub target_port: u16,
    pub protocol: String,
}

impl Service {
    /// Create a ClusterIP Service
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "Service".to_string(),
            metadata: ObjectMeta::new(name, namespace),
            spec: ServiceSpec {
                selector: BTreeMap::new(),
                ports: Vec::new(),
                type_: Some("ClusterIP".to_string()),
            },
        }
    }
}

// =============================================================================
// ReplicaSet and pod template
// =============================================================================

/// Kubernetes ReplicaSet, the compute unit of an instance
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSet {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: ReplicaSetSpec,
}

/// ReplicaSet spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSetSpec {
    pub replicas: u32,
    pub selector: LabelSelector,
    pub template: PodTemplateSpec,
}

/// Label selector
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    /// Select on a single label
    pub fn single(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            match_labels: BTreeMap::from([(key.into(), value.into())]),
        }
    }
}

/// Pod template spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplateSpec {
    pub metadata: PodMeta,
    pub spec: PodSpec,
}

/// Pod metadata
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodMeta {
    pub labels: BTreeMap<String, String>,
}

/// Pod spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    /// Service account (set when the instance has policy rules)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    pub containers: Vec<Container>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<Container>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<PodSecurityContext>,
}

/// Pod-level security context
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodSecurityContext {
    /// GID applied to mounted volumes so files are group-readable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_group: Option<i64>,
}

// =============================================================================
// Container
// =============================================================================

/// Container spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ContainerPort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<ProbeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<ProbeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_probe: Option<ProbeSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SecurityContext>,
}

/// Environment variable with a literal value
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// Container port
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPort {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub container_port: u16,
    pub protocol: String,
}

/// Resource requirements
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

impl ResourceRequirements {
    /// True when neither requests nor limits are set
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.limits.is_empty()
    }
}

/// Container security context
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privileged: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
}

/// Linux capabilities to add
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Capabilities {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add: Vec<String>,
}

// =============================================================================
// Probes
// =============================================================================

/// Probe definition, mapped 1:1 onto the container probe
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_get: Option<HttpGetAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_socket: Option<TcpSocketAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay_seconds: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_seconds: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<i32>,
}

impl ProbeSpec {
    /// HTTP GET probe against a path and port
    pub fn http_get(path: impl Into<String>, port: u16) -> Self {
        Self {
            http_get: Some(HttpGetAction {
                path: path.into(),
                port,
            }),
            ..Default::default()
        }
    }

    /// TCP connect probe against a port
    pub fn tcp_socket(port: u16) -> Self {
        Self {
            tcp_socket: Some(TcpSocketAction { port }),
            ..Default::default()
        }
    }

    /// Command probe
    pub fn exec(command: Vec<String>) -> Self {
        Self {
            exec: Some(ExecAction { command }),
            ..Default::default()
        }
    }
}

/// HTTP GET action for probe
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HttpGetAction {
    pub path: String,
    pub port: u16,
}

/// TCP socket action for probe
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TcpSocketAction {
    pub port: u16,
}

/// Exec action for probe
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExecAction {
    pub command: Vec<String>,
}

// =============================================================================
// Volumes
// =============================================================================

/// Pod volume
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ConfigMapVolumeSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<PvcVolumeSource>,
}

impl Volume {
    /// Create a Volume backed by a ConfigMap
    pub fn from_config_map(name: impl Into<String>, cm_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config_map: Some(ConfigMapVolumeSource {
                name: cm_name.into(),
                default_mode: None,
            }),
            persistent_volume_claim: None,
        }
    }

    /// Create a Volume backed by a PVC
    pub fn from_pvc(name: impl Into<String>, claim_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config_map: None,
            persistent_volume_claim: Some(PvcVolumeSource {
                claim_name: claim_name.into(),
            }),
        }
    }
}

/// ConfigMap volume source
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapVolumeSource {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_mode: Option<i32>,
}

/// PVC volume source
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PvcVolumeSource {
    pub claim_name: String,
}

/// Volume mount
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
}

impl VolumeMount {
    /// Mount a whole volume at a path
    pub fn new(name: impl Into<String>, mount_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mount_path: mount_path.into(),
            sub_path: None,
        }
    }

    /// Mount a single key of a volume at a file path
    pub fn file(
        name: impl Into<String>,
        mount_path: impl Into<String>,
        sub_path: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            mount_path: mount_path.into(),
            sub_path: Some(sub_path.into()),
        }
    }
}

// =============================================================================
// NetworkPolicy
// =============================================================================

/// Kubernetes NetworkPolicy isolating an instance
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicy {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: NetworkPolicySpec,
}

/// NetworkPolicy spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicySpec {
    pub pod_selector: LabelSelector,
    pub policy_types: Vec<String>,
    #[serde(default)]
    pub ingress: Vec<NetworkPolicyIngressRule>,
    #[serde(default)]
    pub egress: Vec<NetworkPolicyEgressRule>,
}

/// Ingress rule
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NetworkPolicyIngressRule {
    pub from: Vec<NetworkPolicyPeer>,
}

/// Egress rule
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NetworkPolicyEgressRule {
    pub to: Vec<NetworkPolicyPeer>,
}

/// Peer selected by pod labels
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicyPeer {
    pub pod_selector: LabelSelector,
}

impl NetworkPolicy {
    /// Deny all traffic to and from `selected` except with pods matching `allowed`
    pub fn isolate(
        name: impl Into<String>,
        namespace: impl Into<String>,
        selected: LabelSelector,
        allowed: LabelSelector,
    ) -> Self {
        Self {
            api_version: ResourceKind::NetworkPolicy.api_version().to_string(),
            kind: "NetworkPolicy".to_string(),
            metadata: ObjectMeta::new(name, namespace),
            spec: NetworkPolicySpec {
                pod_selector: selected,
                policy_types: vec!["Ingress".to_string(), "Egress".to_string()],
                ingress: vec![NetworkPolicyIngressRule {
                    from: vec![NetworkPolicyPeer {
                        pod_selector: allowed.clone(),
                    }],
                }],
                egress: vec![NetworkPolicyEgressRule {
                    to: vec![NetworkPolicyPeer {
                        pod_selector: allowed,
                    }],
                }],
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_resource_serializes_with_type_meta() {
        let svc = Service::new("web-1a2b", "tidepool");
        let json = ClusterResource::Service(svc).to_json().unwrap();
        assert_eq!(json["apiVersion"], "v1");
        assert_eq!(json["kind"], "Service");
        assert_eq!(json["spec"]["type"], "ClusterIP");
        assert_eq!(json["metadata"]["name"], "web-1a2b");
    }

    #[test]
    fn test_network_policy_allows_only_selected_peers() {
        let policy = NetworkPolicy::isolate(
            "web-1a2b",
            "tidepool",
            LabelSelector::single("app", "web-1a2b"),
            LabelSelector::single("tidepool.dev/type", "executor"),
        );
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["apiVersion"], "networking.k8s.io/v1");
        assert_eq!(json["spec"]["policyTypes"][1], "Egress");
        assert_eq!(
            json["spec"]["ingress"][0]["from"][0]["podSelector"]["matchLabels"]
                ["tidepool.dev/type"],
            "executor"
        );
    }

    #[test]
    fn test_resource_kind_api_versions() {
        assert_eq!(ResourceKind::ReplicaSet.api_version(), "apps/v1");
        assert_eq!(
            ResourceKind::RoleBinding.api_version(),
            "rbac.authorization.k8s.io/v1"
        );
        assert_eq!(ResourceKind::PersistentVolumeClaim.kind(), "PersistentVolumeClaim");
    }

    #[test]
    fn test_pvc_requests_storage() {
        let pvc = PersistentVolumeClaim::new("web-1a2b", "tidepool", "1Gi");
        let json = serde_json::to_value(&pvc).unwrap();
        assert_eq!(json["spec"]["resources"]["requests"]["storage"], "1Gi");
        assert_eq!(json["spec"]["accessModes"][0], "ReadWriteOnce");
    }
}
