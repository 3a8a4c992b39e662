//! The instance descriptor
//!
//! An [`Instance`] is the mutable record of a workload before and while it is
//! deployed. Descriptor mutators are synchronous and guarded by the lifecycle
//! table in [`crate::state`]; a rejected call leaves the descriptor unchanged.
//! Operations that need collaborators (commit, start, faults) live on
//! [`crate::Testbed`], which owns every instance.

mod files;
mod observability;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

pub use files::InstanceFile;
pub use observability::{
    JaegerEndpoint, ObservabilityConfig, OtlpExporter, PrometheusEndpoint,
    DEFAULT_OTEL_COLLECTOR_VERSION, OTEL_CONFIG_PATH,
};

use crate::builder::BuildContext;
use crate::fault::ShapingKind;
use crate::k8s::{PolicyRule, ProbeSpec};
use crate::state::{ensure_allowed, InstanceState, Operation};
use tidepool_common::Error;

/// Handle to an instance inside a [`crate::Testbed`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub(crate) usize);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Role of an instance, used to scope network policies
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum InstanceType {
    /// Regular workload
    #[default]
    Basic,
    /// Test driver that stays reachable from isolated instances
    Executor,
}

impl InstanceType {
    /// Label value for this type
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceType::Basic => "basic",
            InstanceType::Executor => "executor",
        }
    }
}

/// Persistent volume mounted into the instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeSpec {
    /// Mount path inside the container
    pub path: String,
    /// Requested size, e.g. `1Gi`
    pub size: String,
    /// UID:GID owner applied before the container starts (0 leaves root)
    pub owner: i64,
}

/// Container security settings
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecuritySettings {
    /// Run privileged
    pub privileged: bool,
    /// Linux capabilities to add
    pub capabilities: Vec<String>,
}

/// Default port of the fault-injection sidecar API
pub const DEFAULT_FAULT_INJECTION_PORT: u16 = 9007;

/// Default interface traffic shaping applies to
pub const DEFAULT_FAULT_INTERFACE: &str = "eth0";

/// Fault-injection sidecar configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FaultInjectionConfig {
    /// Inject the sidecar at start
    pub enabled: bool,
    /// Interface to shape
    pub interface: String,
    /// Sidecar API port
    pub port: u16,
    /// Shaping mode currently applied
    pub active_mode: Option<ShapingKind>,
    /// Cluster name of the injected sidecar, set at first start
    pub sidecar: Option<String>,
}

impl Default for FaultInjectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interface: DEFAULT_FAULT_INTERFACE.to_string(),
            port: DEFAULT_FAULT_INJECTION_PORT,
            active_mode: None,
            sidecar: None,
        }
    }
}

/// Workload descriptor and lifecycle state of one instance
#[derive(Clone)]
pub struct Instance {
    id: InstanceId,
    name: String,
    k8s_name: String,
    pub(crate) state: InstanceState,
    instance_type: InstanceType,
    pub(crate) image: Option<String>,
    pub(crate) build_context: Option<Arc<dyn BuildContext>>,
    ports_tcp: Vec<u16>,
    ports_udp: Vec<u16>,
    command: Vec<String>,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    volume: Option<VolumeSpec>,
    files: Vec<InstanceFile>,
    fs_group: Option<i64>,
    memory_request: Option<String>,
    memory_limit: Option<String>,
    cpu_request: Option<String>,
    liveness_probe: Option<ProbeSpec>,
    readiness_probe: Option<ProbeSpec>,
    startup_probe: Option<ProbeSpec>,
    policy_rules: Vec<PolicyRule>,
    security: SecuritySettings,
    observability: ObservabilityConfig,
    pub(crate) fault: FaultInjectionConfig,
    pub(crate) parent: Option<InstanceId>,
    pub(crate) sidecars: Vec<InstanceId>,
    /// Collector sidecar injected at first start
    pub(crate) collector: Option<InstanceId>,
    pub(crate) service_ip: Option<String>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("k8s_name", &self.k8s_name)
            .field("state", &self.state)
            .field("image", &self.image)
            .field("parent", &self.parent)
            .field("sidecars", &self.sidecars)
            .finish_non_exhaustive()
    }
}

impl Instance {
    pub(crate) fn new(
        id: InstanceId,
        name: impl Into<String>,
        k8s_name: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            k8s_name: k8s_name.into(),
            state: InstanceState::None,
            instance_type: InstanceType::Basic,
            image: None,
            build_context: None,
            ports_tcp: Vec::new(),
            ports_udp: Vec::new(),
            command: Vec::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            volume: None,
            files: Vec::new(),
            fs_group: None,
            memory_request: None,
            memory_limit: None,
            cpu_request: None,
            liveness_probe: None,
            readiness_probe: None,
            startup_probe: None,
            policy_rules: Vec::new(),
            security: SecuritySettings::default(),
            observability: ObservabilityConfig::default(),
            fault: FaultInjectionConfig::default(),
            parent: None,
            sidecars: Vec::new(),
            collector: None,
            service_ip: None,
        }
    }

    /// Copy of this descriptor under a new identity
    ///
    /// The copy is detached: no parent, no sidecars, no cached service.
    pub(crate) fn duplicate(
        &self,
        id: InstanceId,
        name: impl Into<String>,
        k8s_name: impl Into<String>,
    ) -> Self {
        let mut copy = self.clone();
        copy.id = id;
        copy.name = name.into();
        copy.k8s_name = k8s_name.into();
        copy.parent = None;
        copy.sidecars = Vec::new();
        copy.collector = None;
        copy.service_ip = None;
        copy.fault.active_mode = None;
        copy.fault.sidecar = None;
        copy
    }

    pub(crate) fn guard(&self, operation: Operation) -> Result<(), Error> {
        ensure_allowed(&self.name, operation, self.state)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Registry handle
    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Human-readable name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Generated cluster-safe name used for every resource of this instance
    pub fn k8s_name(&self) -> &str {
        &self.k8s_name
    }

    /// Current lifecycle state
    pub fn state(&self) -> InstanceState {
        self.state
    }

    /// Role of the instance
    pub fn instance_type(&self) -> InstanceType {
        self.instance_type
    }

    /// Image reference, set at commit
    pub fn image(&self) -> Option<&str> {
        self.image.as_deref()
    }

    pub fn ports_tcp(&self) -> &[u16] {
        &self.ports_tcp
    }

    pub fn ports_udp(&self) -> &[u16] {
        &self.ports_udp
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn volume(&self) -> Option<&VolumeSpec> {
        self.volume.as_ref()
    }

    /// Files deployed through a ConfigMap (baked files excluded)
    pub fn files(&self) -> impl Iterator<Item = &InstanceFile> {
        self.files.iter().filter(|f| !f.baked)
    }

    /// Group shared by every deployed file
    pub fn fs_group(&self) -> Option<i64> {
        self.fs_group
    }

    pub fn memory_request(&self) -> Option<&str> {
        self.memory_request.as_deref()
    }

    pub fn memory_limit(&self) -> Option<&str> {
        self.memory_limit.as_deref()
    }

    pub fn cpu_request(&self) -> Option<&str> {
        self.cpu_request.as_deref()
    }

    pub fn liveness_probe(&self) -> Option<&ProbeSpec> {
        self.liveness_probe.as_ref()
    }

    pub fn readiness_probe(&self) -> Option<&ProbeSpec> {
        self.readiness_probe.as_ref()
    }

    pub fn startup_probe(&self) -> Option<&ProbeSpec> {
        self.startup_probe.as_ref()
    }

    pub fn policy_rules(&self) -> &[PolicyRule] {
        &self.policy_rules
    }

    pub fn security(&self) -> &SecuritySettings {
        &self.security
    }

    pub fn observability(&self) -> &ObservabilityConfig {
        &self.observability
    }

    pub fn fault_injection(&self) -> &FaultInjectionConfig {
        &self.fault
    }

    /// True if this instance is attached to a parent
    pub fn is_sidecar(&self) -> bool {
        self.parent.is_some()
    }

    /// Parent this sidecar is attached to
    pub fn parent(&self) -> Option<InstanceId> {
        self.parent
    }

    /// Attached sidecars in container order
    pub fn sidecars(&self) -> &[InstanceId] {
        &self.sidecars
    }

    // =========================================================================
    // Descriptor mutators
    // =========================================================================

    /// Mark the instance as a basic workload or an executor
    pub fn set_instance_type(&mut self, instance_type: InstanceType) -> Result<(), Error> {
        self.guard(Operation::SetInstanceType)?;
        self.instance_type = instance_type;
        debug!(instance = %self.name, instance_type = instance_type.as_str(), "Set instance type");
        Ok(())
    }

    /// Expose a TCP port
    pub fn add_port_tcp(&mut self, port: u16) -> Result<(), Error> {
        self.guard(Operation::AddTcpPort)?;
        validate_port(&self.name, port)?;
        if self.ports_tcp.contains(&port) {
            return Err(Error::validation_for(
                &self.name,
                format!("TCP port {} is already registered", port),
            ));
        }
        self.ports_tcp.push(port);
        debug!(instance = %self.name, port, "Added TCP port");
        Ok(())
    }

    /// Expose a UDP port
    pub fn add_port_udp(&mut self, port: u16) -> Result<(), Error> {
        self.guard(Operation::AddUdpPort)?;
        validate_port(&self.name, port)?;
        if self.ports_udp.contains(&port) {
            return Err(Error::validation_for(
                &self.name,
                format!("UDP port {} is already registered", port),
            ));
        }
        self.ports_udp.push(port);
        debug!(instance = %self.name, port, "Added UDP port");
        Ok(())
    }

    /// Override the image entrypoint
    pub fn set_command<I, S>(&mut self, command: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.guard(Operation::SetCommand)?;
        self.command = command.into_iter().map(Into::into).collect();
        debug!(instance = %self.name, command = ?self.command, "Set command");
        Ok(())
    }

    /// Override the image arguments
    pub fn set_args<I, S>(&mut self, args: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.guard(Operation::SetArgs)?;
        self.args = args.into_iter().map(Into::into).collect();
        debug!(instance = %self.name, args = ?self.args, "Set args");
        Ok(())
    }

    /// Set an environment variable, replacing any previous value for the key
    pub fn set_env(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), Error> {
        self.guard(Operation::SetEnv)?;
        let key = key.into();
        if key.is_empty() || key.contains('=') {
            return Err(Error::validation_for(
                &self.name,
                format!("invalid environment variable name {:?}", key),
            ));
        }
        debug!(instance = %self.name, key = %key, "Set environment variable");
        self.env.insert(key, value.into());
        Ok(())
    }

    /// Mount a persistent volume owned by root
    pub fn add_volume(
        &mut self,
        path: impl Into<String>,
        size: impl Into<String>,
    ) -> Result<(), Error> {
        self.add_volume_with_owner(path, size, 0)
    }

    /// Mount a persistent volume whose contents are chowned to `owner`
    ///
    /// Only one volume per instance is supported.
    pub fn add_volume_with_owner(
        &mut self,
        path: impl Into<String>,
        size: impl Into<String>,
        owner: i64,
    ) -> Result<(), Error> {
        self.guard(Operation::AddVolume)?;
        if self.volume.is_some() {
            return Err(Error::validation_for(
                &self.name,
                "only one volume per instance is supported",
            ));
        }
        let path = path.into();
        if !path.starts_with('/') {
            return Err(Error::validation_for(
                &self.name,
                format!("volume path {} must be absolute", path),
            ));
        }
        let volume = VolumeSpec {
            path,
            size: size.into(),
            owner,
        };
        debug!(
            instance = %self.name,
            path = %volume.path,
            size = %volume.size,
            owner = volume.owner,
            "Added volume"
        );
        self.volume = Some(volume);
        Ok(())
    }

    /// Set the memory request and limit, e.g. `("256Mi", "1Gi")`
    pub fn set_memory(
        &mut self,
        request: impl Into<String>,
        limit: impl Into<String>,
    ) -> Result<(), Error> {
        self.guard(Operation::SetMemory)?;
        self.memory_request = Some(request.into());
        self.memory_limit = Some(limit.into());
        debug!(
            instance = %self.name,
            request = ?self.memory_request,
            limit = ?self.memory_limit,
            "Set memory"
        );
        Ok(())
    }

    /// Set the CPU request, e.g. `"500m"`
    pub fn set_cpu(&mut self, request: impl Into<String>) -> Result<(), Error> {
        self.guard(Operation::SetCpu)?;
        self.cpu_request = Some(request.into());
        debug!(instance = %self.name, request = ?self.cpu_request, "Set CPU");
        Ok(())
    }

    pub fn set_liveness_probe(&mut self, probe: ProbeSpec) -> Result<(), Error> {
        self.guard(Operation::SetProbe)?;
        self.liveness_probe = Some(probe);
        debug!(instance = %self.name, "Set liveness probe");
        Ok(())
    }

    pub fn set_readiness_probe(&mut self, probe: ProbeSpec) -> Result<(), Error> {
        self.guard(Operation::SetProbe)?;
        self.readiness_probe = Some(probe);
        debug!(instance = %self.name, "Set readiness probe");
        Ok(())
    }

    pub fn set_startup_probe(&mut self, probe: ProbeSpec) -> Result<(), Error> {
        self.guard(Operation::SetProbe)?;
        self.startup_probe = Some(probe);
        debug!(instance = %self.name, "Set startup probe");
        Ok(())
    }

    /// Grant an RBAC rule to the instance's service account
    pub fn add_policy_rule(&mut self, rule: PolicyRule) -> Result<(), Error> {
        self.guard(Operation::AddPolicyRule)?;
        if rule.verbs.is_empty() {
            return Err(Error::validation_for(&self.name, "policy rule needs at least one verb"));
        }
        self.policy_rules.push(rule);
        debug!(instance = %self.name, rules = self.policy_rules.len(), "Added policy rule");
        Ok(())
    }

    pub fn set_privileged(&mut self, privileged: bool) -> Result<(), Error> {
        self.guard(Operation::SetPrivileged)?;
        self.security.privileged = privileged;
        debug!(instance = %self.name, privileged, "Set privileged");
        Ok(())
    }

    /// Add a Linux capability such as `NET_ADMIN`
    pub fn add_capability(&mut self, capability: impl Into<String>) -> Result<(), Error> {
        self.guard(Operation::AddCapability)?;
        let capability = capability.into();
        debug!(instance = %self.name, capability = %capability, "Added capability");
        if !self.security.capabilities.contains(&capability) {
            self.security.capabilities.push(capability);
        }
        Ok(())
    }

    pub fn add_capabilities<I, S>(&mut self, capabilities: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.guard(Operation::AddCapability)?;
        for capability in capabilities {
            self.add_capability(capability)?;
        }
        Ok(())
    }

    /// Inject the fault-injection sidecar when the instance starts
    pub fn enable_fault_injection(&mut self) -> Result<(), Error> {
        self.guard(Operation::SetFaultInjection)?;
        self.fault.enabled = true;
        debug!(instance = %self.name, "Enabled fault injection");
        Ok(())
    }

    pub fn disable_fault_injection(&mut self) -> Result<(), Error> {
        self.guard(Operation::SetFaultInjection)?;
        self.fault.enabled = false;
        debug!(instance = %self.name, "Disabled fault injection");
        Ok(())
    }

    /// Interface traffic shaping applies to (default `eth0`)
    pub fn set_fault_interface(&mut self, interface: impl Into<String>) -> Result<(), Error> {
        self.guard(Operation::SetFaultInjection)?;
        self.fault.interface = interface.into();
        Ok(())
    }

    /// Port of the fault-injection sidecar API
    pub fn set_fault_port(&mut self, port: u16) -> Result<(), Error> {
        self.guard(Operation::SetFaultInjection)?;
        validate_port(&self.name, port)?;
        self.fault.port = port;
        Ok(())
    }
}

fn validate_port(instance: &str, port: u16) -> Result<(), Error> {
    if port == 0 {
        return Err(Error::validation_for(instance, "port must be between 1 and 65535"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn committed(name: &str) -> Instance {
        let mut instance = Instance::new(InstanceId(0), name, format!("{}-00000000", name));
        instance.state = InstanceState::Committed;
        instance
    }

    #[test]
    fn duplicate_tcp_port_is_rejected_and_set_unchanged() {
        let mut instance = committed("web");
        instance.add_port_tcp(80).unwrap();

        let err = instance.add_port_tcp(80).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(instance.ports_tcp(), &[80]);

        // the same number is independent across protocols
        instance.add_port_udp(80).unwrap();
        assert_eq!(instance.ports_udp(), &[80]);
    }

    #[test]
    fn port_zero_is_rejected() {
        let mut instance = committed("web");
        assert!(instance.add_port_tcp(0).is_err());
        assert!(instance.ports_tcp().is_empty());
    }

    #[test]
    fn mutators_rejected_after_start_leave_descriptor_unchanged() {
        let mut instance = committed("web");
        instance.add_port_tcp(80).unwrap();
        instance.set_env("MODE", "test").unwrap();
        instance.state = InstanceState::Started;

        assert!(instance.add_port_tcp(8080).unwrap_err().is_state_violation());
        assert!(instance.set_env("MODE", "prod").unwrap_err().is_state_violation());
        assert!(instance.set_command(["sleep", "10"]).unwrap_err().is_state_violation());
        assert!(instance.add_volume("/data", "1Gi").unwrap_err().is_state_violation());

        assert_eq!(instance.ports_tcp(), &[80]);
        assert_eq!(instance.env().get("MODE").map(String::as_str), Some("test"));
        assert!(instance.command().is_empty());
        assert!(instance.volume().is_none());
    }

    #[test]
    fn mutators_rejected_before_image() {
        let mut instance = Instance::new(InstanceId(0), "web", "web-00000000");
        let err = instance.add_port_tcp(80).unwrap_err();
        assert!(err.to_string().contains("None"));
    }

    #[test]
    fn only_one_volume() {
        let mut instance = committed("db");
        instance.add_volume_with_owner("/var/lib/db", "1Gi", 10001).unwrap();
        assert!(instance.add_volume("/other", "1Gi").is_err());
        assert_eq!(instance.volume().map(|v| v.owner), Some(10001));
    }

    #[test]
    fn volume_path_must_be_absolute() {
        let mut instance = committed("db");
        assert!(instance.add_volume("data", "1Gi").is_err());
    }

    #[test]
    fn env_keys_are_unique() {
        let mut instance = committed("web");
        instance.set_env("A", "1").unwrap();
        instance.set_env("A", "2").unwrap();
        assert_eq!(instance.env().len(), 1);
        assert_eq!(instance.env()["A"], "2");
        assert!(instance.set_env("", "x").is_err());
    }

    #[test]
    fn capabilities_are_deduplicated() {
        let mut instance = committed("web");
        instance.add_capabilities(["NET_ADMIN", "SYS_TIME"]).unwrap();
        instance.add_capability("NET_ADMIN").unwrap();
        assert_eq!(instance.security().capabilities, vec!["NET_ADMIN", "SYS_TIME"]);
    }

    #[test]
    fn duplicate_is_detached() {
        let mut parent = committed("web");
        parent.sidecars.push(InstanceId(1));
        parent.service_ip = Some("10.0.0.1".to_string());
        parent.add_port_tcp(80).unwrap();

        let copy = parent.duplicate(InstanceId(2), "web-copy", "web-copy-11111111");
        assert_eq!(copy.id(), InstanceId(2));
        assert_eq!(copy.name(), "web-copy");
        assert!(copy.sidecars().is_empty());
        assert!(copy.service_ip.is_none());
        assert_eq!(copy.ports_tcp(), &[80]);
        assert_eq!(copy.state(), InstanceState::Committed);
    }
}
