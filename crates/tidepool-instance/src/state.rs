//! Instance lifecycle states and the operation guard table
//!
//! Every public operation on an instance names itself as an [`Operation`] and
//! consults [`ensure_allowed`] before touching anything. The table in
//! [`Operation::allowed_states`] is the single place where legality is decided.
//!
//! ```text
//! None --SetImage/SetGitRepo--> Preparing --Commit--> Committed
//!                                                        |
//!                                              Start/StartWithoutWait
//!                                                        v
//!                                Stopped <----Stop---- Started
//!                                   |                    ^
//!                                   +-------Start--------+
//! ```

use std::fmt;

use tidepool_common::Error;

/// Lifecycle state of an instance
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum InstanceState {
    /// Created, no image chosen yet
    #[default]
    None,
    /// Image chosen; descriptor and build context are mutable
    Preparing,
    /// Image frozen; descriptor still mutable, nothing deployed
    Committed,
    /// Compute unit deployed
    Started,
    /// Compute unit removed; supporting resources kept
    Stopped,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::None => "None",
            InstanceState::Preparing => "Preparing",
            InstanceState::Committed => "Committed",
            InstanceState::Started => "Started",
            InstanceState::Stopped => "Stopped",
        };
        f.write_str(s)
    }
}

/// Every guarded operation on an instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    SetImage,
    SetImageInstant,
    SetGitRepo,
    Commit,
    AddTcpPort,
    AddUdpPort,
    SetCommand,
    SetArgs,
    SetEnv,
    AddVolume,
    AddFile,
    AddFolder,
    SetUser,
    SetMemory,
    SetCpu,
    SetProbe,
    AddPolicyRule,
    SetPrivileged,
    AddCapability,
    SetObservability,
    SetFaultInjection,
    SetInstanceType,
    AddSidecar,
    Start,
    Stop,
    Clone,
    CreateCustomResource,
    ExecuteCommand,
    ReadFile,
    IsRunning,
    WaitRunning,
    WaitStopped,
    Address,
    AddHost,
    PortForward,
    SetBandwidthLimit,
    SetLatencyAndJitter,
    SetPacketLoss,
    ClearShaping,
    DisableNetwork,
    EnableNetwork,
    NetworkIsDisabled,
}

use InstanceState::{Committed, Preparing, Started, Stopped};

const DESCRIPTOR: &[InstanceState] = &[Preparing, Committed];
const LIVE: &[InstanceState] = &[Started];

impl Operation {
    /// States in which this operation may be invoked
    pub fn allowed_states(self) -> &'static [InstanceState] {
        match self {
            Operation::SetImage => &[InstanceState::None, Started],
            Operation::SetImageInstant => LIVE,
            Operation::SetGitRepo => &[InstanceState::None],
            Operation::SetInstanceType => &[InstanceState::None, Preparing, Committed],
            Operation::Commit | Operation::SetUser => &[Preparing],

            Operation::AddTcpPort
            | Operation::AddUdpPort
            | Operation::SetCommand
            | Operation::SetArgs
            | Operation::SetEnv
            | Operation::AddVolume
            | Operation::AddFile
            | Operation::AddFolder
            | Operation::SetMemory
            | Operation::SetCpu
            | Operation::SetProbe
            | Operation::AddPolicyRule
            | Operation::SetPrivileged
            | Operation::AddCapability
            | Operation::SetObservability
            | Operation::SetFaultInjection
            | Operation::AddSidecar => DESCRIPTOR,

            Operation::Start => &[Committed, Stopped],
            Operation::Stop => LIVE,
            Operation::Clone | Operation::CreateCustomResource => &[Committed],

            Operation::ExecuteCommand => &[Preparing, Started],
            Operation::ReadFile => &[Preparing, Committed, Started],
            Operation::IsRunning => &[Started, Stopped],
            Operation::WaitStopped => &[Stopped],
            Operation::Address | Operation::AddHost => &[Committed, Started, Stopped],

            Operation::WaitRunning
            | Operation::PortForward
            | Operation::SetBandwidthLimit
            | Operation::SetLatencyAndJitter
            | Operation::SetPacketLoss
            | Operation::ClearShaping
            | Operation::DisableNetwork
            | Operation::EnableNetwork
            | Operation::NetworkIsDisabled => LIVE,
        }
    }

    /// Human-readable name used in errors and logs
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::SetImage => "set image",
            Operation::SetImageInstant => "set image instantly",
            Operation::SetGitRepo => "set git repo",
            Operation::Commit => "commit",
            Operation::AddTcpPort => "add TCP port",
            Operation::AddUdpPort => "add UDP port",
            Operation::SetCommand => "set command",
            Operation::SetArgs => "set args",
            Operation::SetEnv => "set environment variable",
            Operation::AddVolume => "add volume",
            Operation::AddFile => "add file",
            Operation::AddFolder => "add folder",
            Operation::SetUser => "set user",
            Operation::SetMemory => "set memory",
            Operation::SetCpu => "set CPU",
            Operation::SetProbe => "set probe",
            Operation::AddPolicyRule => "add policy rule",
            Operation::SetPrivileged => "set privileged",
            Operation::AddCapability => "add capability",
            Operation::SetObservability => "configure observability",
            Operation::SetFaultInjection => "configure fault injection",
            Operation::SetInstanceType => "set instance type",
            Operation::AddSidecar => "add sidecar",
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Clone => "clone",
            Operation::CreateCustomResource => "create custom resource",
            Operation::ExecuteCommand => "execute command",
            Operation::ReadFile => "read file",
            Operation::IsRunning => "check running",
            Operation::WaitRunning => "wait for running",
            Operation::WaitStopped => "wait for stopped",
            Operation::Address => "resolve address",
            Operation::AddHost => "add proxy host",
            Operation::PortForward => "port forward",
            Operation::SetBandwidthLimit => "set bandwidth limit",
            Operation::SetLatencyAndJitter => "set latency and jitter",
            Operation::SetPacketLoss => "set packet loss",
            Operation::ClearShaping => "clear traffic shaping",
            Operation::DisableNetwork => "disable network",
            Operation::EnableNetwork => "enable network",
            Operation::NetworkIsDisabled => "check network disabled",
        }
    }

    /// Whether `state` permits this operation
    pub fn is_allowed_in(self, state: InstanceState) -> bool {
        self.allowed_states().contains(&state)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fail with a state violation unless `state` permits `operation`
pub fn ensure_allowed(
    instance: &str,
    operation: Operation,
    state: InstanceState,
) -> Result<(), Error> {
    if operation.is_allowed_in(state) {
        Ok(())
    } else {
        Err(Error::state_violation(instance, operation, state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_mutators_only_before_start() {
        for state in [Started, Stopped, InstanceState::None] {
            assert!(!Operation::AddTcpPort.is_allowed_in(state));
            assert!(!Operation::SetEnv.is_allowed_in(state));
        }
        assert!(Operation::AddTcpPort.is_allowed_in(Preparing));
        assert!(Operation::AddTcpPort.is_allowed_in(Committed));
    }

    #[test]
    fn set_user_requires_preparing() {
        assert!(Operation::SetUser.is_allowed_in(Preparing));
        assert!(!Operation::SetUser.is_allowed_in(Committed));
    }

    #[test]
    fn live_operations_require_started() {
        for op in [
            Operation::PortForward,
            Operation::SetBandwidthLimit,
            Operation::DisableNetwork,
            Operation::WaitRunning,
        ] {
            assert_eq!(op.allowed_states(), &[Started]);
        }
    }

    #[test]
    fn set_image_first_call_or_while_started() {
        assert!(Operation::SetImage.is_allowed_in(InstanceState::None));
        assert!(Operation::SetImage.is_allowed_in(Started));
        assert!(!Operation::SetImage.is_allowed_in(Preparing));
        assert!(!Operation::SetImage.is_allowed_in(Committed));
    }

    #[test]
    fn violation_names_operation_and_state() {
        let err = ensure_allowed("web", Operation::AddTcpPort, Started).unwrap_err();
        assert!(err.is_state_violation());
        let msg = err.to_string();
        assert!(msg.contains("add TCP port"));
        assert!(msg.contains("Started"));
        assert!(msg.contains("web"));
    }

    #[test]
    fn start_from_committed_or_stopped() {
        assert!(ensure_allowed("web", Operation::Start, Committed).is_ok());
        assert!(ensure_allowed("web", Operation::Start, Stopped).is_ok());
        assert!(ensure_allowed("web", Operation::Start, Started).is_err());
    }
}
