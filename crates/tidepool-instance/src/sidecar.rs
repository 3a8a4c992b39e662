//! Attaching sidecars to a parent instance
//!
//! A sidecar shares its parent's pod. Its lifecycle is driven by the parent:
//! start and stop propagate to every sidecar, and a sidecar rejects them
//! directly.

use tracing::info;

use crate::instance::InstanceId;
use crate::state::{InstanceState, Operation};
use crate::testbed::Testbed;
use tidepool_common::Error;

impl Testbed {
    /// Attach `sidecar` to `parent`, appending it to the container order
    pub fn add_sidecar(&mut self, parent: InstanceId, sidecar: InstanceId) -> Result<(), Error> {
        let parent_idx = self.index(parent)?;
        let parent_instance = &self.instances[parent_idx];
        parent_instance.guard(Operation::AddSidecar)?;

        let sidecar_idx = self.index(sidecar).map_err(|_| {
            Error::validation_for(
                parent_instance.name(),
                format!("cannot add unknown instance {} as sidecar", sidecar),
            )
        })?;
        if sidecar_idx == parent_idx {
            return Err(Error::invariant(
                parent_instance.name(),
                "an instance cannot be its own sidecar",
            ));
        }

        let candidate = &self.instances[sidecar_idx];
        if candidate.state != InstanceState::Committed {
            return Err(Error::state_violation(
                candidate.name(),
                Operation::AddSidecar,
                candidate.state,
            ));
        }
        if parent_instance.is_sidecar() {
            return Err(Error::invariant(
                parent_instance.name(),
                "a sidecar cannot have sidecars",
            ));
        }
        if candidate.is_sidecar() {
            return Err(Error::invariant(
                candidate.name(),
                "instance is already a sidecar of another instance",
            ));
        }
        if !candidate.sidecars().is_empty() {
            return Err(Error::invariant(
                candidate.name(),
                "an instance with sidecars cannot become a sidecar",
            ));
        }

        info!(
            instance = %parent_instance.name(),
            sidecar = %candidate.name(),
            "Added sidecar"
        );
        self.instances[sidecar_idx].parent = Some(parent);
        self.instances[parent_idx].sidecars.push(sidecar);
        Ok(())
    }
}
