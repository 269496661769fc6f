// Copyright © 2025 The vfio-passthrough Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! Reset coordination across the devices sharing a container.

use std::sync::Arc;

use crate::container::ContainerId;
use crate::device::{DeviceCapabilities, DeviceId, VfioDevice};
use crate::host::{HostHandle, VfioHost};
use crate::{Result, VfioError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResetMember {
    pub id: DeviceId,
    pub name: String,
    pub handle: HostHandle,
    pub reset_works: bool,
    pub needs_reset: bool,
}

/// Devices that have to be reset together: every device of every group
/// attached to one container.
pub struct ResetDomain {
    host: Arc<dyn VfioHost>,
    container: ContainerId,
    members: Vec<ResetMember>,
    groups: Vec<HostHandle>,
}

impl ResetDomain {
    pub fn container(&self) -> ContainerId {
        self.container
    }

    pub fn members(&self) -> &[ResetMember] {
        &self.members
    }

    /// Handles of every group in the domain, proving ownership of all the
    /// devices a bus reset affects.
    pub fn groups(&self) -> &[HostHandle] {
        &self.groups
    }

    /// Resets the whole domain with a single bus reset issued through its
    /// first member.
    pub fn hot_reset(&self) -> Result<()> {
        let first = self
            .members
            .first()
            .ok_or_else(|| VfioError::ResetUnsupported(self.container.to_string()))?;
        self.host.hot_reset(first.handle, &self.groups)
    }

    /// Resets every member on its own. Fails on the first member the host
    /// cannot reset.
    pub fn reset_members(&self) -> Result<()> {
        for member in self.members.iter() {
            if !member.reset_works {
                return Err(VfioError::ResetUnsupported(member.name.clone()));
            }
            self.host.reset_device(member.handle)?;
        }
        Ok(())
    }
}

/// Runs one reset round over `devices`: refresh their "needs reset" flags,
/// then reset the whole domain once if any of them asked for it.
///
/// Returns `None` when nothing was attempted, either because no device
/// needs a reset or because none of them can reset the domain.
pub(crate) fn reset_domain(
    host: &Arc<dyn VfioHost>,
    container: ContainerId,
    groups: Vec<HostHandle>,
    devices: &mut [&mut VfioDevice],
) -> Option<Result<()>> {
    for device in devices.iter_mut() {
        if !device.supports(DeviceCapabilities::COMPUTE_NEEDS_RESET) {
            continue;
        }
        if let Some(ops) = device.ops().cloned() {
            let needs_reset = ops.compute_needs_reset(device);
            device.set_needs_reset(needs_reset);
        }
    }

    if !devices.iter().any(|d| d.needs_reset()) {
        return None;
    }

    let Some(ops) = devices
        .iter()
        .find(|d| d.supports(DeviceCapabilities::HOT_RESET_MULTI))
        .and_then(|d| d.ops().cloned())
    else {
        debug!("{}: no device can reset the domain", container);
        return None;
    };

    let domain = ResetDomain {
        host: host.clone(),
        container,
        members: devices
            .iter()
            .map(|d| ResetMember {
                id: d.id(),
                name: d.name().to_owned(),
                handle: d.handle(),
                reset_works: d.reset_works(),
                needs_reset: d.needs_reset(),
            })
            .collect(),
        groups,
    };

    let result = ops.hot_reset_multi(&domain);
    match &result {
        Ok(()) => {
            info!(
                "{}: reset {} devices",
                container,
                domain.members.len()
            );
            for device in devices.iter_mut() {
                device.set_needs_reset(false);
            }
        }
        Err(e) => warn!("{}: domain reset failed: {}", container, e),
    }
    Some(result)
}
