// Copyright © 2025 The vfio-passthrough Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use std::collections::BTreeSet;

use crate::container::ContainerId;
use crate::device::DeviceId;
use crate::host::HostHandle;

/// One host isolation unit, bound to a single container for its whole
/// lifetime.
#[derive(Debug)]
pub(crate) struct VfioGroup {
    handle: HostHandle,
    container: ContainerId,
    // Set once the group holds its own reference on the container. A group
    // that was only opened while resolving a container has not joined yet.
    joined: bool,
    devices: BTreeSet<DeviceId>,
}

impl VfioGroup {
    pub(crate) fn new(handle: HostHandle, container: ContainerId) -> Self {
        VfioGroup {
            handle,
            container,
            joined: false,
            devices: BTreeSet::new(),
        }
    }

    pub(crate) fn handle(&self) -> HostHandle {
        self.handle
    }

    pub(crate) fn container(&self) -> ContainerId {
        self.container
    }

    pub(crate) fn joined(&self) -> bool {
        self.joined
    }

    /// Marks the group joined. Returns false if it already was.
    pub(crate) fn join(&mut self) -> bool {
        !std::mem::replace(&mut self.joined, true)
    }

    /// Gives the group's reference on the container back while keeping it
    /// attached on the host.
    pub(crate) fn leave(&mut self) {
        self.joined = false;
    }

    pub(crate) fn devices(&self) -> &BTreeSet<DeviceId> {
        &self.devices
    }

    pub(crate) fn add_device(&mut self, device: DeviceId) {
        self.devices.insert(device);
    }

    pub(crate) fn remove_device(&mut self, device: DeviceId) -> bool {
        self.devices.remove(&device)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
