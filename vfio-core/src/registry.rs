// Copyright © 2025 The vfio-passthrough Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! Process-wide registry of address space bindings, containers, groups and
//! devices.
//!
//! Every mutation happens under one lock, which also serializes the calls
//! into the host. Objects refer to each other through identifiers checked
//! at each lookup: a binding lists its containers, a container lists its
//! groups and a group lists its devices.
//!
//! A container holds one reference per outstanding
//! [`VfioRegistry::acquire_container`] and one per joined group. It is torn
//! down when the count drops to zero: mappings are removed first, then the
//! remaining groups are detached and the host handle is closed. The
//! address space binding goes away with its last container.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use vm_device::{AddressSpaceId, GuestIommuId, IommuTlbEntry, MemoryTopology, Transaction};
use vmm_sys_util::eventfd::EventFd;

use crate::config::VfioConfig;
use crate::container::{
    ContainerError, ContainerId, DmaMapping, IommuBackend, Type1Backend, VfioContainer,
};
use crate::device::{DeviceId, VfioDevice, VfioDeviceOps};
use crate::giommu::{self, VfioDmaMapping};
use crate::group::VfioGroup;
use crate::host::{HostHandle, IommuType, RegionInfo, VfioHost};
use crate::listener::MappingListener;
use crate::region::{AccessPath, MapState};
use crate::reset;
use crate::{Result, VfioError};

const DEFAULT_PGSIZE: u64 = 0x1000;

/// Containers servicing one address space. Being listed here is what
/// subscribes a container to the topology transactions of the space.
struct AddressSpaceBinding {
    topology: Arc<dyn MemoryTopology>,
    containers: Vec<ContainerId>,
}

#[derive(Default)]
struct RegistryState {
    spaces: BTreeMap<AddressSpaceId, AddressSpaceBinding>,
    containers: BTreeMap<ContainerId, VfioContainer>,
    groups: BTreeMap<u32, VfioGroup>,
    devices: BTreeMap<DeviceId, VfioDevice>,
    next_container: u32,
    next_device: u32,
}

impl RegistryState {
    fn joined_groups(&self, container: &VfioContainer) -> u32 {
        container
            .groups
            .iter()
            .filter(|id| self.groups.get(id).is_some_and(|g| g.joined()))
            .count() as u32
    }
}

/// Result of one pass of the reset handler.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResetOutcome {
    /// Reset domains for which a reset was requested.
    pub attempted: usize,
    /// Domains whose reset failed. Their devices keep their flag.
    pub failed: usize,
}

pub struct VfioRegistry {
    host: Arc<dyn VfioHost>,
    config: VfioConfig,
    allow_mmap: AtomicBool,
    state: Mutex<RegistryState>,
}

impl VfioRegistry {
    pub fn new(host: Arc<dyn VfioHost>, config: VfioConfig) -> Self {
        VfioRegistry {
            host,
            allow_mmap: AtomicBool::new(config.allow_mmap),
            config,
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn host(&self) -> &Arc<dyn VfioHost> {
        &self.host
    }

    pub fn config(&self) -> &VfioConfig {
        &self.config
    }

    /// Whether region accesses may use direct-map windows.
    pub fn allow_mmap(&self) -> bool {
        self.allow_mmap.load(Ordering::Acquire)
    }

    pub fn set_allow_mmap(&self, allow: bool) {
        self.allow_mmap.store(allow, Ordering::Release);
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap()
    }

    fn listener(&self) -> MappingListener<'_> {
        MappingListener::new(self.host.as_ref(), self.config.map_retry)
    }

    /// Returns a container of `topology`'s address space able to host
    /// `group_id`, creating one if none of the existing containers accepts
    /// the group. The caller owns one reference on the returned container.
    pub fn acquire_container(
        &self,
        topology: Arc<dyn MemoryTopology>,
        group_id: u32,
    ) -> Result<ContainerId> {
        let mut state = self.state();
        self.acquire_container_locked(&mut state, topology, group_id)
    }

    fn acquire_container_locked(
        &self,
        state: &mut RegistryState,
        topology: Arc<dyn MemoryTopology>,
        group_id: u32,
    ) -> Result<ContainerId> {
        let space = topology.id();

        if let Some(group) = state.groups.get(&group_id) {
            let id = group.container();
            let container = state
                .containers
                .get_mut(&id)
                .ok_or(VfioError::UnknownContainer(id))?;
            if container.space != space {
                return Err(VfioError::GroupAddressSpaceConflict {
                    group: group_id,
                    space: container.space,
                });
            }
            container.refcount += 1;
            return Ok(id);
        }

        let group_handle = self.host.open_group(group_id)?;

        let candidates = state
            .spaces
            .get(&space)
            .map(|b| b.containers.clone())
            .unwrap_or_default();
        for id in candidates {
            let Some(container) = state.containers.get_mut(&id) else {
                continue;
            };
            if self
                .host
                .group_set_container(group_handle, container.handle)
                .is_ok()
            {
                container.groups.insert(group_id);
                container.refcount += 1;
                state
                    .groups
                    .insert(group_id, VfioGroup::new(group_handle, id));
                debug!("Group {} shares {} in {}", group_id, id, space);
                return Ok(id);
            }
        }

        self.create_container_locked(state, topology, group_id, group_handle)
    }

    fn setup_container(
        &self,
        container: HostHandle,
        group: HostHandle,
        model: IommuType,
    ) -> Result<u64> {
        if !self.host.check_extension(container, model)? {
            return Err(VfioError::UnsupportedIommuModel(model));
        }
        self.host.group_set_container(group, container)?;
        if let Err(e) = self.host.set_iommu(container, model) {
            if let Err(e) = self.host.group_unset_container(group, container) {
                warn!("Failed to detach group from container: {}", e);
            }
            return Err(e);
        }

        let pgsize = match self.host.iommu_pgsizes(container) {
            Ok(pgsizes) if pgsizes != 0 => 1 << pgsizes.trailing_zeros(),
            Ok(_) => DEFAULT_PGSIZE,
            Err(e) => {
                warn!("Could not get IOMMU page sizes, assuming 4k: {}", e);
                DEFAULT_PGSIZE
            }
        };
        Ok(pgsize)
    }

    fn create_container_locked(
        &self,
        state: &mut RegistryState,
        topology: Arc<dyn MemoryTopology>,
        group_id: u32,
        group_handle: HostHandle,
    ) -> Result<ContainerId> {
        let space = topology.id();
        let model = self.config.iommu;

        let handle = match self.host.open_container() {
            Ok(handle) => handle,
            Err(e) => {
                self.host.close_group(group_handle);
                return Err(e);
            }
        };
        let pgsize = match self.setup_container(handle, group_handle, model) {
            Ok(pgsize) => pgsize,
            Err(e) => {
                self.host.close_container(handle);
                self.host.close_group(group_handle);
                return Err(e);
            }
        };

        let id = ContainerId(state.next_container);
        state.next_container += 1;

        let mut container = VfioContainer::new(
            id,
            space,
            handle,
            IommuBackend::Type1(Type1Backend::new(model, pgsize)),
        );
        container.groups.insert(group_id);
        container.refcount = 1;
        state
            .groups
            .insert(group_id, VfioGroup::new(group_handle, id));
        state
            .spaces
            .entry(space)
            .or_insert_with(|| {
                debug!("Binding address space {}", space);
                AddressSpaceBinding {
                    topology: topology.clone(),
                    containers: Vec::new(),
                }
            })
            .containers
            .push(id);

        let replayed = self.listener().replay(&mut container, &topology.sections());
        state.containers.insert(id, container);
        if let Err(e) = replayed {
            error!("Failed to set up DMA mappings of {}: {}", id, e);
            self.destroy_container_locked(state, id);
            return Err(e);
        }

        info!(
            "Created {} ({}, 0x{:x} pages) for group {} in {}",
            id, model, pgsize, group_id, space
        );
        Ok(id)
    }

    /// Drops one reference taken by [`VfioRegistry::acquire_container`].
    ///
    /// # Panics
    ///
    /// If the container has no outstanding acquired reference.
    pub fn release_container(&self, id: ContainerId) -> Result<()> {
        let mut state = self.state();
        self.release_container_locked(&mut state, id)
    }

    fn release_container_locked(&self, state: &mut RegistryState, id: ContainerId) -> Result<()> {
        let container = state
            .containers
            .get(&id)
            .ok_or(VfioError::UnknownContainer(id))?;
        let joined = state.joined_groups(container);
        assert!(
            container.refcount > joined,
            "{} released more often than acquired",
            id
        );

        let refcount = match state.containers.get_mut(&id) {
            Some(container) => {
                container.refcount -= 1;
                container.refcount
            }
            None => return Err(VfioError::UnknownContainer(id)),
        };
        if refcount == 0 {
            self.destroy_container_locked(state, id);
        }
        Ok(())
    }

    fn destroy_container_locked(&self, state: &mut RegistryState, id: ContainerId) {
        let Some(mut container) = state.containers.remove(&id) else {
            return;
        };

        container.teardown(self.host.as_ref());

        for group_id in std::mem::take(&mut container.groups) {
            let Some(group) = state.groups.remove(&group_id) else {
                continue;
            };
            if let Err(e) = self
                .host
                .group_unset_container(group.handle(), container.handle)
            {
                error!("Failed to detach group {} from {}: {}", group_id, id, e);
            }
            self.host.close_group(group.handle());
        }
        self.host.close_container(container.handle);

        if let Some(binding) = state.spaces.get_mut(&container.space) {
            binding.containers.retain(|c| *c != id);
            if binding.containers.is_empty() {
                debug!("Unbinding address space {}", container.space);
                state.spaces.remove(&container.space);
            }
        }
        info!("Released {}", id);
    }

    /// Attaches `group_id` to `container`, opening the group if needed.
    ///
    /// Joining the container a group already belongs to is a no-op. A group
    /// bound to another container is refused and nothing changes.
    pub fn join_group(&self, group_id: u32, container: ContainerId) -> Result<()> {
        let mut state = self.state();
        self.join_group_locked(&mut state, group_id, container)
    }

    fn join_group_locked(
        &self,
        state: &mut RegistryState,
        group_id: u32,
        id: ContainerId,
    ) -> Result<()> {
        let container = state
            .containers
            .get_mut(&id)
            .ok_or(VfioError::UnknownContainer(id))?;

        if let Some(group) = state.groups.get_mut(&group_id) {
            if group.container() != id {
                return Err(VfioError::GroupContainerConflict {
                    group: group_id,
                    bound: group.container(),
                    requested: id,
                });
            }
            if group.join() {
                container.refcount += 1;
                info!("Group {} joined {}", group_id, id);
            }
            return Ok(());
        }

        let handle = self.host.open_group(group_id)?;
        if let Err(e) = self.host.group_set_container(handle, container.handle) {
            self.host.close_group(handle);
            return Err(e);
        }
        container.groups.insert(group_id);
        container.refcount += 1;

        let mut group = VfioGroup::new(handle, id);
        group.join();
        state.groups.insert(group_id, group);
        info!("Group {} joined {}", group_id, id);
        Ok(())
    }

    /// Detaches `group_id` from its container once its last device is
    /// closed. A group with open devices is left alone.
    ///
    /// A group that is the last one attached to a container still
    /// referenced stays attached on the host, so that the container keeps
    /// its IOMMU backend, until the container goes away.
    pub fn leave_group(&self, group_id: u32) -> Result<()> {
        let mut state = self.state();
        self.leave_group_locked(&mut state, group_id)
    }

    fn leave_group_locked(&self, state: &mut RegistryState, group_id: u32) -> Result<()> {
        let group = state
            .groups
            .get_mut(&group_id)
            .ok_or(VfioError::UnknownGroup(group_id))?;
        if !group.is_empty() {
            debug!(
                "Group {} still has {} open devices",
                group_id,
                group.devices().len()
            );
            return Ok(());
        }
        if !group.joined() {
            return Ok(());
        }

        let id = group.container();
        let handle = group.handle();
        let container = state
            .containers
            .get_mut(&id)
            .ok_or(VfioError::UnknownContainer(id))?;
        container.refcount -= 1;
        info!("Group {} left {}", group_id, id);

        if container.refcount == 0 {
            self.destroy_container_locked(state, id);
        } else if container.groups.len() == 1 {
            group.leave();
        } else {
            container.groups.remove(&group_id);
            if let Err(e) = self.host.group_unset_container(handle, container.handle) {
                error!("Failed to detach group {} from {}: {}", group_id, id, e);
            }
            self.host.close_group(handle);
            state.groups.remove(&group_id);
        }
        Ok(())
    }

    /// Resolves the container servicing `group_id` in `topology`'s address
    /// space and joins the group to it.
    pub fn get_group(&self, group_id: u32, topology: Arc<dyn MemoryTopology>) -> Result<ContainerId> {
        let mut state = self.state();
        let id = self.acquire_container_locked(&mut state, topology, group_id)?;
        let joined = self.join_group_locked(&mut state, group_id, id);
        self.release_container_locked(&mut state, id)?;
        joined.map(|()| id)
    }

    pub fn put_group(&self, group_id: u32) -> Result<()> {
        self.leave_group(group_id)
    }

    /// Opens `name` in a joined group. Mappable regions get a direct-map
    /// window when direct mapping is allowed; a window that cannot be
    /// installed leaves its region trap-only.
    pub fn open_device(
        &self,
        group_id: u32,
        name: &str,
        ops: Option<Arc<dyn VfioDeviceOps>>,
    ) -> Result<DeviceId> {
        let mut state = self.state();

        let group = state
            .groups
            .get(&group_id)
            .filter(|g| g.joined())
            .ok_or(VfioError::UnknownGroup(group_id))?;
        if group
            .devices()
            .iter()
            .any(|d| state.devices.get(d).is_some_and(|d| d.name() == name))
        {
            return Err(VfioError::DeviceAlreadyOpen(name.to_owned(), group_id));
        }
        let group_handle = group.handle();

        let id = DeviceId(state.next_device);
        let device = VfioDevice::open(
            self.host.as_ref(),
            id,
            name,
            group_id,
            group_handle,
            self.allow_mmap(),
            ops,
        )?;
        state.next_device += 1;

        if let Some(group) = state.groups.get_mut(&group_id) {
            group.add_device(id);
        }
        state.devices.insert(id, device);
        Ok(id)
    }

    /// Unmaps every region of the device and closes it. If the host refuses
    /// to close it, the device stays registered with its regions trapped.
    pub fn close_device(&self, id: DeviceId) -> Result<()> {
        let mut state = self.state();
        let device = state
            .devices
            .get_mut(&id)
            .ok_or(VfioError::UnknownDevice(id))?;
        device.close(self.host.as_ref())?;

        if let Some(device) = state.devices.remove(&id) {
            if let Some(group) = state.groups.get_mut(&device.group_id()) {
                group.remove_device(id);
            }
            info!("Closed device {}", device.name());
        }
        Ok(())
    }

    /// Runs `f` against an open device.
    pub fn with_device<R>(&self, id: DeviceId, f: impl FnOnce(&VfioDevice) -> R) -> Result<R> {
        let state = self.state();
        let device = state.devices.get(&id).ok_or(VfioError::UnknownDevice(id))?;
        Ok(f(device))
    }

    pub fn region_read(&self, id: DeviceId, index: u32, offset: u64, width: usize) -> Result<u64> {
        let state = self.state();
        let device = state.devices.get(&id).ok_or(VfioError::UnknownDevice(id))?;
        device.region(index)?.read(
            self.host.as_ref(),
            device.handle(),
            offset,
            width,
            self.allow_mmap(),
        )
    }

    pub fn region_write(
        &self,
        id: DeviceId,
        index: u32,
        offset: u64,
        width: usize,
        value: u64,
    ) -> Result<()> {
        let state = self.state();
        let device = state.devices.get(&id).ok_or(VfioError::UnknownDevice(id))?;
        device.region(index)?.write(
            self.host.as_ref(),
            device.handle(),
            offset,
            width,
            value,
            self.allow_mmap(),
        )
    }

    /// How an access of `width` bytes at `offset` would be carried out.
    pub fn access_path(
        &self,
        id: DeviceId,
        index: u32,
        offset: u64,
        width: usize,
    ) -> Result<AccessPath> {
        let state = self.state();
        let device = state.devices.get(&id).ok_or(VfioError::UnknownDevice(id))?;
        Ok(device
            .region(index)?
            .access_path(offset, width, self.allow_mmap()))
    }

    /// Installs a direct-map window over the first `window` bytes of a
    /// region, all of it when `None`.
    pub fn map_region(&self, id: DeviceId, index: u32, window: Option<u64>) -> Result<()> {
        let mut state = self.state();
        let device = state
            .devices
            .get_mut(&id)
            .ok_or(VfioError::UnknownDevice(id))?;
        let handle = device.handle();
        device
            .region_mut(index)?
            .map(self.host.as_ref(), handle, window)
    }

    pub fn unmap_region(&self, id: DeviceId, index: u32) -> Result<()> {
        let mut state = self.state();
        let device = state
            .devices
            .get_mut(&id)
            .ok_or(VfioError::UnknownDevice(id))?;
        device.region_mut(index)?.unmap();
        Ok(())
    }

    pub fn disable_irq(&self, id: DeviceId, index: u32) -> Result<()> {
        let state = self.state();
        let device = state.devices.get(&id).ok_or(VfioError::UnknownDevice(id))?;
        device.disable_irq(self.host.as_ref(), index)
    }

    pub fn mask_irq(&self, id: DeviceId, index: u32) -> Result<()> {
        let state = self.state();
        let device = state.devices.get(&id).ok_or(VfioError::UnknownDevice(id))?;
        device.mask_irq(self.host.as_ref(), index)
    }

    pub fn unmask_irq(&self, id: DeviceId, index: u32) -> Result<()> {
        let state = self.state();
        let device = state.devices.get(&id).ok_or(VfioError::UnknownDevice(id))?;
        device.unmask_irq(self.host.as_ref(), index)
    }

    /// Routes the vectors of `index` to `event_fds`, one per vector.
    pub fn enable_irq(&self, id: DeviceId, index: u32, event_fds: &[&EventFd]) -> Result<()> {
        let state = self.state();
        let device = state.devices.get(&id).ok_or(VfioError::UnknownDevice(id))?;
        device.enable_irq(self.host.as_ref(), index, event_fds)
    }

    /// Signals end of interrupt through the device model hook. Returns
    /// whether the device has one.
    pub fn eoi(&self, id: DeviceId) -> Result<bool> {
        let state = self.state();
        let device = state.devices.get(&id).ok_or(VfioError::UnknownDevice(id))?;
        Ok(device.eoi())
    }

    /// Resets a single device through the host.
    pub fn reset_device(&self, id: DeviceId) -> Result<()> {
        let mut state = self.state();
        let device = state
            .devices
            .get_mut(&id)
            .ok_or(VfioError::UnknownDevice(id))?;
        if !device.reset_works() {
            return Err(VfioError::ResetUnsupported(device.name().to_owned()));
        }
        self.host.reset_device(device.handle())?;
        device.set_needs_reset(false);
        Ok(())
    }

    /// Process-wide reset handling: every container is one reset domain,
    /// reset at most once per pass.
    pub fn reset_handler(&self) -> ResetOutcome {
        let mut state = self.state();
        let RegistryState {
            containers,
            groups,
            devices,
            ..
        } = &mut *state;

        let mut outcome = ResetOutcome::default();
        for container in containers.values() {
            let group_handles: Vec<HostHandle> = container
                .groups
                .iter()
                .filter_map(|id| groups.get(id))
                .map(|g| g.handle())
                .collect();
            let mut members: Vec<&mut VfioDevice> = devices
                .values_mut()
                .filter(|d| container.groups.contains(&d.group_id()))
                .collect();
            if members.is_empty() {
                continue;
            }

            match reset::reset_domain(&self.host, container.id, group_handles, &mut members) {
                None => {}
                Some(Ok(())) => outcome.attempted += 1,
                Some(Err(_)) => {
                    outcome.attempted += 1;
                    outcome.failed += 1;
                }
            }
        }
        outcome
    }

    /// Handler to register with whatever triggers a system reset. It does
    /// not keep the registry alive.
    pub fn reset_callback(self: &Arc<Self>) -> Box<dyn Fn() + Send + Sync> {
        let registry = Arc::downgrade(self);
        Box::new(move || {
            if let Some(registry) = registry.upgrade() {
                let outcome = registry.reset_handler();
                if outcome.failed > 0 {
                    warn!(
                        "{} of {} reset domains failed to reset",
                        outcome.failed, outcome.attempted
                    );
                }
            }
        })
    }

    /// Applies a topology transaction of `space` to every container
    /// servicing it. Mapping failures never reach the caller; they are
    /// recorded on the container and retried.
    pub fn commit(&self, space: AddressSpaceId, txn: &Transaction) {
        let listener = self.listener();
        let mut state = self.state();
        let RegistryState {
            spaces, containers, ..
        } = &mut *state;

        let Some(binding) = spaces.get(&space) else {
            return;
        };
        for id in binding.containers.iter() {
            if let Some(container) = containers.get_mut(id) {
                listener.commit(container, txn);
            }
        }
    }

    /// Propagates a translation or an invalidation published by guest
    /// IOMMU `iommu` to the containers of `space` watching it.
    pub fn notify_guest_iommu(
        &self,
        space: AddressSpaceId,
        iommu: GuestIommuId,
        entry: &IommuTlbEntry,
    ) -> Result<()> {
        let mut state = self.state();
        let RegistryState {
            spaces, containers, ..
        } = &mut *state;

        let Some(binding) = spaces.get(&space) else {
            return Ok(());
        };
        let sections = if entry.is_invalidation() {
            Vec::new()
        } else {
            binding.topology.sections()
        };

        let mut result = Ok(());
        for id in binding.containers.iter() {
            let Some(container) = containers.get_mut(id) else {
                continue;
            };
            if let Err(e) =
                giommu::apply_entry(self.host.as_ref(), container, iommu, entry, &sections)
            {
                error!("{}: failed to apply {} entry: {}", id, iommu, e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Mapping endpoint for the guest IOMMU model of `iommu`.
    pub fn dma_mapping(self: &Arc<Self>, space: AddressSpaceId, iommu: GuestIommuId) -> VfioDmaMapping {
        VfioDmaMapping::new(self.clone(), space, iommu)
    }

    pub fn address_spaces(&self) -> Vec<AddressSpaceId> {
        self.state().spaces.keys().copied().collect()
    }

    pub fn containers(&self, space: AddressSpaceId) -> Vec<ContainerId> {
        self.state()
            .spaces
            .get(&space)
            .map(|b| b.containers.clone())
            .unwrap_or_default()
    }

    pub fn group_ids(&self) -> Vec<u32> {
        self.state().groups.keys().copied().collect()
    }

    pub fn group_container(&self, group_id: u32) -> Option<ContainerId> {
        self.state().groups.get(&group_id).map(|g| g.container())
    }

    pub fn container_refcount(&self, id: ContainerId) -> Option<u32> {
        self.state().containers.get(&id).map(|c| c.refcount)
    }

    pub fn container_iommu(&self, id: ContainerId) -> Option<IommuType> {
        self.state().containers.get(&id).map(|c| c.backend.model())
    }

    /// Sticky mapping error of the container, if any.
    pub fn container_error(&self, id: ContainerId) -> Option<ContainerError> {
        self.state()
            .containers
            .get(&id)
            .and_then(|c| c.backend.error())
    }

    pub fn container_mappings(&self, id: ContainerId) -> Vec<DmaMapping> {
        self.state()
            .containers
            .get(&id)
            .map(|c| c.backend.mappings())
            .unwrap_or_default()
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.state().devices.keys().copied().collect()
    }

    pub fn device_name(&self, id: DeviceId) -> Option<String> {
        self.state().devices.get(&id).map(|d| d.name().to_owned())
    }

    pub fn region_info(&self, id: DeviceId, index: u32) -> Result<RegionInfo> {
        self.with_device(id, |d| {
            d.region(index).map(|r| RegionInfo {
                index: r.index(),
                flags: r.flags(),
                size: r.size(),
                offset: r.fd_offset(),
            })
        })?
    }

    pub fn region_map_state(&self, id: DeviceId, index: u32) -> Result<MapState> {
        self.with_device(id, |d| d.region(index).map(|r| r.map_state().clone()))?
    }

    pub fn needs_reset(&self, id: DeviceId) -> Option<bool> {
        self.state().devices.get(&id).map(|d| d.needs_reset())
    }
}
