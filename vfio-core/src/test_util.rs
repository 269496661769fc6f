// Copyright © 2025 The vfio-passthrough Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! In-memory host used by the unit tests.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io;
use std::os::fd::AsFd;
use std::os::unix::fs::FileExt;
use std::sync::{Arc, Mutex};

use vm_device::{AddressSpaceId, MemorySection, MemoryTopology, TopologyEvent, Transaction};
use vm_memory::{GuestAddress, GuestMemory, GuestMemoryMmap};
use vmm_sys_util::tempfile::TempFile;

use crate::host::{
    DeviceFlags, DeviceInfo, DmaPermissions, HostHandle, IommuType, IrqFlags, IrqInfo, IrqSet,
    RegionFlags, RegionInfo, VfioHost,
};
use crate::mmap::MmapRegion;
use crate::{Result, VfioError};

fn host_err(op: &'static str, errno: i32) -> VfioError {
    VfioError::HostCallFailed {
        op,
        source: io::Error::from_raw_os_error(errno),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum HostCall {
    OpenContainer(HostHandle),
    CloseContainer(HostHandle),
    SetIommu(HostHandle, IommuType),
    DmaMap {
        container: HostHandle,
        iova: u64,
        size: u64,
        vaddr: u64,
        perm: DmaPermissions,
    },
    DmaUnmap {
        container: HostHandle,
        iova: u64,
        size: u64,
    },
    OpenGroup(u32, HostHandle),
    CloseGroup(HostHandle),
    SetContainer {
        group: HostHandle,
        container: HostHandle,
    },
    UnsetContainer {
        group: HostHandle,
        container: HostHandle,
    },
    OpenDevice(String, HostHandle),
    CloseDevice(HostHandle),
    SetIrqs(HostHandle, IrqSet),
    ResetDevice(HostHandle),
    HotReset {
        device: HostHandle,
        groups: Vec<HostHandle>,
    },
}

/// Geometry of a mock device. Region `n` lives at offset
/// `n * REGION_STRIDE` within the device.
#[derive(Clone, Debug)]
pub(crate) struct MockDeviceSpec {
    name: String,
    group: u32,
    flags: DeviceFlags,
    regions: Vec<(RegionFlags, u64)>,
    irqs: Vec<(IrqFlags, u32)>,
}

impl MockDeviceSpec {
    pub(crate) const REGION_STRIDE: u64 = 0x10_0000;

    pub(crate) fn new(name: &str, group: u32) -> Self {
        MockDeviceSpec {
            name: name.to_owned(),
            group,
            flags: DeviceFlags::PCI | DeviceFlags::RESET,
            regions: Vec::new(),
            irqs: Vec::new(),
        }
    }

    pub(crate) fn flags(mut self, flags: DeviceFlags) -> Self {
        self.flags = flags;
        self
    }

    pub(crate) fn region(mut self, flags: RegionFlags, size: u64) -> Self {
        assert!(size <= Self::REGION_STRIDE);
        self.regions.push((flags, size));
        self
    }

    pub(crate) fn irq(mut self, flags: IrqFlags, count: u32) -> Self {
        self.irqs.push((flags, count));
        self
    }
}

struct MockDevice {
    spec: MockDeviceSpec,
    // Backs both the trapped accesses and the direct-map windows.
    backing: TempFile,
    busy: bool,
    trapped: usize,
    mmap_calls: usize,
    failed_mmaps: HashSet<u32>,
    mmap_limit: Option<u64>,
}

#[derive(Default)]
struct MockContainer {
    groups: BTreeSet<HostHandle>,
    iommu: Option<IommuType>,
    mappings: BTreeMap<u64, u64>,
}

struct MockGroup {
    id: u32,
    container: Option<HostHandle>,
}

struct MockState {
    next_handle: i32,
    calls: Vec<HostCall>,
    devices: BTreeMap<String, MockDevice>,
    containers: HashMap<HostHandle, MockContainer>,
    groups: HashMap<HostHandle, MockGroup>,
    open_devices: HashMap<HostHandle, String>,
    non_viable: HashSet<u32>,
    // Groups only share a container with groups of the same class.
    classes: HashMap<u32, u32>,
    no_type1v2: bool,
    pgsizes: u64,
    dma_map_failures: Vec<u64>,
    fail_unmap: bool,
    fail_hot_reset: bool,
}

impl MockState {
    fn alloc(&mut self) -> HostHandle {
        self.next_handle += 1;
        HostHandle(self.next_handle)
    }

    fn class(&self, group: u32) -> u32 {
        self.classes.get(&group).copied().unwrap_or(0)
    }

    fn device(&mut self, handle: HostHandle, op: &'static str) -> Result<&mut MockDevice> {
        let name = self
            .open_devices
            .get(&handle)
            .ok_or_else(|| host_err(op, libc::EBADF))?;
        self.devices
            .get_mut(name)
            .ok_or_else(|| host_err(op, libc::ENODEV))
    }
}

pub(crate) struct MockHost {
    state: Mutex<MockState>,
}

impl MockHost {
    pub(crate) fn new() -> Self {
        MockHost {
            state: Mutex::new(MockState {
                next_handle: 100,
                calls: Vec::new(),
                devices: BTreeMap::new(),
                containers: HashMap::new(),
                groups: HashMap::new(),
                open_devices: HashMap::new(),
                non_viable: HashSet::new(),
                classes: HashMap::new(),
                no_type1v2: false,
                pgsizes: 0x1000 | 0x20_0000 | 0x4000_0000,
                dma_map_failures: Vec::new(),
                fail_unmap: false,
                fail_hot_reset: false,
            }),
        }
    }

    pub(crate) fn add_device(&self, spec: MockDeviceSpec) {
        let backing = TempFile::new().unwrap();
        let len = spec.regions.len() as u64 * MockDeviceSpec::REGION_STRIDE;
        backing.as_file().set_len(len.max(1)).unwrap();
        self.state.lock().unwrap().devices.insert(
            spec.name.clone(),
            MockDevice {
                spec,
                backing,
                busy: false,
                trapped: 0,
                mmap_calls: 0,
                failed_mmaps: HashSet::new(),
                mmap_limit: None,
            },
        );
    }

    /// Opens `group_id` and attaches it to a fresh container so devices
    /// can be looked up in it.
    pub(crate) fn attached_group(&self, group_id: u32) -> HostHandle {
        let group = self.open_group(group_id).unwrap();
        let container = self.open_container().unwrap();
        self.group_set_container(group, container).unwrap();
        group
    }

    pub(crate) fn calls(&self) -> Vec<HostCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Host objects currently open.
    pub(crate) fn open_handles(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.containers.len() + state.groups.len() + state.open_devices.len()
    }

    /// Mappings installed in `container`, as `(iova, size)` pairs.
    pub(crate) fn mappings(&self, container: HostHandle) -> Vec<(u64, u64)> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(&container)
            .map(|c| c.mappings.iter().map(|(i, s)| (*i, *s)).collect())
            .unwrap_or_default()
    }

    pub(crate) fn set_group_not_viable(&self, group: u32) {
        self.state.lock().unwrap().non_viable.insert(group);
    }

    /// Puts `group` in its own compatibility class: it cannot share a
    /// container with any other group.
    pub(crate) fn isolate_group(&self, group: u32) {
        self.state
            .lock()
            .unwrap()
            .classes
            .insert(group, group + 1);
    }

    pub(crate) fn disable_type1v2(&self) {
        self.state.lock().unwrap().no_type1v2 = true;
    }

    pub(crate) fn set_pgsizes(&self, pgsizes: u64) {
        self.state.lock().unwrap().pgsizes = pgsizes;
    }

    /// Fails every map covering `iova`.
    pub(crate) fn fail_dma_map(&self, iova: u64) {
        self.state.lock().unwrap().dma_map_failures.push(iova);
    }

    pub(crate) fn clear_dma_map_failures(&self) {
        self.state.lock().unwrap().dma_map_failures.clear();
    }

    pub(crate) fn fail_dma_unmap(&self, fail: bool) {
        self.state.lock().unwrap().fail_unmap = fail;
    }

    pub(crate) fn fail_hot_reset(&self, fail: bool) {
        self.state.lock().unwrap().fail_hot_reset = fail;
    }

    pub(crate) fn set_device_busy(&self, name: &str, busy: bool) {
        if let Some(d) = self.state.lock().unwrap().devices.get_mut(name) {
            d.busy = busy;
        }
    }

    pub(crate) fn fail_mmap(&self, name: &str, region: u32) {
        if let Some(d) = self.state.lock().unwrap().devices.get_mut(name) {
            d.failed_mmaps.insert(region);
        }
    }

    /// Fails every direct mapping longer than `len`.
    pub(crate) fn limit_mmap(&self, name: &str, len: u64) {
        if let Some(d) = self.state.lock().unwrap().devices.get_mut(name) {
            d.mmap_limit = Some(len);
        }
    }

    pub(crate) fn mmap_calls(&self, name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .devices
            .get(name)
            .map_or(0, |d| d.mmap_calls)
    }

    pub(crate) fn trapped_accesses(&self, name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .devices
            .get(name)
            .map_or(0, |d| d.trapped)
    }
}

impl VfioHost for MockHost {
    fn open_container(&self) -> Result<HostHandle> {
        let mut state = self.state.lock().unwrap();
        let handle = state.alloc();
        state.containers.insert(handle, MockContainer::default());
        state.calls.push(HostCall::OpenContainer(handle));
        Ok(handle)
    }

    fn close_container(&self, container: HostHandle) {
        let mut state = self.state.lock().unwrap();
        let c = state.containers.remove(&container).unwrap();
        assert!(c.groups.is_empty(), "container closed with groups attached");
        state.calls.push(HostCall::CloseContainer(container));
    }

    fn check_extension(&self, container: HostHandle, iommu: IommuType) -> Result<bool> {
        let state = self.state.lock().unwrap();
        if !state.containers.contains_key(&container) {
            return Err(host_err("VFIO_CHECK_EXTENSION", libc::EBADF));
        }
        Ok(iommu == IommuType::Type1 || !state.no_type1v2)
    }

    fn set_iommu(&self, container: HostHandle, iommu: IommuType) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let c = state
            .containers
            .get_mut(&container)
            .ok_or_else(|| host_err("VFIO_SET_IOMMU", libc::EBADF))?;
        if c.groups.is_empty() || c.iommu.is_some() {
            return Err(host_err("VFIO_SET_IOMMU", libc::EINVAL));
        }
        c.iommu = Some(iommu);
        state.calls.push(HostCall::SetIommu(container, iommu));
        Ok(())
    }

    fn iommu_pgsizes(&self, container: HostHandle) -> Result<u64> {
        let state = self.state.lock().unwrap();
        match state.containers.get(&container) {
            Some(c) if c.iommu.is_some() => Ok(state.pgsizes),
            _ => Err(host_err("VFIO_IOMMU_GET_INFO", libc::EINVAL)),
        }
    }

    fn dma_map(
        &self,
        container: HostHandle,
        iova: u64,
        size: u64,
        vaddr: u64,
        perm: DmaPermissions,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(HostCall::DmaMap {
            container,
            iova,
            size,
            vaddr,
            perm,
        });
        let end = iova + size;
        if state
            .dma_map_failures
            .iter()
            .any(|f| *f >= iova && *f < end)
        {
            return Err(host_err("VFIO_IOMMU_MAP_DMA", libc::EFAULT));
        }
        let c = state
            .containers
            .get_mut(&container)
            .ok_or_else(|| host_err("VFIO_IOMMU_MAP_DMA", libc::EBADF))?;
        if size == 0 {
            return Err(host_err("VFIO_IOMMU_MAP_DMA", libc::EINVAL));
        }
        if c.mappings
            .range(..end)
            .any(|(start, len)| start + len > iova)
        {
            return Err(host_err("VFIO_IOMMU_MAP_DMA", libc::EEXIST));
        }
        c.mappings.insert(iova, size);
        Ok(())
    }

    fn dma_unmap(&self, container: HostHandle, iova: u64, size: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(HostCall::DmaUnmap { container, iova, size });
        if state.fail_unmap {
            return Err(host_err("VFIO_IOMMU_UNMAP_DMA", libc::EINVAL));
        }
        let c = state
            .containers
            .get_mut(&container)
            .ok_or_else(|| host_err("VFIO_IOMMU_UNMAP_DMA", libc::EBADF))?;
        let end = iova + size;
        let hit: Vec<(u64, u64)> = c
            .mappings
            .range(..end)
            .filter(|(start, len)| *start + *len > iova)
            .map(|(start, len)| (*start, *len))
            .collect();
        for (start, len) in hit {
            c.mappings.remove(&start);
            if start < iova {
                c.mappings.insert(start, iova - start);
            }
            if start + len > end {
                c.mappings.insert(end, start + len - end);
            }
        }
        Ok(())
    }

    fn open_group(&self, group_id: u32) -> Result<HostHandle> {
        let mut state = self.state.lock().unwrap();
        if state.non_viable.contains(&group_id) {
            return Err(VfioError::GroupNotViable(group_id));
        }
        if state.groups.values().any(|g| g.id == group_id) {
            return Err(host_err("open group", libc::EBUSY));
        }
        let handle = state.alloc();
        state.groups.insert(
            handle,
            MockGroup {
                id: group_id,
                container: None,
            },
        );
        state.calls.push(HostCall::OpenGroup(group_id, handle));
        Ok(handle)
    }

    fn close_group(&self, group: HostHandle) {
        let mut state = self.state.lock().unwrap();
        let g = state.groups.remove(&group).unwrap();
        assert!(g.container.is_none(), "group closed while attached");
        state.calls.push(HostCall::CloseGroup(group));
    }

    fn group_set_container(&self, group: HostHandle, container: HostHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let group_id = match state.groups.get(&group) {
            Some(g) if g.container.is_none() => g.id,
            Some(_) => return Err(host_err("VFIO_GROUP_SET_CONTAINER", libc::EBUSY)),
            None => return Err(host_err("VFIO_GROUP_SET_CONTAINER", libc::EBADF)),
        };
        let class = state.class(group_id);
        let members: Vec<u32> = state
            .containers
            .get(&container)
            .ok_or_else(|| host_err("VFIO_GROUP_SET_CONTAINER", libc::EBADF))?
            .groups
            .iter()
            .filter_map(|h| state.groups.get(h).map(|g| g.id))
            .collect();
        if members.iter().any(|id| state.class(*id) != class) {
            return Err(host_err("VFIO_GROUP_SET_CONTAINER", libc::EPERM));
        }

        state.containers.get_mut(&container).unwrap().groups.insert(group);
        state.groups.get_mut(&group).unwrap().container = Some(container);
        state
            .calls
            .push(HostCall::SetContainer { group, container });
        Ok(())
    }

    fn group_unset_container(&self, group: HostHandle, container: HostHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.groups.get_mut(&group) {
            Some(g) if g.container == Some(container) => g.container = None,
            _ => return Err(host_err("VFIO_GROUP_UNSET_CONTAINER", libc::EINVAL)),
        }
        let c = state.containers.get_mut(&container).unwrap();
        c.groups.remove(&group);
        if c.groups.is_empty() {
            // The backend goes away with the last group.
            c.iommu = None;
            c.mappings.clear();
        }
        state
            .calls
            .push(HostCall::UnsetContainer { group, container });
        Ok(())
    }

    fn open_device(&self, group: HostHandle, name: &str) -> Result<HostHandle> {
        let mut state = self.state.lock().unwrap();
        let group_id = state
            .groups
            .get(&group)
            .filter(|g| g.container.is_some())
            .map(|g| g.id)
            .ok_or_else(|| host_err("VFIO_GROUP_GET_DEVICE_FD", libc::EINVAL))?;
        match state.devices.get(name) {
            Some(d) if d.spec.group != group_id => {
                return Err(host_err("VFIO_GROUP_GET_DEVICE_FD", libc::ENODEV))
            }
            Some(d) if d.busy => return Err(VfioError::DeviceBusy(name.to_owned())),
            Some(_) => {}
            None => return Err(host_err("VFIO_GROUP_GET_DEVICE_FD", libc::ENODEV)),
        }
        let handle = state.alloc();
        state.open_devices.insert(handle, name.to_owned());
        state
            .calls
            .push(HostCall::OpenDevice(name.to_owned(), handle));
        Ok(handle)
    }

    fn close_device(&self, device: HostHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.device(device, "close device")?.busy {
            let name = state.open_devices[&device].clone();
            return Err(VfioError::DeviceBusy(name));
        }
        state.open_devices.remove(&device);
        state.calls.push(HostCall::CloseDevice(device));
        Ok(())
    }

    fn device_info(&self, device: HostHandle) -> Result<DeviceInfo> {
        let mut state = self.state.lock().unwrap();
        let d = state.device(device, "VFIO_DEVICE_GET_INFO")?;
        Ok(DeviceInfo {
            flags: d.spec.flags,
            num_regions: d.spec.regions.len() as u32,
            num_irqs: d.spec.irqs.len() as u32,
        })
    }

    fn region_info(&self, device: HostHandle, index: u32) -> Result<RegionInfo> {
        let mut state = self.state.lock().unwrap();
        let d = state.device(device, "VFIO_DEVICE_GET_REGION_INFO")?;
        let (flags, size) = *d
            .spec
            .regions
            .get(index as usize)
            .ok_or_else(|| host_err("VFIO_DEVICE_GET_REGION_INFO", libc::EINVAL))?;
        Ok(RegionInfo {
            index,
            flags,
            size,
            offset: u64::from(index) * MockDeviceSpec::REGION_STRIDE,
        })
    }

    fn irq_info(&self, device: HostHandle, index: u32) -> Result<IrqInfo> {
        let mut state = self.state.lock().unwrap();
        let d = state.device(device, "VFIO_DEVICE_GET_IRQ_INFO")?;
        let (flags, count) = *d
            .spec
            .irqs
            .get(index as usize)
            .ok_or_else(|| host_err("VFIO_DEVICE_GET_IRQ_INFO", libc::EINVAL))?;
        Ok(IrqInfo {
            index,
            flags,
            count,
        })
    }

    fn mmap_region(
        &self,
        device: HostHandle,
        offset: u64,
        size: u64,
        flags: RegionFlags,
    ) -> io::Result<MmapRegion> {
        let mut state = self.state.lock().unwrap();
        let d = state
            .device(device, "mmap")
            .map_err(|_| io::Error::from_raw_os_error(libc::EBADF))?;
        d.mmap_calls += 1;
        let index = (offset / MockDeviceSpec::REGION_STRIDE) as u32;
        if d.failed_mmaps.contains(&index) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        if d.mmap_limit.is_some_and(|limit| size > limit) {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        MmapRegion::mmap(size, flags.prot(), d.backing.as_file().as_fd(), offset)
    }

    fn region_read(&self, device: HostHandle, offset: u64, data: &mut [u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let d = state.device(device, "pread")?;
        d.trapped += 1;
        d.backing
            .as_file()
            .read_exact_at(data, offset)
            .map_err(|e| VfioError::HostCallFailed {
                op: "pread",
                source: e,
            })
    }

    fn region_write(&self, device: HostHandle, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let d = state.device(device, "pwrite")?;
        d.trapped += 1;
        d.backing
            .as_file()
            .write_all_at(data, offset)
            .map_err(|e| VfioError::HostCallFailed {
                op: "pwrite",
                source: e,
            })
    }

    fn set_irqs(&self, device: HostHandle, irq_set: &IrqSet) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.device(device, "VFIO_DEVICE_SET_IRQS")?;
        state.calls.push(HostCall::SetIrqs(device, irq_set.clone()));
        Ok(())
    }

    fn reset_device(&self, device: HostHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state
            .device(device, "VFIO_DEVICE_RESET")?
            .spec
            .flags
            .contains(DeviceFlags::RESET)
        {
            return Err(host_err("VFIO_DEVICE_RESET", libc::ENOTTY));
        }
        state.calls.push(HostCall::ResetDevice(device));
        Ok(())
    }

    fn hot_reset(&self, device: HostHandle, groups: &[HostHandle]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.device(device, "VFIO_DEVICE_PCI_HOT_RESET")?;
        state.calls.push(HostCall::HotReset {
            device,
            groups: groups.to_vec(),
        });
        if state.fail_hot_reset {
            return Err(host_err("VFIO_DEVICE_PCI_HOT_RESET", libc::EBUSY));
        }
        Ok(())
    }
}

/// Topology source with a fixed identity whose sections follow the
/// transactions applied to it.
pub(crate) struct StaticTopology {
    id: AddressSpaceId,
    sections: Mutex<Vec<MemorySection>>,
}

impl StaticTopology {
    pub(crate) fn new(id: u32, sections: Vec<MemorySection>) -> Arc<Self> {
        Arc::new(StaticTopology {
            id: AddressSpaceId(id),
            sections: Mutex::new(sections),
        })
    }

    /// Applies `txn` to the layout, the way the memory core does before it
    /// publishes the transaction.
    pub(crate) fn apply(&self, txn: &Transaction) {
        let mut sections = self.sections.lock().unwrap();
        for event in txn.ordered() {
            match event {
                TopologyEvent::Remove(s) => sections.retain(|x| x != s),
                TopologyEvent::Add(s) => sections.push(*s),
            }
        }
    }
}

impl MemoryTopology for StaticTopology {
    fn id(&self) -> AddressSpaceId {
        self.id
    }

    fn sections(&self) -> Vec<MemorySection> {
        self.sections.lock().unwrap().clone()
    }
}

/// Guest RAM backed by real host memory, and the RAM section describing it.
pub(crate) fn guest_ram(start: u64, size: usize) -> (GuestMemoryMmap, MemorySection) {
    let mem = GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(start), size)]).unwrap();
    let hva = mem.get_host_address(GuestAddress(start)).unwrap() as u64;
    (
        mem,
        MemorySection::ram(GuestAddress(start), size as u64, hva),
    )
}
