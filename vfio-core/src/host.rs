// Copyright © 2025 The vfio-passthrough Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! Client side of the host passthrough control interface.

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use vfio_bindings::bindings::vfio::{
    VFIO_DEVICE_FLAGS_PCI, VFIO_DEVICE_FLAGS_PLATFORM, VFIO_DEVICE_FLAGS_RESET,
    VFIO_DMA_MAP_FLAG_READ, VFIO_DMA_MAP_FLAG_WRITE, VFIO_IRQ_INFO_AUTOMASKED,
    VFIO_IRQ_INFO_EVENTFD, VFIO_IRQ_INFO_MASKABLE, VFIO_IRQ_INFO_NORESIZE,
    VFIO_REGION_INFO_FLAG_CAPS, VFIO_REGION_INFO_FLAG_MMAP, VFIO_REGION_INFO_FLAG_READ,
    VFIO_REGION_INFO_FLAG_WRITE, VFIO_TYPE1_IOMMU, VFIO_TYPE1v2_IOMMU,
};

use crate::mmap::MmapRegion;
use crate::Result;

/// Opaque handle to a host object (container, group or device). On Linux
/// it is the file descriptor backing the object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostHandle(pub RawFd);

impl fmt::Display for HostHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "fd{}", self.0)
    }
}

/// IOMMU backend model a container is configured with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IommuType {
    Type1,
    #[default]
    Type1v2,
}

impl IommuType {
    pub fn raw(self) -> u32 {
        match self {
            IommuType::Type1 => VFIO_TYPE1_IOMMU,
            IommuType::Type1v2 => VFIO_TYPE1v2_IOMMU,
        }
    }
}

impl fmt::Display for IommuType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IommuType::Type1 => write!(f, "type1"),
            IommuType::Type1v2 => write!(f, "type1v2"),
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DmaPermissions: u32 {
        const READ = VFIO_DMA_MAP_FLAG_READ;
        const WRITE = VFIO_DMA_MAP_FLAG_WRITE;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        const READ = VFIO_REGION_INFO_FLAG_READ;
        const WRITE = VFIO_REGION_INFO_FLAG_WRITE;
        const MMAP = VFIO_REGION_INFO_FLAG_MMAP;
        const CAPS = VFIO_REGION_INFO_FLAG_CAPS;
    }
}

impl RegionFlags {
    /// `mmap()` protection matching the region access rights.
    pub fn prot(self) -> libc::c_int {
        let mut prot = 0;
        if self.contains(RegionFlags::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(RegionFlags::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        prot
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DeviceFlags: u32 {
        const RESET = VFIO_DEVICE_FLAGS_RESET;
        const PCI = VFIO_DEVICE_FLAGS_PCI;
        const PLATFORM = VFIO_DEVICE_FLAGS_PLATFORM;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct IrqFlags: u32 {
        const EVENTFD = VFIO_IRQ_INFO_EVENTFD;
        const MASKABLE = VFIO_IRQ_INFO_MASKABLE;
        const AUTOMASKED = VFIO_IRQ_INFO_AUTOMASKED;
        const NORESIZE = VFIO_IRQ_INFO_NORESIZE;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub flags: DeviceFlags,
    pub num_regions: u32,
    pub num_irqs: u32,
}

/// Geometry of one device region as reported by the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegionInfo {
    pub index: u32,
    pub flags: RegionFlags,
    pub size: u64,
    /// Offset of the region within the device handle.
    pub offset: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IrqInfo {
    pub index: u32,
    pub flags: IrqFlags,
    pub count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqAction {
    Mask,
    Unmask,
    Trigger,
}

/// Arguments of an interrupt index update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IrqSet {
    pub index: u32,
    pub start: u32,
    pub count: u32,
    pub action: IrqAction,
    /// Eventfds signalled by the host, one per vector, when triggering.
    pub eventfds: Vec<RawFd>,
}

impl IrqSet {
    pub fn mask(index: u32) -> Self {
        IrqSet {
            index,
            start: 0,
            count: 1,
            action: IrqAction::Mask,
            eventfds: Vec::new(),
        }
    }

    pub fn unmask(index: u32) -> Self {
        IrqSet {
            index,
            start: 0,
            count: 1,
            action: IrqAction::Unmask,
            eventfds: Vec::new(),
        }
    }

    /// Tears down every vector of the index.
    pub fn disable(index: u32) -> Self {
        IrqSet {
            index,
            start: 0,
            count: 0,
            action: IrqAction::Trigger,
            eventfds: Vec::new(),
        }
    }

    pub fn trigger(index: u32, eventfds: Vec<RawFd>) -> Self {
        IrqSet {
            index,
            start: 0,
            count: eventfds.len() as u32,
            action: IrqAction::Trigger,
            eventfds,
        }
    }
}

/// Host passthrough control interface.
///
/// Every call is a short, synchronous control-plane operation. The registry
/// serializes them under its lock, so implementations only need to be
/// `Send + Sync` to be shared, not to cope with concurrent callers on the
/// same handle.
pub trait VfioHost: Send + Sync {
    /// Opens a new protection domain handle.
    fn open_container(&self) -> Result<HostHandle>;

    fn close_container(&self, container: HostHandle);

    /// Whether the container supports the given IOMMU model.
    fn check_extension(&self, container: HostHandle, iommu: IommuType) -> Result<bool>;

    /// Attaches the IOMMU backend. Only valid once a group is set.
    fn set_iommu(&self, container: HostHandle, iommu: IommuType) -> Result<()>;

    /// Bitmap of the IO page sizes supported by the container backend.
    fn iommu_pgsizes(&self, container: HostHandle) -> Result<u64>;

    fn dma_map(
        &self,
        container: HostHandle,
        iova: u64,
        size: u64,
        vaddr: u64,
        perm: DmaPermissions,
    ) -> Result<()>;

    fn dma_unmap(&self, container: HostHandle, iova: u64, size: u64) -> Result<()>;

    /// Opens a group, failing with `GroupNotViable` if some of its devices
    /// are still owned by a host driver.
    fn open_group(&self, group_id: u32) -> Result<HostHandle>;

    fn close_group(&self, group: HostHandle);

    fn group_set_container(&self, group: HostHandle, container: HostHandle) -> Result<()>;

    fn group_unset_container(&self, group: HostHandle, container: HostHandle) -> Result<()>;

    fn open_device(&self, group: HostHandle, name: &str) -> Result<HostHandle>;

    fn close_device(&self, device: HostHandle) -> Result<()>;

    fn device_info(&self, device: HostHandle) -> Result<DeviceInfo>;

    fn region_info(&self, device: HostHandle, index: u32) -> Result<RegionInfo>;

    fn irq_info(&self, device: HostHandle, index: u32) -> Result<IrqInfo>;

    /// Maps `size` bytes of the device at `offset` into the caller.
    fn mmap_region(
        &self,
        device: HostHandle,
        offset: u64,
        size: u64,
        flags: RegionFlags,
    ) -> io::Result<MmapRegion>;

    /// Trapped read of `data.len()` bytes at `offset` within the device.
    fn region_read(&self, device: HostHandle, offset: u64, data: &mut [u8]) -> Result<()>;

    /// Trapped write of `data` at `offset` within the device.
    fn region_write(&self, device: HostHandle, offset: u64, data: &[u8]) -> Result<()>;

    fn set_irqs(&self, device: HostHandle, irq_set: &IrqSet) -> Result<()>;

    fn reset_device(&self, device: HostHandle) -> Result<()>;

    /// Resets every device affected by a bus reset of `device`. The caller
    /// proves ownership of the affected devices by passing the handles of
    /// all the groups they belong to.
    fn hot_reset(&self, device: HostHandle, groups: &[HostHandle]) -> Result<()>;
}
