// Copyright © 2019 Intel Corporation
// Copyright © 2025 The vfio-passthrough Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! Resource and synchronization layer for VFIO device passthrough.
//!
//! The host kernel exposes three kinds of objects through its passthrough
//! interface. A *container* is one IOMMU protection domain: a set of IO
//! virtual address translation tables. A *group* is the minimal set of
//! devices the IOMMU can isolate from the rest of the system; groups are the
//! unit of ownership and every group joins exactly one container. A *device*
//! is opened by name inside a group and exposes regions (register banks,
//! configuration space, ...) and interrupt indexes.
//!
//! This crate keeps those objects alive and consistent on behalf of a
//! virtual machine monitor:
//! - [`VfioRegistry`] is the process-wide registry. It binds guest address
//!   spaces to containers, joins groups and opens devices, with reference
//!   counting so that groups which must share an IOMMU domain share one
//!   container.
//! - The mapping listener keeps every container's IOMMU tables in sync with
//!   the guest memory topology ([`VfioRegistry::commit`]), including the
//!   second-order translations published by a guest visible IOMMU
//!   ([`VfioRegistry::notify_guest_iommu`]).
//! - Region accesses go through a dispatcher which uses a direct `mmap()`
//!   window when one is installed and allowed, and traps into the host
//!   otherwise.
//! - Reset handling coordinates the devices sharing a reset domain.
//!
//! All host interaction goes through the [`VfioHost`] trait. [`LinuxVfioHost`]
//! implements it on top of `/dev/vfio`.

#[macro_use]
extern crate log;
#[cfg(target_os = "linux")]
#[macro_use]
extern crate vmm_sys_util;

mod config;
mod container;
mod device;
mod giommu;
mod group;
mod host;
#[cfg(target_os = "linux")]
mod linux;
mod listener;
mod mmap;
mod region;
mod registry;
mod reset;
#[cfg(test)]
mod test_util;
#[cfg(target_os = "linux")]
mod vfio_ioctls;

use std::io;
use std::mem::size_of;

use thiserror::Error;
use vm_device::AddressSpaceId;

pub use config::{MapRetryPolicy, VfioConfig};
pub use container::{ContainerError, ContainerId, DmaMapping};
pub use device::{DeviceCapabilities, DeviceId, DeviceType, VfioDevice, VfioDeviceOps};
pub use giommu::VfioDmaMapping;
pub use host::{
    DeviceFlags, DeviceInfo, DmaPermissions, HostHandle, IommuType, IrqAction, IrqFlags, IrqInfo,
    IrqSet, RegionFlags, RegionInfo, VfioHost,
};
#[cfg(target_os = "linux")]
pub use linux::LinuxVfioHost;
pub use mmap::MmapRegion;
pub use region::{AccessPath, MapState, VfioRegion};
pub use registry::{ResetOutcome, VfioRegistry};
pub use reset::{ResetDomain, ResetMember};

#[derive(Debug, Error)]
pub enum VfioError {
    #[error("Host passthrough call {op} failed: {source}")]
    HostCallFailed {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("Group {group} is bound to container {bound}, it cannot join container {requested}")]
    GroupContainerConflict {
        group: u32,
        bound: ContainerId,
        requested: ContainerId,
    },
    #[error("Group {group} is already used in address space {space}")]
    GroupAddressSpaceConflict { group: u32, space: AddressSpaceId },
    #[error("IOMMU model {0} is not supported by the container")]
    UnsupportedIommuModel(IommuType),
    #[error("Failed to map 0x{size:x} bytes at 0x{iova:x}: {source}")]
    MappingFailed {
        iova: u64,
        size: u64,
        #[source]
        source: io::Error,
    },
    #[error("Device {0} does not support reset")]
    ResetUnsupported(String),
    #[error("Device {0} is busy")]
    DeviceBusy(String),
    #[error("Group {0} is not viable, are all its devices bound to vfio?")]
    GroupNotViable(u32),
    #[error("Unknown container {0}")]
    UnknownContainer(ContainerId),
    #[error("Unknown group {0}")]
    UnknownGroup(u32),
    #[error("Unknown device {0}")]
    UnknownDevice(DeviceId),
    #[error("Device {0} is already open in group {1}")]
    DeviceAlreadyOpen(String, u32),
    #[error("Invalid region index {0}")]
    InvalidRegion(u32),
    #[error("Invalid IRQ index {0}")]
    InvalidIrqIndex(u32),
    #[error("Invalid region access at offset 0x{offset:x} with width {width}")]
    InvalidAccess { offset: u64, width: usize },
    #[error("Region {0} does not permit this access")]
    AccessDenied(u32),
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[source] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, VfioError>;

impl VfioError {
    /// Host errno carried by the error, if any.
    pub fn errno(&self) -> Option<i32> {
        match self {
            VfioError::HostCallFailed { source, .. } | VfioError::MappingFailed { source, .. } => {
                source.raw_os_error()
            }
            _ => None,
        }
    }
}

// Returns a `Vec<T>` with a size in bytes at least as large as `size_in_bytes`.
fn vec_with_size_in_bytes<T: Default>(size_in_bytes: usize) -> Vec<T> {
    let rounded_size = size_in_bytes.div_ceil(size_of::<T>());
    let mut v = Vec::with_capacity(rounded_size);
    v.resize_with(rounded_size, T::default);
    v
}

// The VFIO API has structures ending with a flexible array member, like
// `vfio_irq_set` or `vfio_pci_hot_reset`. `size_of::<T>()` does not account
// for the trailing entries, so a `Vec<T>` large enough for `count` entries is
// allocated instead and only its first element is used as a `T`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn vec_with_array_field<T: Default, F>(count: usize) -> Vec<T> {
    let element_space = count * size_of::<F>();
    let vec_size_bytes = size_of::<T>() + element_space;
    vec_with_size_in_bytes(vec_size_bytes)
}
