// Copyright © 2019 Intel Corporation
// Copyright © 2025 The vfio-passthrough Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! [`VfioHost`] on top of the Linux `/dev/vfio` interface.

use std::collections::HashMap;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::mem;
use std::os::fd::AsFd;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::prelude::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use byteorder::{ByteOrder, LittleEndian};
use vfio_bindings::bindings::vfio::*;
use vmm_sys_util::ioctl::{ioctl, ioctl_with_mut_ref, ioctl_with_ptr, ioctl_with_ref, ioctl_with_val};

use crate::host::{
    DeviceFlags, DeviceInfo, DmaPermissions, HostHandle, IommuType, IrqAction, IrqFlags, IrqInfo,
    IrqSet, RegionFlags, RegionInfo, VfioHost,
};
use crate::mmap::MmapRegion;
use crate::vfio_ioctls::*;
use crate::{vec_with_array_field, Result, VfioError};

const VFIO_CONTAINER_PATH: &str = "/dev/vfio/vfio";
const VFIO_GROUP_DIR: &str = "/dev/vfio";

fn last_error(op: &'static str) -> VfioError {
    VfioError::HostCallFailed {
        op,
        source: io::Error::last_os_error(),
    }
}

fn bad_handle(op: &'static str) -> VfioError {
    VfioError::HostCallFailed {
        op,
        source: io::Error::from_raw_os_error(libc::EBADF),
    }
}

/// Host backend owning the container, group and device files it opened.
/// Handles are the raw file descriptors; closing a handle drops its file.
#[derive(Default)]
pub struct LinuxVfioHost {
    files: Mutex<HashMap<RawFd, File>>,
}

impl LinuxVfioHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves the IOMMU group of the device at `sysfs_path`, typically
    /// `/sys/bus/pci/devices/<bdf>`.
    pub fn group_id(sysfs_path: &Path) -> io::Result<u32> {
        let link: PathBuf = [sysfs_path, Path::new("iommu_group")].iter().collect();
        let group_path = link.read_link()?;
        group_path
            .file_name()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid IOMMU group link {}", group_path.display()),
                )
            })
    }

    fn insert(&self, file: File) -> HostHandle {
        let fd = file.as_raw_fd();
        self.files.lock().unwrap().insert(fd, file);
        HostHandle(fd)
    }

    fn remove(&self, handle: HostHandle) -> Option<File> {
        self.files.lock().unwrap().remove(&handle.0)
    }

    fn with_file<T>(
        &self,
        handle: HostHandle,
        op: &'static str,
        f: impl FnOnce(&File) -> Result<T>,
    ) -> Result<T> {
        let files = self.files.lock().unwrap();
        let file = files.get(&handle.0).ok_or_else(|| bad_handle(op))?;
        f(file)
    }
}

impl VfioHost for LinuxVfioHost {
    fn open_container(&self) -> Result<HostHandle> {
        let container = OpenOptions::new()
            .read(true)
            .write(true)
            .open(VFIO_CONTAINER_PATH)
            .map_err(|e| VfioError::HostCallFailed {
                op: "open container",
                source: e,
            })?;

        // SAFETY: the file is a VFIO container and the request takes no
        // argument.
        let version = unsafe { ioctl(&container, VFIO_GET_API_VERSION()) };
        if version as u32 != VFIO_API_VERSION {
            return Err(VfioError::HostCallFailed {
                op: "VFIO_GET_API_VERSION",
                source: io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("unsupported API version {}", version),
                ),
            });
        }

        Ok(self.insert(container))
    }

    fn close_container(&self, container: HostHandle) {
        if self.remove(container).is_none() {
            warn!("Closing unknown container {}", container);
        }
    }

    fn check_extension(&self, container: HostHandle, iommu: IommuType) -> Result<bool> {
        self.with_file(container, "VFIO_CHECK_EXTENSION", |file| {
            // SAFETY: the file is a VFIO container and the argument is a
            // plain integer.
            let ret = unsafe { ioctl_with_val(file, VFIO_CHECK_EXTENSION(), iommu.raw().into()) };
            if ret < 0 {
                return Err(last_error("VFIO_CHECK_EXTENSION"));
            }
            Ok(ret == 1)
        })
    }

    fn set_iommu(&self, container: HostHandle, iommu: IommuType) -> Result<()> {
        self.with_file(container, "VFIO_SET_IOMMU", |file| {
            // SAFETY: the file is a VFIO container and the argument is a
            // plain integer.
            let ret = unsafe { ioctl_with_val(file, VFIO_SET_IOMMU(), iommu.raw().into()) };
            if ret < 0 {
                return Err(last_error("VFIO_SET_IOMMU"));
            }
            Ok(())
        })
    }

    fn iommu_pgsizes(&self, container: HostHandle) -> Result<u64> {
        self.with_file(container, "VFIO_IOMMU_GET_INFO", |file| {
            let mut info = vfio_iommu_type1_info {
                argsz: mem::size_of::<vfio_iommu_type1_info>() as u32,
                ..Default::default()
            };
            // SAFETY: the file is a VFIO container and info is large enough
            // for what argsz announces.
            let ret = unsafe { ioctl_with_mut_ref(file, VFIO_IOMMU_GET_INFO(), &mut info) };
            if ret < 0 {
                return Err(last_error("VFIO_IOMMU_GET_INFO"));
            }
            if info.flags & VFIO_IOMMU_INFO_PGSIZES == 0 {
                return Ok(0);
            }
            Ok(info.iova_pgsizes)
        })
    }

    fn dma_map(
        &self,
        container: HostHandle,
        iova: u64,
        size: u64,
        vaddr: u64,
        perm: DmaPermissions,
    ) -> Result<()> {
        self.with_file(container, "VFIO_IOMMU_MAP_DMA", |file| {
            let dma_map = vfio_iommu_type1_dma_map {
                argsz: mem::size_of::<vfio_iommu_type1_dma_map>() as u32,
                flags: perm.bits(),
                vaddr,
                iova,
                size,
            };
            // SAFETY: the file is a VFIO container, dma_map is built by us
            // and the return value is checked.
            let ret = unsafe { ioctl_with_ref(file, VFIO_IOMMU_MAP_DMA(), &dma_map) };
            if ret != 0 {
                return Err(last_error("VFIO_IOMMU_MAP_DMA"));
            }
            Ok(())
        })
    }

    fn dma_unmap(&self, container: HostHandle, iova: u64, size: u64) -> Result<()> {
        self.with_file(container, "VFIO_IOMMU_UNMAP_DMA", |file| {
            let mut dma_unmap = vfio_iommu_type1_dma_unmap {
                argsz: mem::size_of::<vfio_iommu_type1_dma_unmap>() as u32,
                iova,
                size,
                ..Default::default()
            };
            // SAFETY: the file is a VFIO container, dma_unmap is built by us
            // and the return value is checked.
            let ret = unsafe { ioctl_with_mut_ref(file, VFIO_IOMMU_UNMAP_DMA(), &mut dma_unmap) };
            if ret != 0 {
                return Err(last_error("VFIO_IOMMU_UNMAP_DMA"));
            }
            if dma_unmap.size != size {
                debug!(
                    "Unmapped 0x{:x} bytes at 0x{:x}, 0x{:x} requested",
                    dma_unmap.size, iova, size
                );
            }
            Ok(())
        })
    }

    fn open_group(&self, group_id: u32) -> Result<HostHandle> {
        let group_path = Path::new(VFIO_GROUP_DIR).join(group_id.to_string());
        let group = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&group_path)
            .map_err(|e| VfioError::HostCallFailed {
                op: "open group",
                source: e,
            })?;

        let mut group_status = vfio_group_status {
            argsz: mem::size_of::<vfio_group_status>() as u32,
            flags: 0,
        };
        // SAFETY: we own the group file and group_status is a valid value.
        let ret = unsafe { ioctl_with_mut_ref(&group, VFIO_GROUP_GET_STATUS(), &mut group_status) };
        if ret < 0 {
            return Err(last_error("VFIO_GROUP_GET_STATUS"));
        }
        if group_status.flags & VFIO_GROUP_FLAGS_VIABLE == 0 {
            return Err(VfioError::GroupNotViable(group_id));
        }

        debug!("Opened group {} at {}", group_id, group_path.display());
        Ok(self.insert(group))
    }

    fn close_group(&self, group: HostHandle) {
        if self.remove(group).is_none() {
            warn!("Closing unknown group {}", group);
        }
    }

    fn group_set_container(&self, group: HostHandle, container: HostHandle) -> Result<()> {
        self.with_file(group, "VFIO_GROUP_SET_CONTAINER", |file| {
            let container_raw_fd: RawFd = container.0;
            // SAFETY: we own the group file and container_raw_fd is a
            // valid value.
            let ret =
                unsafe { ioctl_with_ref(file, VFIO_GROUP_SET_CONTAINER(), &container_raw_fd) };
            if ret < 0 {
                return Err(last_error("VFIO_GROUP_SET_CONTAINER"));
            }
            Ok(())
        })
    }

    fn group_unset_container(&self, group: HostHandle, container: HostHandle) -> Result<()> {
        self.with_file(group, "VFIO_GROUP_UNSET_CONTAINER", |file| {
            let container_raw_fd: RawFd = container.0;
            // SAFETY: we own the group file and container_raw_fd is a
            // valid value.
            let ret =
                unsafe { ioctl_with_ref(file, VFIO_GROUP_UNSET_CONTAINER(), &container_raw_fd) };
            if ret < 0 {
                return Err(last_error("VFIO_GROUP_UNSET_CONTAINER"));
            }
            Ok(())
        })
    }

    fn open_device(&self, group: HostHandle, name: &str) -> Result<HostHandle> {
        let path = CString::new(name).map_err(|e| VfioError::HostCallFailed {
            op: "VFIO_GROUP_GET_DEVICE_FD",
            source: io::Error::new(io::ErrorKind::InvalidInput, e),
        })?;

        let device = self.with_file(group, "VFIO_GROUP_GET_DEVICE_FD", |file| {
            // SAFETY: we own the group file and path is a valid C string.
            let fd = unsafe { ioctl_with_ptr(file, VFIO_GROUP_GET_DEVICE_FD(), path.as_ptr()) };
            if fd < 0 {
                let e = io::Error::last_os_error();
                if e.raw_os_error() == Some(libc::EBUSY) {
                    return Err(VfioError::DeviceBusy(name.to_owned()));
                }
                return Err(VfioError::HostCallFailed {
                    op: "VFIO_GROUP_GET_DEVICE_FD",
                    source: e,
                });
            }
            // SAFETY: fd was just returned by the kernel and nothing else
            // owns it.
            Ok(unsafe { File::from_raw_fd(fd) })
        })?;

        Ok(self.insert(device))
    }

    fn close_device(&self, device: HostHandle) -> Result<()> {
        self.remove(device)
            .map(drop)
            .ok_or_else(|| bad_handle("close device"))
    }

    fn device_info(&self, device: HostHandle) -> Result<DeviceInfo> {
        self.with_file(device, "VFIO_DEVICE_GET_INFO", |file| {
            let mut dev_info = vfio_device_info {
                argsz: mem::size_of::<vfio_device_info>() as u32,
                ..Default::default()
            };
            // SAFETY: we own the device file and dev_info is a valid value.
            let ret = unsafe { ioctl_with_mut_ref(file, VFIO_DEVICE_GET_INFO(), &mut dev_info) };
            if ret < 0 {
                return Err(last_error("VFIO_DEVICE_GET_INFO"));
            }
            Ok(DeviceInfo {
                flags: DeviceFlags::from_bits_truncate(dev_info.flags),
                num_regions: dev_info.num_regions,
                num_irqs: dev_info.num_irqs,
            })
        })
    }

    fn region_info(&self, device: HostHandle, index: u32) -> Result<RegionInfo> {
        self.with_file(device, "VFIO_DEVICE_GET_REGION_INFO", |file| {
            let mut reg_info = vfio_region_info {
                argsz: mem::size_of::<vfio_region_info>() as u32,
                index,
                ..Default::default()
            };
            // SAFETY: we own the device file and reg_info is a valid value.
            let ret =
                unsafe { ioctl_with_mut_ref(file, VFIO_DEVICE_GET_REGION_INFO(), &mut reg_info) };
            if ret < 0 {
                return Err(last_error("VFIO_DEVICE_GET_REGION_INFO"));
            }
            Ok(RegionInfo {
                index,
                flags: RegionFlags::from_bits_truncate(reg_info.flags),
                size: reg_info.size,
                offset: reg_info.offset,
            })
        })
    }

    fn irq_info(&self, device: HostHandle, index: u32) -> Result<IrqInfo> {
        self.with_file(device, "VFIO_DEVICE_GET_IRQ_INFO", |file| {
            let mut irq_info = vfio_irq_info {
                argsz: mem::size_of::<vfio_irq_info>() as u32,
                index,
                ..Default::default()
            };
            // SAFETY: we own the device file and irq_info is a valid value.
            let ret =
                unsafe { ioctl_with_mut_ref(file, VFIO_DEVICE_GET_IRQ_INFO(), &mut irq_info) };
            if ret < 0 {
                return Err(last_error("VFIO_DEVICE_GET_IRQ_INFO"));
            }
            Ok(IrqInfo {
                index,
                flags: IrqFlags::from_bits_truncate(irq_info.flags),
                count: irq_info.count,
            })
        })
    }

    fn mmap_region(
        &self,
        device: HostHandle,
        offset: u64,
        size: u64,
        flags: RegionFlags,
    ) -> io::Result<MmapRegion> {
        let files = self.files.lock().unwrap();
        let file = files
            .get(&device.0)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
        MmapRegion::mmap(size, flags.prot(), file.as_fd(), offset)
    }

    fn region_read(&self, device: HostHandle, offset: u64, data: &mut [u8]) -> Result<()> {
        self.with_file(device, "pread", |file| {
            file.read_exact_at(data, offset)
                .map_err(|e| VfioError::HostCallFailed {
                    op: "pread",
                    source: e,
                })
        })
    }

    fn region_write(&self, device: HostHandle, offset: u64, data: &[u8]) -> Result<()> {
        self.with_file(device, "pwrite", |file| {
            file.write_all_at(data, offset)
                .map_err(|e| VfioError::HostCallFailed {
                    op: "pwrite",
                    source: e,
                })
        })
    }

    fn set_irqs(&self, device: HostHandle, irq_set: &IrqSet) -> Result<()> {
        let fd_bytes = irq_set.eventfds.len() * mem::size_of::<u32>();
        let mut raw = vec_with_array_field::<vfio_irq_set, u32>(irq_set.eventfds.len());
        raw[0].argsz = (mem::size_of::<vfio_irq_set>() + fd_bytes) as u32;
        raw[0].flags = match irq_set.action {
            IrqAction::Mask => VFIO_IRQ_SET_ACTION_MASK | VFIO_IRQ_SET_DATA_NONE,
            IrqAction::Unmask => VFIO_IRQ_SET_ACTION_UNMASK | VFIO_IRQ_SET_DATA_NONE,
            IrqAction::Trigger if irq_set.eventfds.is_empty() => {
                VFIO_IRQ_SET_ACTION_TRIGGER | VFIO_IRQ_SET_DATA_NONE
            }
            IrqAction::Trigger => VFIO_IRQ_SET_ACTION_TRIGGER | VFIO_IRQ_SET_DATA_EVENTFD,
        };
        raw[0].index = irq_set.index;
        raw[0].start = irq_set.start;
        raw[0].count = irq_set.count;

        {
            // SAFETY: raw was allocated with room for one u32 per eventfd
            // after the header.
            let fds = unsafe { raw[0].data.as_mut_slice(fd_bytes) };
            for (index, fd) in irq_set.eventfds.iter().enumerate() {
                let offset = index * mem::size_of::<u32>();
                LittleEndian::write_u32(&mut fds[offset..offset + mem::size_of::<u32>()], *fd as u32);
            }
        }

        self.with_file(device, "VFIO_DEVICE_SET_IRQS", |file| {
            // SAFETY: we own the device file and raw is a valid value.
            let ret = unsafe { ioctl_with_ref(file, VFIO_DEVICE_SET_IRQS(), &raw[0]) };
            if ret < 0 {
                return Err(last_error("VFIO_DEVICE_SET_IRQS"));
            }
            Ok(())
        })
    }

    fn reset_device(&self, device: HostHandle) -> Result<()> {
        self.with_file(device, "VFIO_DEVICE_RESET", |file| {
            // SAFETY: we own the device file and the request takes no
            // argument.
            let ret = unsafe { ioctl(file, VFIO_DEVICE_RESET()) };
            if ret < 0 {
                return Err(last_error("VFIO_DEVICE_RESET"));
            }
            Ok(())
        })
    }

    fn hot_reset(&self, device: HostHandle, groups: &[HostHandle]) -> Result<()> {
        let mut reset = vec_with_array_field::<vfio_pci_hot_reset, i32>(groups.len());
        reset[0].argsz =
            (mem::size_of::<vfio_pci_hot_reset>() + groups.len() * mem::size_of::<i32>()) as u32;
        reset[0].count = groups.len() as u32;
        {
            // SAFETY: reset was allocated with room for one fd per group
            // after the header.
            let fds = unsafe { reset[0].group_fds.as_mut_slice(groups.len()) };
            for (slot, group) in fds.iter_mut().zip(groups) {
                *slot = group.0;
            }
        }

        self.with_file(device, "VFIO_DEVICE_PCI_HOT_RESET", |file| {
            // SAFETY: we own the device file and reset is a valid value.
            let ret = unsafe { ioctl_with_ref(file, VFIO_DEVICE_PCI_HOT_RESET(), &reset[0]) };
            if ret < 0 {
                return Err(last_error("VFIO_DEVICE_PCI_HOT_RESET"));
            }
            Ok(())
        })
    }
}
