// Copyright © 2025 The vfio-passthrough Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! Second-order mappings driven by a guest visible IOMMU.

use std::fmt;
use std::io;
use std::sync::Arc;

use vm_device::{
    AddressSpaceId, ExternalDmaMapping, GuestIommuId, IommuAccess, IommuTlbEntry, MemorySection,
    SectionKind,
};
use vm_memory::GuestAddress;

use crate::container::{DmaMapping, VfioContainer};
use crate::host::{DmaPermissions, VfioHost};
use crate::registry::VfioRegistry;
use crate::{Result, VfioError};

/// Subscription of a container to the translations published for one
/// guest IOMMU window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct GuestIommuNotifier {
    pub(crate) iommu: GuestIommuId,
    pub(crate) start: u64,
    pub(crate) size: u64,
}

impl GuestIommuNotifier {
    pub(crate) fn new(iommu: GuestIommuId, section: &MemorySection) -> Self {
        GuestIommuNotifier {
            iommu,
            start: section.start.0,
            size: section.size,
        }
    }

    /// Whether `[iova, iova + size)` sits entirely inside the window.
    fn covers(&self, iova: u64, size: u64) -> bool {
        iova >= self.start
            && iova - self.start < self.size
            && size <= self.size - (iova - self.start)
    }
}

impl fmt::Display for GuestIommuNotifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} notifier [0x{:x}, 0x{:x})",
            self.iommu,
            self.start,
            self.start.saturating_add(self.size)
        )
    }
}

/// Host virtual address of `[gpa, gpa + size)` and whether the backing is
/// read-only. The whole range must sit within one RAM section.
fn translate(sections: &[MemorySection], gpa: u64, size: u64) -> Option<(u64, bool)> {
    let end = gpa.checked_add(size)?;
    sections
        .iter()
        .filter(|s| s.kind == SectionKind::Ram)
        .find(|s| s.contains(GuestAddress(gpa)) && end <= s.end())
        .and_then(|s| s.host_address(GuestAddress(gpa)).map(|hva| (hva, s.readonly)))
}

/// Applies one translation entry to `container` if the entry starts in one
/// of its windows. Returns whether the entry was relevant. An entry running
/// past the end of its window is refused.
pub(crate) fn apply_entry(
    host: &dyn VfioHost,
    container: &mut VfioContainer,
    iommu: GuestIommuId,
    entry: &IommuTlbEntry,
    sections: &[MemorySection],
) -> Result<bool> {
    let Some(notifier) = container
        .giommus
        .iter()
        .find(|n| n.iommu == iommu && n.covers(entry.iova, 1))
        .copied()
    else {
        return Ok(false);
    };

    let size = entry.size();
    if !notifier.covers(entry.iova, size) {
        error!(
            "{}: iommu entry [0x{:x}, +0x{:x}) overruns {}",
            container.id, entry.iova, size, notifier
        );
        return Err(VfioError::MappingFailed {
            iova: entry.iova,
            size,
            source: io::Error::from_raw_os_error(libc::EINVAL),
        });
    }

    if entry.is_invalidation() {
        container.dma_unmap(host, entry.iova, size)?;
        return Ok(true);
    }

    let Some((vaddr, readonly)) = translate(sections, entry.translated_addr.0, size) else {
        error!(
            "{}: iommu map to non memory area 0x{:x}",
            container.id, entry.translated_addr.0
        );
        return Err(VfioError::MappingFailed {
            iova: entry.iova,
            size,
            source: io::Error::from_raw_os_error(libc::EFAULT),
        });
    };

    let mut perm = DmaPermissions::empty();
    if entry.perm.readable() {
        perm |= DmaPermissions::READ;
    }
    if entry.perm.writable() && !readonly {
        perm |= DmaPermissions::WRITE;
    }

    // A guest may replace a live translation without invalidating it first.
    container.dma_unmap(host, entry.iova, size)?;
    container.dma_map(
        host,
        DmaMapping {
            iova: entry.iova,
            size,
            vaddr,
            perm,
        },
    )?;
    Ok(true)
}

/// This structure implements the ExternalDmaMapping trait. It is meant to
/// be used when the caller tries to provide a way to update the mappings
/// of every container servicing an address space, based on the
/// translations a guest visible IOMMU publishes for one of its windows.
pub struct VfioDmaMapping {
    registry: Arc<VfioRegistry>,
    space: AddressSpaceId,
    iommu: GuestIommuId,
}

impl VfioDmaMapping {
    pub fn new(registry: Arc<VfioRegistry>, space: AddressSpaceId, iommu: GuestIommuId) -> Self {
        VfioDmaMapping {
            registry,
            space,
            iommu,
        }
    }
}

impl ExternalDmaMapping for VfioDmaMapping {
    fn map(&self, iova: u64, gpa: u64, size: u64, access: IommuAccess) -> io::Result<()> {
        if access == IommuAccess::None {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "mapping without access rights",
            ));
        }
        let entry = IommuTlbEntry::map(iova, GuestAddress(gpa), size, access);
        self.registry
            .notify_guest_iommu(self.space, self.iommu, &entry)
            .map_err(|e| {
                io::Error::other(format!(
                    "failed to map 0x{:x} bytes at iova 0x{:x}: {}",
                    size, iova, e
                ))
            })
    }

    fn unmap(&self, iova: u64, size: u64) -> io::Result<()> {
        let entry = IommuTlbEntry::invalidate(iova, size);
        self.registry
            .notify_guest_iommu(self.space, self.iommu, &entry)
            .map_err(|e| {
                io::Error::other(format!(
                    "failed to unmap 0x{:x} bytes at iova 0x{:x}: {}",
                    size, iova, e
                ))
            })
    }
}
