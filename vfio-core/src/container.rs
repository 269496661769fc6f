// Copyright © 2025 The vfio-passthrough Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use vm_device::{AddressSpaceId, MemorySection};

use crate::giommu::GuestIommuNotifier;
use crate::host::{DmaPermissions, HostHandle, IommuType, VfioHost};
use crate::{Result, VfioError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContainerId(pub u32);

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "container{}", self.0)
    }
}

/// Sticky record of the first DMA mapping that failed after the container
/// replayed the topology.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContainerError {
    pub iova: u64,
    pub size: u64,
    pub errno: Option<i32>,
}

/// One IO virtual range installed in the host IOMMU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaMapping {
    pub iova: u64,
    pub size: u64,
    pub vaddr: u64,
    pub perm: DmaPermissions,
}

impl DmaMapping {
    pub fn end(&self) -> u64 {
        self.iova + self.size
    }
}

fn mapping_failed(iova: u64, size: u64, e: VfioError) -> VfioError {
    match e {
        VfioError::HostCallFailed { source, .. } => VfioError::MappingFailed { iova, size, source },
        e => e,
    }
}

/// Flat IO virtual address space backend: every mapping is installed as is.
#[derive(Debug)]
pub(crate) struct Type1Backend {
    model: IommuType,
    pgsize: u64,
    error: Option<ContainerError>,
    mappings: BTreeMap<u64, DmaMapping>,
}

impl Type1Backend {
    pub(crate) fn new(model: IommuType, pgsize: u64) -> Self {
        Type1Backend {
            model,
            pgsize,
            error: None,
            mappings: BTreeMap::new(),
        }
    }

    fn overlapping(&self, iova: u64, size: u64) -> Vec<DmaMapping> {
        let end = iova.saturating_add(size);
        self.mappings
            .range(..end)
            .map(|(_, m)| *m)
            .filter(|m| m.end() > iova)
            .collect()
    }

    fn map(&mut self, host: &dyn VfioHost, handle: HostHandle, mapping: DmaMapping) -> Result<()> {
        if self.mappings.get(&mapping.iova) == Some(&mapping) {
            return Ok(());
        }

        host.dma_map(
            handle,
            mapping.iova,
            mapping.size,
            mapping.vaddr,
            mapping.perm,
        )
        .map_err(|e| mapping_failed(mapping.iova, mapping.size, e))?;
        self.mappings.insert(mapping.iova, mapping);
        Ok(())
    }

    fn unmap(&mut self, host: &dyn VfioHost, handle: HostHandle, iova: u64, size: u64) -> Result<()> {
        let overlapping = self.overlapping(iova, size);
        if overlapping.is_empty() {
            return Ok(());
        }

        host.dma_unmap(handle, iova, size)?;

        let end = iova.saturating_add(size);
        for m in overlapping {
            self.mappings.remove(&m.iova);
            if m.iova < iova {
                let head = DmaMapping {
                    size: iova - m.iova,
                    ..m
                };
                self.mappings.insert(head.iova, head);
            }
            if m.end() > end {
                let tail = DmaMapping {
                    iova: end,
                    size: m.end() - end,
                    vaddr: m.vaddr + (end - m.iova),
                    perm: m.perm,
                };
                self.mappings.insert(tail.iova, tail);
            }
        }
        Ok(())
    }

    fn unmap_all(&mut self, host: &dyn VfioHost, handle: HostHandle) {
        for m in std::mem::take(&mut self.mappings).into_values() {
            if let Err(e) = host.dma_unmap(handle, m.iova, m.size) {
                error!(
                    "Failed to unmap 0x{:x} bytes at 0x{:x} on teardown: {}",
                    m.size, m.iova, e
                );
            }
        }
    }
}

/// IOMMU backend of a container, chosen when it is created and fixed for
/// its lifetime.
#[derive(Debug)]
pub(crate) enum IommuBackend {
    Type1(Type1Backend),
}

impl IommuBackend {
    pub(crate) fn model(&self) -> IommuType {
        match self {
            IommuBackend::Type1(b) => b.model,
        }
    }

    /// Smallest IO page size, the alignment of every mapping.
    pub(crate) fn pgsize(&self) -> u64 {
        match self {
            IommuBackend::Type1(b) => b.pgsize,
        }
    }

    pub(crate) fn error(&self) -> Option<ContainerError> {
        match self {
            IommuBackend::Type1(b) => b.error,
        }
    }

    /// Records `error` unless an earlier one is still pending.
    pub(crate) fn record_error(&mut self, error: ContainerError) {
        match self {
            IommuBackend::Type1(b) => {
                b.error.get_or_insert(error);
            }
        }
    }

    pub(crate) fn clear_error(&mut self) -> Option<ContainerError> {
        match self {
            IommuBackend::Type1(b) => b.error.take(),
        }
    }

    pub(crate) fn mappings(&self) -> Vec<DmaMapping> {
        match self {
            IommuBackend::Type1(b) => b.mappings.values().copied().collect(),
        }
    }

    fn map(&mut self, host: &dyn VfioHost, handle: HostHandle, mapping: DmaMapping) -> Result<()> {
        match self {
            IommuBackend::Type1(b) => b.map(host, handle, mapping),
        }
    }

    fn unmap(&mut self, host: &dyn VfioHost, handle: HostHandle, iova: u64, size: u64) -> Result<()> {
        match self {
            IommuBackend::Type1(b) => b.unmap(host, handle, iova, size),
        }
    }

    fn unmap_all(&mut self, host: &dyn VfioHost, handle: HostHandle) {
        match self {
            IommuBackend::Type1(b) => b.unmap_all(host, handle),
        }
    }

    fn release(&mut self) {
        match self {
            IommuBackend::Type1(b) => {
                assert!(
                    b.mappings.is_empty(),
                    "IOMMU backend released with {} live mappings",
                    b.mappings.len()
                );
            }
        }
    }
}

/// One IOMMU protection domain.
#[derive(Debug)]
pub(crate) struct VfioContainer {
    pub(crate) id: ContainerId,
    pub(crate) space: AddressSpaceId,
    pub(crate) handle: HostHandle,
    pub(crate) backend: IommuBackend,
    pub(crate) giommus: Vec<GuestIommuNotifier>,
    pub(crate) groups: BTreeSet<u32>,
    pub(crate) refcount: u32,
    // Sections whose mapping failed and is waiting for a retry.
    pub(crate) pending: Vec<MemorySection>,
}

impl VfioContainer {
    pub(crate) fn new(
        id: ContainerId,
        space: AddressSpaceId,
        handle: HostHandle,
        backend: IommuBackend,
    ) -> Self {
        VfioContainer {
            id,
            space,
            handle,
            backend,
            giommus: Vec::new(),
            groups: BTreeSet::new(),
            refcount: 0,
            pending: Vec::new(),
        }
    }

    /// Installs `mapping`. Mapping the very same range again is a no-op.
    pub(crate) fn dma_map(&mut self, host: &dyn VfioHost, mapping: DmaMapping) -> Result<()> {
        self.backend.map(host, self.handle, mapping)
    }

    /// Removes whatever is mapped within `[iova, iova + size)`. Nothing is
    /// sent to the host when the range was never mapped.
    pub(crate) fn dma_unmap(&mut self, host: &dyn VfioHost, iova: u64, size: u64) -> Result<()> {
        self.backend.unmap(host, self.handle, iova, size)
    }

    /// Detaches every guest IOMMU notifier and drops every mapping, then
    /// releases the backend. Unmap failures are logged only.
    ///
    /// # Panics
    ///
    /// If the backend still tracks a mapping after the unmap pass.
    pub(crate) fn teardown(&mut self, host: &dyn VfioHost) {
        for notifier in self.giommus.drain(..) {
            debug!("{}: detaching {}", self.id, notifier);
        }
        self.pending.clear();
        self.backend.unmap_all(host, self.handle);
        self.backend.release();
    }
}
