// Copyright © 2025 The vfio-passthrough Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use crate::iommu::IommuAccess;

/// Trait meant for triggering the DMA mapping update related to an external
/// device whose translations are owned by a guest visible IOMMU. The IOMMU
/// model calls it anytime the guest updates one of its translation tables.
pub trait ExternalDmaMapping: Send + Sync {
    /// Map `size` bytes at IO virtual address `iova` onto guest physical
    /// address `gpa`.
    fn map(&self, iova: u64, gpa: u64, size: u64, access: IommuAccess) -> std::io::Result<()>;

    /// Unmap a memory range
    fn unmap(&self, iova: u64, size: u64) -> std::io::Result<()>;
}
