// Copyright © 2025 The vfio-passthrough Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! Contracts shared between the passthrough core and the collaborators that
//! drive it: the source of guest memory topology changes and the guest
//! visible IOMMU model.

pub mod dma_mapping;
pub mod iommu;
pub mod topology;

pub use dma_mapping::ExternalDmaMapping;
pub use iommu::{GuestIommuId, IommuAccess, IommuTlbEntry};
pub use topology::{
    AddressSpaceId, MemorySection, MemoryTopology, SectionKind, TopologyEvent, Transaction,
};
